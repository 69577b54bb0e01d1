// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{defaults, ports};
use crate::error::Result;
use crate::resources::{apply, object_meta, selector_labels};
use crate::types::ibpca::IBPCA;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Client, ResourceExt};
use tracing::instrument;

#[instrument(skip(client, ca), fields(ca = %ca.key()))]
pub async fn reconcile(client: &Client, ca: &IBPCA) -> Result<()> {
    apply(client, &build(ca)).await?;
    Ok(())
}

pub fn build(ca: &IBPCA) -> Service {
    let service_type = ca
        .spec
        .service
        .as_ref()
        .and_then(|s| s.service_type.clone())
        .unwrap_or_else(|| defaults::SERVICE_TYPE.to_string());

    Service {
        metadata: object_meta(ca, ca.name_any()),
        spec: Some(ServiceSpec {
            type_: Some(service_type),
            selector: Some(selector_labels(ca)),
            ports: Some(vec![
                port("https", ports::API),
                port("operations", ports::OPERATIONS),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// In-cluster DNS names the CA answers on
pub fn cluster_hosts(ca: &IBPCA) -> Vec<String> {
    let name = ca.name_any();
    let namespace = ca.namespace().unwrap_or_default();
    vec![
        name.clone(),
        format!("{}.{}", name, namespace),
        format!("{}.{}.svc", name, namespace),
        format!("{}.{}.svc.cluster.local", name, namespace),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ibpca::tests::{accepted_spec, make_ca};
    use crate::types::ibpca::ServiceSpec as CaServiceSpec;

    #[test]
    fn test_service_ports_and_type() {
        let mut spec = accepted_spec();
        spec.service = Some(CaServiceSpec {
            service_type: Some("NodePort".to_string()),
        });
        let svc = build(&make_ca("org1ca", spec));
        let spec = svc.spec.unwrap();

        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        let ports: Vec<i32> = spec.ports.unwrap().iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![7054, 9443]);
        assert_eq!(spec.selector.unwrap()["app"], "org1ca");
    }

    #[test]
    fn test_default_type_is_cluster_ip() {
        let svc = build(&make_ca("org1ca", accepted_spec()));
        assert_eq!(svc.spec.unwrap().type_.as_deref(), Some("ClusterIP"));
    }

    #[test]
    fn test_cluster_hosts() {
        let hosts = cluster_hosts(&make_ca("org1ca", accepted_spec()));
        assert!(hosts.contains(&"org1ca.fabric.svc.cluster.local".to_string()));
        assert_eq!(hosts.len(), 4);
    }
}
