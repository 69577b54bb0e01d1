// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::config::Config;
use crate::constants::{annotations, ports};
use crate::error::Result;
use crate::resources::{apply, endpoints, object_meta, Endpoints};
use crate::types::ibpca::IBPCA;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Expose the API and operations ports through the ingress controller
#[instrument(skip(client, ca, config), fields(ca = %ca.key()))]
pub async fn reconcile(client: &Client, ca: &IBPCA, config: &Config) -> Result<()> {
    let Some(endpoints) = endpoints(ca, config) else {
        debug!("No domain configured, skipping ingress");
        return Ok(());
    };
    apply(client, &build(ca, config, &endpoints)).await?;
    Ok(())
}

pub fn build(ca: &IBPCA, config: &Config, endpoints: &Endpoints) -> Ingress {
    let class = ca
        .spec
        .ingress
        .as_ref()
        .and_then(|i| i.class.clone())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| config.ingress_class.clone());

    let mut metadata = object_meta(ca, ca.name_any());
    // TLS terminates in the CA itself
    metadata.annotations = Some(BTreeMap::from([
        (
            annotations::NGINX_SSL_PASSTHROUGH.to_string(),
            "true".to_string(),
        ),
        (
            annotations::NGINX_BACKEND_PROTOCOL.to_string(),
            "HTTPS".to_string(),
        ),
    ]));

    let service = ca.name_any();
    Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: Some(class),
            rules: Some(vec![
                rule(&endpoints.api, &service, ports::API),
                rule(&endpoints.operations, &service, ports::OPERATIONS),
            ]),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![endpoints.api.clone(), endpoints.operations.clone()]),
                secret_name: None,
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

fn rule(host: &str, service: &str, port: i32) -> IngressRule {
    IngressRule {
        host: Some(host.to_string()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "ImplementationSpecific".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: service.to_string(),
                        port: Some(ServiceBackendPort {
                            number: Some(port),
                            name: None,
                        }),
                    }),
                    resource: None,
                },
            }],
        }),
    }
}
