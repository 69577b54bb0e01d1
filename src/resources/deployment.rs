// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CA Deployment: one pod running the enrollment CA with the TLS CA as an
//! additional CA file.

use crate::constants::{paths, ports};
use crate::error::{OperatorError, Result};
use crate::initializer::hsm::{HsmConfig, Strategy};
use crate::resources::{apply, object_meta, selector_labels, standard_labels};
use crate::types::ibpca::{CaKind, ResourceSpec, IBPCA};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    HTTPGetAction, LocalObjectReference, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{info, instrument};

/// Reconcile the CA deployment
#[instrument(skip(client, ca, strategy), fields(ca = %ca.key()))]
pub async fn reconcile(client: &Client, ca: &IBPCA, strategy: &Strategy) -> Result<()> {
    let deployment = build(ca, strategy)?;
    apply(client, &deployment).await?;
    info!("Deployment {} reconciled", ca.name_any());
    Ok(())
}

pub fn pvc_name(ca: &IBPCA) -> String {
    format!("{}-pvc", ca.name_any())
}

/// Build the desired Deployment
pub fn build(ca: &IBPCA, strategy: &Strategy) -> Result<Deployment> {
    let images = ca.spec.images.clone().unwrap_or_default();
    let ca_image = images.ca().ok_or_else(|| {
        OperatorError::InvalidSpec("images.caImage and images.caTag must be set".to_string())
    })?;
    let init_image = images.ca_init().ok_or_else(|| {
        OperatorError::InvalidSpec("images.caInitImage and images.caInitTag must be set".to_string())
    })?;
    let resources = ca.spec.resources.clone().unwrap_or_default();

    let mut init_containers = vec![init_container(&init_image, resources.init.as_ref())];
    let mut containers = vec![ca_container(ca_image, resources.ca.as_ref())];
    let mut volumes = base_volumes(ca);

    match strategy {
        Strategy::Software => {}
        Strategy::Proxy { endpoint } => {
            containers[0].env.get_or_insert_with(Vec::new).push(EnvVar {
                name: "PKCS11_PROXY_SOCKET".to_string(),
                value: Some(endpoint.clone()),
                ..Default::default()
            });
        }
        Strategy::Daemon(hsm) => {
            add_hsm_daemon(
                hsm,
                images.hsm(),
                resources.hsm_daemon.as_ref(),
                &mut init_containers,
                &mut containers,
                &mut volumes,
            );
        }
    }

    let replicas = ca.replicas();
    // A single replica runs sqlite on the PVC, two pods must never overlap
    let deployment_strategy = (replicas <= 1).then(|| DeploymentStrategy {
        type_: Some("Recreate".to_string()),
        ..Default::default()
    });

    let image_pull_secrets = (!ca.spec.image_pull_secrets.is_empty()).then(|| {
        ca.spec
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect()
    });

    Ok(Deployment {
        metadata: object_meta(ca, ca.name_any()),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(ca)),
                ..Default::default()
            },
            strategy: deployment_strategy,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(ca)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(ca.name_any()),
                    image_pull_secrets,
                    init_containers: Some(init_containers),
                    containers,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn init_container(image: &str, resources: Option<&ResourceSpec>) -> Container {
    Container {
        name: "init".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p {}/ca {}/tlsca", paths::DATA, paths::DATA),
        ]),
        volume_mounts: Some(vec![mount("ca-data", paths::DATA)]),
        resources: resource_requirements(resources),
        ..Default::default()
    }
}

fn ca_container(image: String, resources: Option<&ResourceSpec>) -> Container {
    let command = format!(
        "fabric-ca-server start --home {home} --config {ca}/{file} --cafiles {tlsca}/{file}",
        home = paths::CA_HOME,
        ca = paths::CA_CONFIG,
        tlsca = paths::TLSCA_CONFIG,
        file = paths::SERVER_CONFIG_FILE,
    );

    Container {
        name: "ca".to_string(),
        image: Some(image),
        command: Some(vec!["sh".to_string(), "-c".to_string(), command]),
        env: Some(vec![
            env("LICENSE", "accept"),
            env("FABRIC_CA_HOME", paths::CA_HOME),
            env("FABRIC_CA_SERVER_HOME", paths::CA_HOME),
        ]),
        ports: Some(vec![
            container_port("https", ports::API),
            container_port("operations", ports::OPERATIONS),
        ]),
        liveness_probe: Some(cainfo_probe(30)),
        readiness_probe: Some(cainfo_probe(10)),
        volume_mounts: Some(vec![
            mount("ca-data", paths::DATA),
            mount("ca-crypto", paths::CA_CRYPTO),
            mount("tlsca-crypto", paths::TLSCA_CRYPTO),
            mount("ca-config", paths::CA_CONFIG),
            mount("tlsca-config", paths::TLSCA_CONFIG),
        ]),
        resources: resource_requirements(resources),
        ..Default::default()
    }
}

fn add_hsm_daemon(
    hsm: &HsmConfig,
    image_override: Option<String>,
    resources: Option<&ResourceSpec>,
    init_containers: &mut Vec<Container>,
    containers: &mut Vec<Container>,
    volumes: &mut Vec<Volume>,
) {
    volumes.push(empty_dir("hsm-shared"));
    volumes.extend(hsm.secret_volumes());

    if let Some(library) = hsm.library_copy_container() {
        volumes.push(empty_dir("hsm-library"));
        init_containers.push(library);
    }

    let hsm_mounts = hsm.volume_mounts();
    let hsm_env = hsm.env_vars();
    let ca = &mut containers[0];
    ca.env.get_or_insert_with(Vec::new).extend(hsm_env);
    ca.volume_mounts
        .get_or_insert_with(Vec::new)
        .extend(hsm_mounts.iter().cloned());

    if let Some(mut daemon) = hsm.daemon_container(image_override) {
        daemon.resources = resource_requirements(resources).or(daemon.resources);
        containers.push(daemon);
    }
}

fn base_volumes(ca: &IBPCA) -> Vec<Volume> {
    vec![
        Volume {
            name: "ca-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name(ca),
                ..Default::default()
            }),
            ..Default::default()
        },
        secret_volume("ca-crypto", ca.crypto_secret_name(CaKind::Enrollment)),
        secret_volume("tlsca-crypto", ca.crypto_secret_name(CaKind::Tls)),
        config_map_volume("ca-config", ca.config_map_name(CaKind::Enrollment)),
        config_map_volume("tlsca-config", ca.config_map_name(CaKind::Tls)),
    ]
}

fn cainfo_probe(initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/cainfo".to_string()),
            port: IntOrString::Int(ports::API),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        timeout_seconds: Some(5),
        failure_threshold: Some(5),
        ..Default::default()
    }
}

/// Convert quantity strings from the spec into k8s resource requirements
pub fn resource_requirements(spec: Option<&ResourceSpec>) -> Option<ResourceRequirements> {
    let spec = spec?;
    let to_quantities = |m: &BTreeMap<String, String>| {
        (!m.is_empty()).then(|| {
            m.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };
    Some(ResourceRequirements {
        requests: to_quantities(&spec.requests),
        limits: to_quantities(&spec.limits),
        ..Default::default()
    })
}

pub fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

pub fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

pub fn secret_volume(name: &str, secret: String) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn config_map_volume(name: &str, config_map: String) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}
