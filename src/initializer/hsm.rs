// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! HSM support: operator HSM configuration, strategy selection and the init
//! Job that creates CA keys inside the HSM.

use crate::config::Config;
use crate::constants::{crypto_keys, names, paths};
use crate::error::{OperatorError, Result};
use crate::resources::deployment::{config_map_volume, empty_dir, env, mount, secret_volume};
use crate::resources::{delete_if_exists, object_meta};
use crate::types::ibpca::{CaKind, IBPCA};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvVar, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);
const INIT_CONFIG_DIR: &str = "/config/init";
const INIT_OUTPUT_DIR: &str = "/output";
/// File name `fabric-ca-server init` writes the CA certificate to
const INIT_CERT_FILE: &str = "ca-cert.pem";

/// Where CA private keys live
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Keys are files in the crypto secret
    Software,
    /// Keys live in an HSM reached through a PKCS#11 proxy
    Proxy { endpoint: String },
    /// Keys live in an HSM reached through a vendor daemon sidecar
    Daemon(HsmConfig),
}

impl Strategy {
    pub fn is_hsm(&self) -> bool {
        !matches!(self, Strategy::Software)
    }
}

/// Operator wide HSM settings from the `ibp-hsm-config` ConfigMap
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HsmConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<HsmLibrary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<HsmEnv>,
    #[serde(default, rename = "mountpaths", skip_serializing_if = "Vec::is_empty")]
    pub mount_paths: Vec<HsmMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon: Option<HsmDaemon>,
}

/// Image carrying the vendor PKCS#11 library
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HsmLibrary {
    pub filepath: String,
    pub image: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HsmEnv {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Secret with client configuration mounted into HSM containers
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HsmMount {
    pub name: String,
    pub secret: String,
    #[serde(rename = "mountpath")]
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct HsmDaemon {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<HsmEnv>,
}

impl HsmConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| OperatorError::ConfigError(format!("invalid {}: {}", names::HSM_CONFIG, e)))
    }

    pub fn secret_volumes(&self) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = Vec::new();
        for m in &self.mount_paths {
            if volumes.iter().all(|v| v.name != m.name) {
                volumes.push(secret_volume(&m.name, m.secret.clone()));
            }
        }
        volumes
    }

    /// Init container copying the vendor library into the `hsm-library` volume
    pub fn library_copy_container(&self) -> Option<Container> {
        let library = self.library.as_ref()?;
        Some(Container {
            name: "hsm-client".to_string(),
            image: Some(library.image.clone()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "mkdir -p {dir} && cp {file} {dir}/",
                    dir = paths::HSM_LIBRARY_DIR,
                    file = library.filepath
                ),
            ]),
            volume_mounts: Some(vec![mount("hsm-library", paths::HSM_LIBRARY_DIR)]),
            ..Default::default()
        })
    }

    pub fn volume_mounts(&self) -> Vec<VolumeMount> {
        let mut mounts = Vec::new();
        if self.library.is_some() {
            mounts.push(mount("hsm-library", paths::HSM_LIBRARY_DIR));
        }
        if self.daemon.is_some() {
            mounts.push(mount("hsm-shared", paths::HSM_SHARED));
        }
        mounts.extend(self.mount_paths.iter().map(|m| VolumeMount {
            name: m.name.clone(),
            mount_path: m.mount_path.clone(),
            sub_path: m.sub_path.clone(),
            ..Default::default()
        }));
        mounts
    }

    pub fn env_vars(&self) -> Vec<EnvVar> {
        self.envs.iter().map(|e| env(&e.name, &e.value)).collect()
    }

    pub fn daemon_container(&self, image_override: Option<String>) -> Option<Container> {
        let daemon = self.daemon.as_ref()?;
        Some(Container {
            name: "hsm-daemon".to_string(),
            image: Some(image_override.unwrap_or_else(|| daemon.image.clone())),
            env: Some(daemon.envs.iter().map(|e| env(&e.name, &e.value)).collect()),
            volume_mounts: Some(self.volume_mounts()),
            ..Default::default()
        })
    }
}

/// Load the operator HSM config, `None` when it does not exist
#[instrument(skip(client))]
pub async fn load(client: &Client, operator_namespace: &str) -> Result<Option<HsmConfig>> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), operator_namespace);
    let Some(cm) = api.get_opt(names::HSM_CONFIG).await? else {
        return Ok(None);
    };
    let Some(raw) = cm.data.as_ref().and_then(|d| d.get(names::HSM_CONFIG_KEY)) else {
        return Err(OperatorError::ConfigError(format!(
            "{} has no {} key",
            names::HSM_CONFIG,
            names::HSM_CONFIG_KEY
        )));
    };
    HsmConfig::from_yaml(raw).map(Some)
}

/// Pick the key strategy for an instance.
///
/// A proxy endpoint on the instance wins over the operator daemon config.
pub fn select_strategy(ca: &IBPCA, pkcs11: bool, hsm: Option<&HsmConfig>) -> Result<Strategy> {
    if !pkcs11 {
        return Ok(Strategy::Software);
    }
    if let Some(endpoint) = ca.hsm_proxy_endpoint() {
        return Ok(Strategy::Proxy {
            endpoint: endpoint.to_string(),
        });
    }
    match hsm {
        Some(config) if config.daemon.is_some() => Ok(Strategy::Daemon(config.clone())),
        _ => Err(OperatorError::InvalidSpec(
            "bccsp is set to PKCS11 but neither hsm.pkcs11endpoint nor an HSM daemon is configured"
                .to_string(),
        )),
    }
}

pub fn init_config_map_name(ca: &IBPCA, kind: CaKind) -> String {
    format!("{}-init-config", ca.init_job_name(kind))
}

/// ConfigMap holding the config `fabric-ca-server init` runs with
pub fn build_init_config_map(ca: &IBPCA, kind: CaKind, config_yaml: String) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(ca, init_config_map_name(ca, kind)),
        data: Some(
            [(paths::SERVER_CONFIG_FILE.to_string(), config_yaml)]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

/// Init Job: `fabric-ca-server init` creates the key in the HSM, then the
/// operator binary uploads the resulting certificate into the crypto secret.
pub fn build_job(
    ca: &IBPCA,
    kind: CaKind,
    strategy: &Strategy,
    ca_image: &str,
    operator_image: &str,
) -> Result<Job> {
    let mut volumes = vec![
        config_map_volume("init-config", init_config_map_name(ca, kind)),
        empty_dir("init-output"),
    ];
    let mut init_env = vec![env("FABRIC_CA_SERVER_HOME", INIT_OUTPUT_DIR)];
    let mut init_mounts = vec![
        mount("init-config", INIT_CONFIG_DIR),
        mount("init-output", INIT_OUTPUT_DIR),
    ];
    let mut init_containers = Vec::new();

    match strategy {
        Strategy::Software => {
            return Err(OperatorError::HsmJobFailed(
                "init job requested for a software CA".to_string(),
            ))
        }
        Strategy::Proxy { endpoint } => {
            init_env.push(env("PKCS11_PROXY_SOCKET", endpoint));
        }
        Strategy::Daemon(hsm) => {
            volumes.push(empty_dir("hsm-shared"));
            volumes.extend(hsm.secret_volumes());
            if let Some(copy) = hsm.library_copy_container() {
                volumes.push(empty_dir("hsm-library"));
                init_containers.push(copy);
            }
            // Native sidecar, stops with the job
            if let Some(mut daemon) = hsm.daemon_container(None) {
                daemon.restart_policy = Some("Always".to_string());
                init_containers.push(daemon);
            }
            init_env.extend(hsm.env_vars());
            init_mounts.extend(hsm.volume_mounts());
        }
    }

    init_containers.push(Container {
        name: "ca-init".to_string(),
        image: Some(ca_image.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "fabric-ca-server init --home {out} --config {dir}/{file}",
                out = INIT_OUTPUT_DIR,
                dir = INIT_CONFIG_DIR,
                file = paths::SERVER_CONFIG_FILE
            ),
        ]),
        env: Some(init_env),
        volume_mounts: Some(init_mounts),
        ..Default::default()
    });

    let upload = Container {
        name: "upload".to_string(),
        image: Some(operator_image.to_string()),
        args: Some(vec![
            "upload-crypto".to_string(),
            "--namespace".to_string(),
            ca.namespace().unwrap_or_default(),
            "--secret".to_string(),
            ca.crypto_secret_name(kind),
            "--file".to_string(),
            format!("{}={}/{}", crypto_keys::CERT, INIT_OUTPUT_DIR, INIT_CERT_FILE),
        ]),
        volume_mounts: Some(vec![mount("init-output", INIT_OUTPUT_DIR)]),
        ..Default::default()
    };

    Ok(Job {
        metadata: object_meta(ca, ca.init_job_name(kind)),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    service_account_name: Some(ca.name_any()),
                    restart_policy: Some("Never".to_string()),
                    init_containers: Some(init_containers),
                    containers: vec![upload],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Run an init Job to completion.
///
/// The Job and its ConfigMap are removed on success. A failed Job is left in
/// place so its logs can be inspected.
#[instrument(skip(client, ca, job, config_map, config), fields(ca = %ca.key(), kind = %kind))]
pub async fn run_init_job(
    client: &Client,
    ca: &IBPCA,
    kind: CaKind,
    job: Job,
    config_map: ConfigMap,
    config: &Config,
) -> Result<()> {
    let namespace = ca.namespace().unwrap_or_default();
    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    let name = ca.init_job_name(kind);

    if jobs.get_opt(&name).await?.is_some() {
        info!("Removing previous init job {}", name);
        delete_if_exists::<Job>(client, &namespace, &name).await?;
        wait_for_deletion(&jobs, &name, config.hsm_job_timeout).await?;
    }

    crate::resources::apply_config_map(client, &config_map).await?;
    jobs.create(&PostParams::default(), &job).await?;
    info!("Created HSM init job {}", name);

    let deadline = Instant::now() + config.hsm_job_timeout;
    loop {
        let current = jobs.get(&name).await?;
        match job_state(&current) {
            JobState::Succeeded => break,
            JobState::Failed => {
                warn!("HSM init job {} failed, leaving it for inspection", name);
                return Err(OperatorError::HsmJobFailed(format!("job {} failed", name)));
            }
            JobState::Running => {}
        }
        if Instant::now() >= deadline {
            return Err(OperatorError::HsmJobFailed(format!(
                "job {} did not complete within {}s",
                name,
                config.hsm_job_timeout.as_secs()
            )));
        }
        debug!("Waiting for HSM init job {}", name);
        sleep(JOB_POLL_INTERVAL).await;
    }

    info!("HSM init job {} completed", name);
    delete_if_exists::<Job>(client, &namespace, &name).await?;
    delete_if_exists::<ConfigMap>(client, &namespace, &init_config_map_name(ca, kind)).await?;
    Ok(())
}

async fn wait_for_deletion(jobs: &Api<Job>, name: &str, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while jobs.get_opt(name).await?.is_some() {
        if Instant::now() >= deadline {
            return Err(OperatorError::HsmJobFailed(format!(
                "previous job {} was not removed in time",
                name
            )));
        }
        sleep(JOB_POLL_INTERVAL).await;
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum JobState {
    Running,
    Succeeded,
    Failed,
}

fn job_state(job: &Job) -> JobState {
    let Some(status) = job.status.as_ref() else {
        return JobState::Running;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        JobState::Succeeded
    } else if status.failed.unwrap_or(0) > 0 {
        JobState::Failed
    } else {
        JobState::Running
    }
}
