// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Staggered CA restarts.
//!
//! Restart requests are recorded per namespace in the `ca-restart-config`
//! ConfigMap. An instance is restarted once a request is pending and its
//! previous restart is older than the configured wait time.

use crate::constants::{annotations, labels, names, OPERATOR_NAME, RESTART_MANAGER};
use crate::error::{OperatorError, Result};
use crate::types::ibpca::IBPCA;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ObjectMeta, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Why a restart was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    ConfigOverride,
    CryptoUpdate,
    TlsCertRenewal,
    Migration,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Reason::ConfigOverride => "configOverride",
            Reason::CryptoUpdate => "cryptoUpdate",
            Reason::TlsCertRenewal => "tlsCertRenewal",
            Reason::Migration => "migration",
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRestart {
    #[serde(default)]
    pub requests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<String>,
}

impl InstanceRestart {
    fn last_restart(&self) -> Option<DateTime<Utc>> {
        self.last_restart
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Contents of the `ca-restart-config` ConfigMap
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RestartConfig {
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceRestart>,
}

impl RestartConfig {
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self> {
        match cm.data.as_ref().and_then(|d| d.get(names::RESTART_CONFIG_KEY)) {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(Self::default()),
        }
    }

    pub fn to_config_map(&self, namespace: &str) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(names::RESTART_CONFIG.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    labels::MANAGED_BY.to_string(),
                    labels::MANAGED_BY_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                names::RESTART_CONFIG_KEY.to_string(),
                serde_json::to_string(self)?,
            )])),
            ..Default::default()
        })
    }

    /// Instances with at least one outstanding request
    pub fn pending_instances(&self) -> Vec<String> {
        self.instances
            .iter()
            .filter(|(_, entry)| !entry.requests.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Record a request, returns false when it was already pending
    pub fn request(&mut self, instance: &str, reason: Reason) -> bool {
        let entry = self.instances.entry(instance.to_string()).or_default();
        let reason = reason.to_string();
        if entry.requests.contains(&reason) {
            return false;
        }
        entry.requests.push(reason);
        true
    }

    fn mark_restarted(&mut self, instance: &str, at: DateTime<Utc>) {
        let entry = self.instances.entry(instance.to_string()).or_default();
        entry.requests.clear();
        entry.last_restart = Some(at.to_rfc3339());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No request pending
    Idle,
    Restart,
    /// A request is pending but the instance restarted too recently
    Wait(Duration),
}

/// Decide what to do for one instance
pub fn decide(entry: Option<&InstanceRestart>, now: DateTime<Utc>, wait: Duration) -> Decision {
    let Some(entry) = entry.filter(|e| !e.requests.is_empty()) else {
        return Decision::Idle;
    };
    let Some(last) = entry.last_restart() else {
        return Decision::Restart;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= wait {
        Decision::Restart
    } else {
        Decision::Wait(wait - elapsed)
    }
}

pub struct RestartManager {
    client: Client,
    wait: Duration,
    // Serializes read-modify-write of the shared ConfigMap across reconciles
    lock: Mutex<()>,
}

impl RestartManager {
    pub fn new(client: Client, wait: Duration) -> Self {
        Self {
            client,
            wait,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self, namespace: &str) -> Result<RestartConfig> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(names::RESTART_CONFIG).await? {
            Some(cm) => RestartConfig::from_config_map(&cm),
            None => Ok(RestartConfig::default()),
        }
    }

    async fn save(&self, namespace: &str, config: &RestartConfig) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = config.to_config_map(namespace)?;
        api.patch(
            names::RESTART_CONFIG,
            &PatchParams::apply(OPERATOR_NAME).force(),
            &Patch::Apply(&cm),
        )
        .await?;
        Ok(())
    }

    /// Queue a restart of the instance
    #[instrument(skip(self, ca), fields(ca = %ca.key()))]
    pub async fn request(&self, ca: &IBPCA, reason: Reason) -> Result<()> {
        let _guard = self.lock.lock().await;
        let namespace = ca.namespace().unwrap_or_default();
        let mut config = self.load(&namespace).await?;
        if config.request(&ca.name_any(), reason) {
            info!("Restart requested for {} ({})", ca.key(), reason);
            self.save(&namespace, &config).await?;
        }
        Ok(())
    }

    /// Restart the instance if a request is due.
    ///
    /// Returns how long to wait before checking again when a request is
    /// pending but held back by the wait time.
    #[instrument(skip(self, ca), fields(ca = %ca.key()))]
    pub async fn trigger_if_needed(&self, ca: &IBPCA) -> Result<Option<Duration>> {
        let _guard = self.lock.lock().await;
        let namespace = ca.namespace().unwrap_or_default();
        let name = ca.name_any();
        let mut config = self.load(&namespace).await?;
        let now = Utc::now();

        match decide(config.instances.get(&name), now, self.wait) {
            Decision::Idle => Ok(None),
            Decision::Wait(remaining) => {
                debug!(
                    "Restart of {} held back for another {}s",
                    ca.key(),
                    remaining.as_secs()
                );
                Ok(Some(remaining))
            }
            Decision::Restart => {
                self.restart_deployment(ca, now).await?;
                config.mark_restarted(&name, now);
                self.save(&namespace, &config).await?;
                Ok(None)
            }
        }
    }

    /// Restart right away, used by the restart action
    #[instrument(skip(self, ca), fields(ca = %ca.key()))]
    pub async fn restart_now(&self, ca: &IBPCA) -> Result<()> {
        let _guard = self.lock.lock().await;
        let namespace = ca.namespace().unwrap_or_default();
        let mut config = self.load(&namespace).await?;
        let now = Utc::now();
        self.restart_deployment(ca, now).await?;
        config.mark_restarted(&ca.name_any(), now);
        self.save(&namespace, &config).await
    }

    /// Bump the pod template annotation so the deployment rolls its pods
    async fn restart_deployment(&self, ca: &IBPCA, at: DateTime<Utc>) -> Result<()> {
        let api: Api<Deployment> =
            Api::namespaced(self.client.clone(), &ca.namespace().unwrap_or_default());
        let patch = restart_patch(at);
        let params = PatchParams {
            field_manager: Some(RESTART_MANAGER.to_string()),
            ..Default::default()
        };
        match api.patch(&ca.name_any(), &params, &Patch::Merge(&patch)).await {
            Ok(_) => {
                info!("Restarted deployment {}", ca.key());
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                debug!("Deployment {} does not exist yet, nothing to restart", ca.key());
                Ok(())
            }
            Err(e) => Err(OperatorError::RestartFailed(e.to_string())),
        }
    }
}

fn restart_patch(at: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        (annotations::RESTARTED_AT): at.to_rfc3339()
                    }
                }
            }
        }
    })
}
