// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! IBPCA reconciler - drives each instance through the offering and keeps
//! its status current.

use crate::config::Config;
use crate::constants::{labels, OPERATOR_VERSION};
use crate::error::{OperatorError, Result};
use crate::offering::{Offering, OfferingStatus, ReconcileResult};
use crate::types::ibpca::{CaStatus, StatusType, Versions, IBPCA};
use crate::update::{EventClassifier, UpdateQueue};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::{
    api::{ListParams, Patch, PatchParams},
    runtime::{controller::Action, Controller},
    Api, Client, Resource, ResourceExt,
};
use kube_runtime::watcher::Config as WatcherConfig;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Delay before retrying after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Delay used to run queued updates right away
const REQUEUE_NOW: Duration = Duration::from_millis(100);

const REASON_ERROR: &str = "errorOccurredDuringReconcile";
const REASON_DEPLOYED: &str = "allPodsRunning";
const REASON_DEPLOYING: &str = "waitingForPods";

pub struct CaReconciler {
    client: Client,
    config: Arc<Config>,
    queue: Arc<UpdateQueue>,
    classifier: Arc<EventClassifier>,
    offering: Offering,
}

impl CaReconciler {
    pub fn new(client: Client, config: Config) -> Self {
        let config = Arc::new(config);
        let queue = Arc::new(UpdateQueue::new());
        let classifier = Arc::new(EventClassifier::new(queue.clone()));
        let offering = Offering::new(client.clone(), config.clone(), classifier.clone());
        Self {
            client,
            config,
            queue,
            classifier,
            offering,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        match &self.config.watch_namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let cas: Api<IBPCA> = self.api();
        let deployments: Api<Deployment> = self.api();
        let secrets: Api<Secret> = self.api();
        let config_maps: Api<ConfigMap> = self.api();
        let managed = WatcherConfig::default().labels(&labels::managed_selector());

        match &self.config.watch_namespace {
            Some(namespace) => info!("Watching IBPCA instances in namespace {}", namespace),
            None => info!("Watching IBPCA instances in all namespaces"),
        }

        let secret_classifier = self.classifier.clone();
        let config_map_classifier = self.classifier.clone();
        let context = Arc::new(self);

        Controller::new(cas, WatcherConfig::default())
            .owns(deployments, managed.clone())
            .watches(secrets, managed.clone(), move |secret| {
                secret_classifier.classify_secret(&secret)
            })
            .watches(config_maps, managed, move |config_map| {
                config_map_classifier.classify_config_map(&config_map)
            })
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled IBPCA: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }

    /// All pods of the instance are running with every container ready
    async fn pods_ready(&self, ca: &IBPCA) -> Result<bool> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &ca.namespace().unwrap_or_default());
        let selector = format!("{}={}", labels::APP, ca.name_any());
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(pods_ready(&pods.items))
    }

    async fn observed_status(&self, ca: &IBPCA, result: &ReconcileResult) -> Result<Observed> {
        if let Some(status) = &result.status {
            return Ok(Observed::Offering(status.clone()));
        }
        Ok(Observed::Pods {
            ready: self.pods_ready(ca).await?,
        })
    }

    /// Patch the status subresource when it differs from the current one
    #[instrument(skip(self, ca, observed), fields(ca = %ca.key()))]
    async fn set_status(&self, ca: &IBPCA, observed: &Observed, completed: bool) -> Result<()> {
        let Some(status) = next_status(ca, observed, completed, &Utc::now().to_rfc3339()) else {
            debug!("Status unchanged");
            return Ok(());
        };
        let api: Api<IBPCA> =
            Api::namespaced(self.client.clone(), &ca.namespace().unwrap_or_default());
        api.patch_status(
            &ca.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&json!({ "status": status })),
        )
        .await?;
        info!(
            "Status of {} is now {}",
            ca.key(),
            status.status_type.map(|t| t.to_string()).unwrap_or_default()
        );
        Ok(())
    }
}

/// What the status is computed from
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Error { code: i32, message: String },
    Offering(OfferingStatus),
    Pods { ready: bool },
}

impl From<&OperatorError> for Observed {
    fn from(e: &OperatorError) -> Self {
        Observed::Error {
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Status to write, `None` when nothing but the heartbeat would change.
///
/// `versions.reconciled` only moves to the spec version once a pass ran the
/// whole sequence; requeued and failed passes keep the previous value.
pub fn next_status(ca: &IBPCA, observed: &Observed, completed: bool, now: &str) -> Option<CaStatus> {
    let current = ca.status.clone().unwrap_or_default();
    let (status_type, reason, message, error_code) = match observed {
        Observed::Error { code, message } => (
            StatusType::Error,
            REASON_ERROR.to_string(),
            message.clone(),
            Some(*code),
        ),
        Observed::Offering(status) => (
            status.status_type,
            status.reason.clone(),
            status.message.clone(),
            None,
        ),
        Observed::Pods { ready: true } => (
            StatusType::Deployed,
            REASON_DEPLOYED.to_string(),
            "All pods running".to_string(),
            None,
        ),
        Observed::Pods { ready: false } => (
            StatusType::Deploying,
            REASON_DEPLOYING.to_string(),
            "Waiting for pods to become ready".to_string(),
            None,
        ),
    };

    let versions = match observed {
        Observed::Offering(_) | Observed::Pods { .. } if completed => Some(Versions {
            reconciled: ca.spec.fabric_version.clone(),
        }),
        _ => current.versions.clone(),
    };

    let mut next = CaStatus {
        status_type: Some(status_type),
        status: Some("True".to_string()),
        reason: Some(reason),
        message: Some(message),
        last_heartbeat_time: current.last_heartbeat_time.clone(),
        version: Some(OPERATOR_VERSION.to_string()),
        versions,
        error_code,
    };
    if next == current {
        return None;
    }
    next.last_heartbeat_time = Some(now.to_string());
    Some(next)
}

pub fn pods_ready(pods: &[Pod]) -> bool {
    !pods.is_empty()
        && pods.iter().all(|pod| {
            let Some(status) = pod.status.as_ref() else {
                return false;
            };
            status.phase.as_deref() == Some("Running")
                && status
                    .container_statuses
                    .as_ref()
                    .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready))
        })
}

async fn reconcile(ca: Arc<IBPCA>, ctx: Arc<CaReconciler>) -> Result<Action> {
    let key = ca.key();

    if ca.metadata.deletion_timestamp.is_some() {
        debug!("IBPCA {} is being deleted", key);
        ctx.classifier.forget(&ca);
        return Ok(Action::await_change());
    }

    ctx.classifier.observe_spec(&ctx.client, &ca).await?;
    let update = ctx.queue.peek(&key);
    ctx.queue.pop(&key);
    debug!("Reconciling {} with update {:?}", key, update.true_flags());

    let result = match ctx.offering.reconcile(&ca, &update).await {
        Ok(result) => result,
        Err(e) => {
            if let Err(status_err) = ctx.set_status(&ca, &Observed::from(&e), false).await {
                warn!("Failed to record error status on {}: {}", key, status_err);
            }
            if e.is_breaking() {
                error!("IBPCA {} cannot be reconciled until it changes: {}", key, e);
                return Ok(Action::await_change());
            }
            if !update.is_empty() {
                ctx.queue.push(&key, update);
            }
            return Err(e);
        }
    };

    let observed = ctx.observed_status(&ca, &result).await?;
    ctx.set_status(&ca, &observed, !result.requeue).await?;

    Ok(next_action(&ctx, &key, update, &result))
}

fn next_action(
    ctx: &CaReconciler,
    key: &str,
    update: crate::update::Update,
    result: &ReconcileResult,
) -> Action {
    if result.requeue {
        if !update.is_empty() {
            ctx.queue.push(key, update);
        }
        return Action::requeue(REQUEUE_NOW);
    }
    if ctx.queue.not_empty(key) {
        return Action::requeue(REQUEUE_NOW);
    }
    let interval = ctx.config.reconcile_interval;
    Action::requeue(result.requeue_after.map_or(interval, |after| after.min(interval)))
}

fn error_policy(ca: Arc<IBPCA>, error: &OperatorError, _ctx: Arc<CaReconciler>) -> Action {
    error!("Reconciliation of {} failed: {}", ca.key(), error);
    Action::requeue(ERROR_REQUEUE)
}
