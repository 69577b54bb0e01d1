// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Turns watch events into queued updates, the way event predicates would.

use crate::constants::names;
use crate::error::Result;
use crate::restart::RestartConfig;
use crate::types::ibpca::{CaKind, IbpcaSpec, IBPCA};
use crate::update::flags::Update;
use crate::update::queue::UpdateQueue;
use crate::update::spec_state;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::runtime::reflector::ObjectRef;
use kube::{Client, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Remembers what each watched object looked like last time and pushes the
/// difference onto the update queue.
#[derive(Debug)]
pub struct EventClassifier {
    queue: Arc<UpdateQueue>,
    started_at: DateTime<Utc>,
    specs: Mutex<HashMap<String, IbpcaSpec>>,
    secrets: Mutex<HashMap<String, String>>,
    /// Fingerprints of secret contents the operator wrote itself
    acknowledged: Mutex<HashMap<String, HashSet<String>>>,
}

impl EventClassifier {
    pub fn new(queue: Arc<UpdateQueue>) -> Self {
        Self::started_at(queue, Utc::now())
    }

    pub fn started_at(queue: Arc<UpdateQueue>, started_at: DateTime<Utc>) -> Self {
        Self {
            queue,
            started_at,
            specs: Mutex::new(HashMap::new()),
            secrets: Mutex::new(HashMap::new()),
            acknowledged: Mutex::new(HashMap::new()),
        }
    }

    /// Compare the spec of an instance with the last one seen and queue the diff.
    ///
    /// After an operator restart the in-memory spec is gone; instances that
    /// were reconciled before fall back to the spec saved in their
    /// `<name>-spec` ConfigMap.
    pub async fn observe_spec(&self, client: &Client, ca: &IBPCA) -> Result<Update> {
        let key = ca.key();
        let cached = lock(&self.specs).get(&key).cloned();

        let previous = match cached {
            Some(spec) => Some(spec),
            None if ca.has_status_type() => {
                info!(
                    "Operator restart detected, performing update checks on existing CA '{}'",
                    key
                );
                match spec_state::load(client, ca).await {
                    Ok(spec) => spec,
                    Err(e) => {
                        warn!("Failed to load saved spec for '{}': {}", key, e);
                        None
                    }
                }
            }
            None => None,
        };

        let update = self.record_spec(&key, previous.as_ref(), &ca.spec);
        Ok(update)
    }

    /// Store the new spec and queue its diff against the previous one
    fn record_spec(&self, key: &str, previous: Option<&IbpcaSpec>, current: &IbpcaSpec) -> Update {
        let update = previous
            .map(|prev| Update::from_spec_diff(prev, current))
            .unwrap_or_default();

        lock(&self.specs).insert(key.to_string(), current.clone());

        if !update.is_empty() {
            debug!("Spec change on '{}': {:?}", key, update.true_flags());
            self.queue.push(key, update);
        }
        update
    }

    /// Watch mapper for crypto secrets
    pub fn classify_secret(&self, secret: &Secret) -> Vec<ObjectRef<IBPCA>> {
        let name = secret.name_any();
        let Some((instance, kind)) = crypto_secret_owner(&name) else {
            return vec![];
        };
        let namespace = secret.namespace().unwrap_or_default();
        let key = format!("{}/{}", namespace, instance);
        let fingerprint = fingerprint(secret.data.as_ref());
        let secret_key = format!("{}/{}", namespace, name);

        let previous = lock(&self.secrets).insert(secret_key.clone(), fingerprint.clone());
        let own_write = lock(&self.acknowledged)
            .get_mut(&secret_key)
            .is_some_and(|seen| seen.remove(&fingerprint));
        if own_write {
            debug!("Secret '{}' was written by the operator", name);
            return vec![];
        }

        let update = match previous {
            Some(prev) if prev == fingerprint => return vec![],
            Some(_) => {
                info!("{} crypto secret '{}' was updated", kind, name);
                Update {
                    ca_crypto_updated: true,
                    restart_needed: true,
                    ..Default::default()
                }
            }
            None if self.created_after_start(secret) => {
                info!("{} crypto secret '{}' was created", kind, name);
                Update {
                    ca_crypto_created: true,
                    ..Default::default()
                }
            }
            // Existing secret seen for the first time after startup
            None => return vec![],
        };

        self.queue.push(&key, update);
        vec![ObjectRef::new(instance).within(&namespace)]
    }

    /// Watch mapper for the restart bookkeeping ConfigMap
    pub fn classify_config_map(&self, config_map: &ConfigMap) -> Vec<ObjectRef<IBPCA>> {
        if config_map.name_any() != names::RESTART_CONFIG {
            return vec![];
        }
        let namespace = config_map.namespace().unwrap_or_default();
        match RestartConfig::from_config_map(config_map) {
            Ok(config) => config
                .pending_instances()
                .into_iter()
                .map(|name| ObjectRef::new(&name).within(&namespace))
                .collect(),
            Err(e) => {
                warn!("Ignoring unreadable {} in {}: {}", names::RESTART_CONFIG, namespace, e);
                vec![]
            }
        }
    }

    /// Record a secret write done by the operator so its watch event is not
    /// mistaken for a user change
    pub fn acknowledge_secret(
        &self,
        namespace: &str,
        name: &str,
        data: Option<&BTreeMap<String, ByteString>>,
    ) {
        lock(&self.acknowledged)
            .entry(format!("{}/{}", namespace, name))
            .or_default()
            .insert(fingerprint(data));
    }

    /// Forget everything about a deleted instance
    pub fn forget(&self, ca: &IBPCA) {
        let key = ca.key();
        lock(&self.specs).remove(&key);
        let namespace = ca.namespace().unwrap_or_default();
        let mut secrets = lock(&self.secrets);
        let mut acknowledged = lock(&self.acknowledged);
        for kind in CaKind::ALL {
            let secret_key = format!("{}/{}", namespace, ca.crypto_secret_name(kind));
            secrets.remove(&secret_key);
            acknowledged.remove(&secret_key);
        }
        self.queue.clear(&key);
    }

    fn created_after_start(&self, secret: &Secret) -> bool {
        secret
            .metadata
            .creation_timestamp
            .as_ref()
            .is_some_and(|t| t.0 >= self.started_at)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Map `<instance>-ca-crypto` / `<instance>-tlsca-crypto` to its instance
pub fn crypto_secret_owner(name: &str) -> Option<(&str, CaKind)> {
    if let Some(instance) = name.strip_suffix("-tlsca-crypto") {
        return (!instance.is_empty()).then_some((instance, CaKind::Tls));
    }
    name.strip_suffix("-ca-crypto")
        .filter(|i| !i.is_empty())
        .map(|i| (i, CaKind::Enrollment))
}

/// SHA-256 over the sorted secret data
pub fn fingerprint(data: Option<&BTreeMap<String, ByteString>>) -> String {
    let mut hasher = Sha256::new();
    if let Some(data) = data {
        for (key, value) in data {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(&value.0);
            hasher.update([0u8]);
        }
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ibpca::ConfigOverride;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn make_secret(name: &str, value: &str, created: DateTime<Utc>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("fabric".to_string()),
                creation_timestamp: Some(Time(created)),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "cert.pem".to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn classifier() -> (Arc<UpdateQueue>, EventClassifier) {
        let queue = Arc::new(UpdateQueue::new());
        let start = Utc::now() - chrono::Duration::minutes(5);
        (queue.clone(), EventClassifier::started_at(queue, start))
    }

    #[test]
    fn test_crypto_secret_owner() {
        assert_eq!(crypto_secret_owner("org1-ca-crypto"), Some(("org1", CaKind::Enrollment)));
        assert_eq!(crypto_secret_owner("org1-tlsca-crypto"), Some(("org1", CaKind::Tls)));
        assert_eq!(crypto_secret_owner("org1-ca-config"), None);
        assert_eq!(crypto_secret_owner("-ca-crypto"), None);
    }

    #[test]
    fn test_fingerprint_depends_on_data() {
        let a = BTreeMap::from([("k".to_string(), ByteString(b"a".to_vec()))]);
        let b = BTreeMap::from([("k".to_string(), ByteString(b"b".to_vec()))]);
        assert_ne!(fingerprint(Some(&a)), fingerprint(Some(&b)));
        assert_eq!(fingerprint(Some(&a)), fingerprint(Some(&a.clone())));
    }

    #[test]
    fn test_preexisting_secret_only_seeds_cache() {
        let (queue, classifier) = classifier();
        let old = Utc::now() - chrono::Duration::days(3);

        let refs = classifier.classify_secret(&make_secret("org1-ca-crypto", "v1", old));

        assert!(refs.is_empty());
        assert!(!queue.not_empty("fabric/org1"));
    }

    #[test]
    fn test_new_secret_sets_crypto_created() {
        let (queue, classifier) = classifier();

        let refs = classifier.classify_secret(&make_secret("org1-ca-crypto", "v1", Utc::now()));

        assert_eq!(refs.len(), 1);
        assert!(queue.peek("fabric/org1").ca_crypto_created);
    }

    #[test]
    fn test_changed_secret_sets_crypto_updated() {
        let (queue, classifier) = classifier();
        let old = Utc::now() - chrono::Duration::days(3);
        classifier.classify_secret(&make_secret("org1-tlsca-crypto", "v1", old));

        let refs = classifier.classify_secret(&make_secret("org1-tlsca-crypto", "v2", old));

        assert_eq!(refs.len(), 1);
        let update = queue.peek("fabric/org1");
        assert!(update.ca_crypto_updated);
        assert!(update.restart_needed);
    }

    #[test]
    fn test_acknowledged_write_is_ignored() {
        let (queue, classifier) = classifier();
        let old = Utc::now() - chrono::Duration::days(3);
        classifier.classify_secret(&make_secret("org1-ca-crypto", "v1", old));

        let written = make_secret("org1-ca-crypto", "v2", old);
        classifier.acknowledge_secret("fabric", "org1-ca-crypto", written.data.as_ref());
        let refs = classifier.classify_secret(&written);

        assert!(refs.is_empty());
        assert!(!queue.not_empty("fabric/org1"));
    }

    #[test]
    fn test_acknowledged_writes_in_any_order() {
        let (queue, classifier) = classifier();
        let old = Utc::now() - chrono::Duration::days(3);
        classifier.classify_secret(&make_secret("org1-ca-crypto", "v1", old));

        let first = make_secret("org1-ca-crypto", "v2", old);
        let second = make_secret("org1-ca-crypto", "v3", old);
        classifier.acknowledge_secret("fabric", "org1-ca-crypto", first.data.as_ref());
        classifier.acknowledge_secret("fabric", "org1-ca-crypto", second.data.as_ref());

        assert!(classifier.classify_secret(&second).is_empty());
        assert!(classifier.classify_secret(&first).is_empty());
        assert!(!queue.not_empty("fabric/org1"));

        // A user edit afterwards is still noticed
        let refs = classifier.classify_secret(&make_secret("org1-ca-crypto", "v4", old));
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_unrelated_secret_is_ignored() {
        let (_, classifier) = classifier();
        assert!(classifier
            .classify_secret(&make_secret("registry-creds", "x", Utc::now()))
            .is_empty());
    }

    #[test]
    fn test_record_spec_pushes_diff() {
        let (queue, classifier) = classifier();
        let old = IbpcaSpec::default();
        let new = IbpcaSpec {
            config_override: Some(ConfigOverride {
                ca: Some(json!({"debug": true})),
                ..Default::default()
            }),
            ..Default::default()
        };

        let first = classifier.record_spec("fabric/org1", None, &old);
        assert!(first.is_empty());

        let update = classifier.record_spec("fabric/org1", Some(&old), &new);
        assert!(update.ca_overrides_updated);
        assert_eq!(queue.pop("fabric/org1"), update);
    }

    #[test]
    fn test_restart_config_maps_to_pending_instances() {
        let (_, classifier) = classifier();
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(names::RESTART_CONFIG.to_string()),
                namespace: Some("fabric".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                names::RESTART_CONFIG_KEY.to_string(),
                json!({
                    "instances": {
                        "org1": {"requests": ["configOverride"]},
                        "org2": {"requests": [], "lastRestart": "2026-01-01T00:00:00Z"}
                    }
                })
                .to_string(),
            )])),
            ..Default::default()
        };

        let refs = classifier.classify_config_map(&cm);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "org1");
        assert_eq!(refs[0].namespace.as_deref(), Some("fabric"));
    }
}
