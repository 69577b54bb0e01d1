// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The reconcile sequence shared by every flavour.

use crate::certificate::{CertState, CertificateManager};
use crate::config::Config;
use crate::constants::{crypto_keys, defaults, names, ports, OPERATOR_VERSION};
use crate::error::{OperatorError, Result};
use crate::initializer::{self, CaInitializer, Initialized};
use crate::migration::{self, Migrator};
use crate::offering::{Flavor, OfferingStatus, ReconcileResult};
use crate::resources::{self, apply_config_map, deployment, object_meta, pvc, rbac, service};
use crate::restart::{Reason, RestartManager};
use crate::types::ibpca::{CaKind, StatusType, IBPCA};
use crate::update::{spec_state, EventClassifier, Update};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct Offering {
    client: Client,
    config: Arc<Config>,
    flavor: Flavor,
    initializer: CaInitializer,
    restart: Arc<RestartManager>,
    certificates: CertificateManager,
    migrator: Migrator,
}

impl Offering {
    pub fn new(client: Client, config: Arc<Config>, classifier: Arc<EventClassifier>) -> Self {
        let restart = Arc::new(RestartManager::new(client.clone(), config.restart_wait));
        Self {
            flavor: config.cluster_type.into(),
            initializer: CaInitializer::new(client.clone(), config.clone(), classifier.clone()),
            certificates: CertificateManager::new(client.clone(), config.clone(), classifier),
            migrator: Migrator::new(client.clone(), restart.clone()),
            restart,
            client,
            config,
        }
    }

    #[instrument(skip(self, ca, update), fields(ca = %ca.key(), update = ?update.true_flags()))]
    pub async fn reconcile(&self, ca: &IBPCA, update: &Update) -> Result<ReconcileResult> {
        if migration::operator_version_changed(ca) {
            info!(
                "Operator version changed to {} for {}, reconciling again",
                OPERATOR_VERSION,
                ca.key()
            );
            return Ok(ReconcileResult::requeue());
        }

        if self.pre_reconcile_checks(ca, update).await? {
            return Ok(ReconcileResult::requeue());
        }

        self.migrator.migrate_fabric(ca).await?;

        let initialized = self.initializer.initialize(ca, update).await?;

        self.reconcile_managers(ca, &initialized).await?;
        self.reconcile_connection_profile(ca).await?;

        let mut result = ReconcileResult::default();
        let mut renewed = self.check_certificates(ca, &mut result).await?;

        let restarted = ca.spec.action.restart;
        if ca.spec.action.any() {
            renewed |= self.handle_actions(ca).await?;
        }

        self.handle_restart(ca, update, &initialized, restarted, renewed, &mut result)
            .await?;

        spec_state::save(&self.client, ca).await?;
        Ok(result)
    }

    /// Validate the spec and apply defaults, true when the spec was patched
    async fn pre_reconcile_checks(&self, ca: &IBPCA, update: &Update) -> Result<bool> {
        check_license(ca)?;
        check_name(ca)?;
        check_replicas(ca)?;
        check_hsm_endpoint(ca)?;

        let realign = update.fabric_version_updated && !update.images_updated;
        let Some(defaulted) = migration::apply_spec_defaults(&ca.spec, realign)? else {
            return Ok(false);
        };
        info!("Applying spec defaults to {}", ca.key());
        self.patch_spec(ca, json!({ "spec": defaulted })).await?;
        Ok(true)
    }

    async fn reconcile_managers(&self, ca: &IBPCA, initialized: &Initialized) -> Result<()> {
        rbac::reconcile(&self.client, ca).await?;
        pvc::reconcile(&self.client, ca).await?;
        service::reconcile(&self.client, ca).await?;
        deployment::reconcile(&self.client, ca, &initialized.strategy).await?;
        self.flavor.expose(&self.client, ca, &self.config).await
    }

    async fn reconcile_connection_profile(&self, ca: &IBPCA) -> Result<()> {
        let ca_crypto = initializer::load_crypto(&self.client, ca, CaKind::Enrollment)
            .await?
            .unwrap_or_default();
        let tlsca_crypto = initializer::load_crypto(&self.client, ca, CaKind::Tls)
            .await?
            .unwrap_or_default();
        let profile = ConnectionProfile::new(ca, &self.config, &ca_crypto, &tlsca_crypto);
        apply_config_map(&self.client, &profile.to_config_map(ca)?).await?;
        Ok(())
    }

    /// Warn about expiring TLS certificates and renew expired ones.
    ///
    /// Returns true when the certificate was renewed.
    async fn check_certificates(&self, ca: &IBPCA, result: &mut ReconcileResult) -> Result<bool> {
        match self.certificates.check(ca).await? {
            CertState::Valid => Ok(false),
            state @ CertState::Expiring { .. } => {
                result.status = Some(OfferingStatus {
                    status_type: StatusType::Warning,
                    reason: "certificateExpiring".to_string(),
                    message: state.message(ca).unwrap_or_default(),
                });
                Ok(false)
            }
            CertState::Expired { .. } => {
                info!("TLS certificate of {} expired, renewing", ca.key());
                self.certificates.renew_tls_cert(ca).await?;
                Ok(true)
            }
        }
    }

    /// Perform the one-shot actions and reset them on the resource.
    ///
    /// Returns true when the TLS certificate was renewed.
    async fn handle_actions(&self, ca: &IBPCA) -> Result<bool> {
        let action = &ca.spec.action;
        if action.restart {
            info!("Restart action set on {}", ca.key());
            self.restart.restart_now(ca).await?;
        }
        if action.renew.tls_cert {
            info!("TLS certificate renewal requested on {}", ca.key());
            self.certificates.renew_tls_cert(ca).await?;
        }

        self.patch_spec(
            ca,
            json!({ "spec": { "action": { "restart": false, "renew": { "tlscert": false } } } }),
        )
        .await?;
        Ok(action.renew.tls_cert)
    }

    async fn handle_restart(
        &self,
        ca: &IBPCA,
        update: &Update,
        initialized: &Initialized,
        restarted: bool,
        renewed: bool,
        result: &mut ReconcileResult,
    ) -> Result<()> {
        if renewed {
            self.restart.request(ca, Reason::TlsCertRenewal).await?;
        }
        // A first deployment starts with the fresh config anyway
        let deployed_before = ca.has_status_type();
        if deployed_before && !restarted {
            if initialized.changed() && update.config_overrides_updated() {
                self.restart.request(ca, Reason::ConfigOverride).await?;
            } else if initialized.changed() || update.restart_needed {
                self.restart.request(ca, Reason::CryptoUpdate).await?;
            }
        }

        if let Some(wait) = self.restart.trigger_if_needed(ca).await? {
            debug!("Pending restart of {} due in {}s", ca.key(), wait.as_secs());
            result.requeue_after(wait);
        }
        Ok(())
    }

    async fn patch_spec(&self, ca: &IBPCA, patch: serde_json::Value) -> Result<()> {
        let api: Api<IBPCA> =
            Api::namespaced(self.client.clone(), &ca.namespace().unwrap_or_default());
        api.patch(&ca.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub fn check_license(ca: &IBPCA) -> Result<()> {
    if ca.spec.license.accept {
        Ok(())
    } else {
        Err(OperatorError::LicenseNotAccepted)
    }
}

/// Names end up in DNS labels of derived resources
pub fn check_name(ca: &IBPCA) -> Result<()> {
    let name = ca.name_any();
    let max = ca
        .spec
        .config_override
        .as_ref()
        .and_then(|o| o.max_name_length)
        .unwrap_or(defaults::MAX_NAME_LENGTH);
    if name.len() > max {
        return Err(OperatorError::InvalidSpec(format!(
            "name '{}' is {} characters long, the maximum is {}",
            name,
            name.len(),
            max
        )));
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !valid_chars || !valid_edges {
        return Err(OperatorError::InvalidSpec(format!(
            "name '{}' must consist of lower case alphanumeric characters or '-'",
            name
        )));
    }
    Ok(())
}

/// Replicas share one database, which sqlite cannot do
pub fn check_replicas(ca: &IBPCA) -> Result<()> {
    if ca.replicas() <= 1 {
        return Ok(());
    }
    let db_type = ca
        .config_override(CaKind::Enrollment)
        .and_then(|o| o.get("db"))
        .and_then(|db| db.get("type"))
        .and_then(|t| t.as_str());
    match db_type {
        Some(t) if t.eq_ignore_ascii_case("postgres") => Ok(()),
        _ => Err(OperatorError::InvalidSpec(format!(
            "{} replicas need a postgres database in configoverride.ca.db",
            ca.replicas()
        ))),
    }
}

pub fn check_hsm_endpoint(ca: &IBPCA) -> Result<()> {
    let Some(endpoint) = ca.hsm_proxy_endpoint() else {
        return Ok(());
    };
    let invalid = |reason: &str| {
        OperatorError::InvalidSpec(format!(
            "invalid hsm.pkcs11endpoint '{}': {}",
            endpoint, reason
        ))
    };
    let url = url::Url::parse(endpoint).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "tcp" | "tls") {
        return Err(invalid("scheme must be tcp or tls"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("host is missing"));
    }
    if url.port().is_none() {
        return Err(invalid("port is missing"));
    }
    Ok(())
}

/// What clients need to talk to the CA, published in
/// `<name>-connection-profile`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionProfile {
    pub endpoints: ProfileEndpoints,
    pub tls: ProfileTls,
    pub ca: ProfileCa,
    pub tlsca: ProfileCa,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProfileEndpoints {
    pub api: String,
    pub operations: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProfileTls {
    /// base64 PEM
    pub cert: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProfileCa {
    /// base64 PEM
    pub signcerts: String,
}

impl ConnectionProfile {
    pub fn new(
        ca: &IBPCA,
        config: &Config,
        ca_crypto: &BTreeMap<String, Vec<u8>>,
        tlsca_crypto: &BTreeMap<String, Vec<u8>>,
    ) -> Self {
        let endpoints = match resources::endpoints(ca, config) {
            Some(e) => ProfileEndpoints {
                api: format!("https://{}:443", e.api),
                operations: format!("https://{}:443", e.operations),
            },
            None => {
                let host = service::cluster_hosts(ca)
                    .pop()
                    .unwrap_or_else(|| ca.name_any());
                ProfileEndpoints {
                    api: format!("https://{}:{}", host, ports::API),
                    operations: format!("https://{}:{}", host, ports::OPERATIONS),
                }
            }
        };
        let encode = |crypto: &BTreeMap<String, Vec<u8>>, key: &str| {
            crypto.get(key).map(|v| STANDARD.encode(v)).unwrap_or_default()
        };

        Self {
            endpoints,
            tls: ProfileTls {
                cert: encode(ca_crypto, crypto_keys::TLS_CERT),
            },
            ca: ProfileCa {
                signcerts: encode(ca_crypto, crypto_keys::CERT),
            },
            tlsca: ProfileCa {
                signcerts: encode(tlsca_crypto, crypto_keys::CERT),
            },
        }
    }

    pub fn to_config_map(&self, ca: &IBPCA) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: object_meta(ca, ca.connection_profile_name()),
            data: Some(BTreeMap::from([(
                names::CONNECTION_PROFILE_KEY.to_string(),
                serde_json::to_string_pretty(self)?,
            )])),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::crypto;
    use crate::test_utils::{not_found_json, secret_json, MockService};
    use crate::types::ibpca::tests::{accepted_spec, make_ca};
    use crate::types::ibpca::{CaStatus, ConfigOverride, HsmSpec, IbpcaSpec};
    use crate::update::UpdateQueue;

    fn offering(mock: &MockService) -> Offering {
        Offering::new(
            mock.clone().into_client(),
            Arc::new(Config::default()),
            Arc::new(EventClassifier::new(Arc::new(UpdateQueue::new()))),
        )
    }

    fn defaulted_spec() -> IbpcaSpec {
        migration::apply_spec_defaults(&accepted_spec(), false)
            .unwrap()
            .unwrap()
    }

    fn with_endpoint(endpoint: &str) -> IBPCA {
        let mut spec = accepted_spec();
        spec.hsm = Some(HsmSpec {
            pkcs11_endpoint: Some(endpoint.to_string()),
        });
        make_ca("org1ca", spec)
    }

    #[test]
    fn test_license_must_be_accepted() {
        let ca = make_ca("org1ca", IbpcaSpec::default());
        assert!(matches!(
            check_license(&ca),
            Err(OperatorError::LicenseNotAccepted)
        ));
        assert!(check_license(&make_ca("org1ca", accepted_spec())).is_ok());
    }

    #[test]
    fn test_name_length_and_characters() {
        assert!(check_name(&make_ca("org1ca", accepted_spec())).is_ok());
        assert!(check_name(&make_ca(&"a".repeat(51), accepted_spec())).is_err());
        assert!(check_name(&make_ca("Org1CA", accepted_spec())).is_err());
        assert!(check_name(&make_ca("org1ca-", accepted_spec())).is_err());

        let mut spec = accepted_spec();
        spec.config_override = Some(ConfigOverride {
            max_name_length: Some(60),
            ..Default::default()
        });
        assert!(check_name(&make_ca(&"a".repeat(55), spec)).is_ok());
    }

    #[test]
    fn test_multiple_replicas_need_postgres() {
        let mut spec = accepted_spec();
        spec.replicas = Some(2);
        assert!(check_replicas(&make_ca("org1ca", spec.clone())).is_err());

        spec.config_override = Some(ConfigOverride {
            ca: Some(json!({"db": {"type": "postgres", "datasource": "host=db"}})),
            ..Default::default()
        });
        assert!(check_replicas(&make_ca("org1ca", spec)).is_ok());
    }

    #[test]
    fn test_hsm_endpoint_validation() {
        assert!(check_hsm_endpoint(&with_endpoint("tcp://pkcs11-proxy:2345")).is_ok());
        assert!(check_hsm_endpoint(&with_endpoint("tls://10.0.0.4:2345")).is_ok());
        assert!(check_hsm_endpoint(&with_endpoint("http://proxy:2345")).is_err());
        assert!(check_hsm_endpoint(&with_endpoint("tcp://proxy")).is_err());
        assert!(check_hsm_endpoint(&with_endpoint("proxy:2345")).is_err());
        assert!(check_hsm_endpoint(&make_ca("org1ca", accepted_spec())).is_ok());
    }

    #[test]
    fn test_connection_profile_without_domain_uses_service() {
        let ca = make_ca("org1ca", accepted_spec());
        let ca_crypto = BTreeMap::from([
            (crypto_keys::CERT.to_string(), b"root".to_vec()),
            (crypto_keys::TLS_CERT.to_string(), b"tls".to_vec()),
        ]);

        let profile = ConnectionProfile::new(&ca, &Config::default(), &ca_crypto, &BTreeMap::new());

        assert_eq!(
            profile.endpoints.api,
            "https://org1ca.fabric.svc.cluster.local:7054"
        );
        assert_eq!(
            profile.endpoints.operations,
            "https://org1ca.fabric.svc.cluster.local:9443"
        );
        assert_eq!(profile.ca.signcerts, STANDARD.encode("root"));
        assert_eq!(profile.tls.cert, STANDARD.encode("tls"));
        assert_eq!(profile.tlsca.signcerts, "");
    }

    #[test]
    fn test_connection_profile_with_domain_uses_ingress_hosts() {
        let mut spec = accepted_spec();
        spec.domain = Some("example.com".to_string());
        let ca = make_ca("org1ca", spec);

        let profile =
            ConnectionProfile::new(&ca, &Config::default(), &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(profile.endpoints.api, "https://fabric-org1ca-ca.example.com:443");

        let cm = profile.to_config_map(&ca).unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("org1ca-connection-profile"));
        let raw = &cm.data.unwrap()[names::CONNECTION_PROFILE_KEY];
        let parsed: serde_json::Value = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed["endpoints"]["operations"],
            "https://fabric-org1ca-operations.example.com:443"
        );
    }

    #[tokio::test]
    async fn test_unaccepted_license_touches_nothing() {
        let mock = MockService::new().echo_writes();
        let err = offering(&mock)
            .reconcile(&make_ca("org1ca", IbpcaSpec::default()), &Update::default())
            .await
            .unwrap_err();
        assert!(err.is_breaking());
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_defaults_are_patched_and_requeued() {
        let ca = make_ca("org1ca", accepted_spec());
        let mock = MockService::new().on_patch(
            "/apis/ibp.com/v1beta1/namespaces/fabric/ibpcas/org1ca",
            200,
            &serde_json::to_string(&ca).unwrap(),
        );

        let result = offering(&mock).reconcile(&ca, &Update::default()).await.unwrap();

        assert!(result.requeue);
        let patches = mock.requests_with_method("PATCH");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].json()["spec"]["version"], migration::DEFAULT_FABRIC_VERSION);
        assert_eq!(patches[0].json()["spec"]["replicas"], 1);
    }

    #[tokio::test]
    async fn test_operator_upgrade_requeues() {
        let mut ca = make_ca("org1ca", defaulted_spec());
        ca.status = Some(CaStatus {
            status_type: Some(StatusType::Deployed),
            version: Some("0.0.0-previous".to_string()),
            ..Default::default()
        });
        let mock = MockService::new();

        let result = offering(&mock).reconcile(&ca, &Update::default()).await.unwrap();
        assert!(result.requeue);
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_instance_is_fully_deployed() {
        let ca = make_ca("org1ca", defaulted_spec());
        let tls = crypto::tls_cert("org1ca", &["localhost".to_string()]).unwrap();
        let secret_path = "/api/v1/namespaces/fabric/secrets/org1ca-ca-crypto";
        let mock = MockService::new()
            .on_get(secret_path, 404, &not_found_json("secrets", "org1ca-ca-crypto"))
            .on_get(
                secret_path,
                200,
                &secret_json(
                    "org1ca-ca-crypto",
                    "fabric",
                    &[(crypto_keys::TLS_CERT, tls.cert_pem.as_bytes())],
                ),
            )
            .echo_writes();

        let result = offering(&mock).reconcile(&ca, &Update::default()).await.unwrap();

        assert_eq!(result, ReconcileResult::default());
        let patched: Vec<String> = mock
            .requests_with_method("PATCH")
            .into_iter()
            .map(|r| r.path)
            .collect();
        for expected in [
            "/api/v1/namespaces/fabric/secrets/org1ca-ca-crypto",
            "/api/v1/namespaces/fabric/secrets/org1ca-tlsca-crypto",
            "/api/v1/namespaces/fabric/configmaps/org1ca-ca-config",
            "/api/v1/namespaces/fabric/configmaps/org1ca-tlsca-config",
            "/api/v1/namespaces/fabric/serviceaccounts/org1ca",
            "/api/v1/namespaces/fabric/persistentvolumeclaims/org1ca-pvc",
            "/api/v1/namespaces/fabric/services/org1ca",
            "/apis/apps/v1/namespaces/fabric/deployments/org1ca",
            "/api/v1/namespaces/fabric/configmaps/org1ca-connection-profile",
            "/api/v1/namespaces/fabric/configmaps/org1ca-spec",
        ] {
            assert!(
                patched.iter().any(|p| p == expected),
                "missing apply of {}",
                expected
            );
        }
        // No restart of a deployment that was only just created
        assert!(!patched.iter().any(|p| p.ends_with("ca-restart-config")));
    }
}
