// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CA initialization: server configs and crypto material for the enrollment
//! CA and the TLS CA of an instance.

pub mod crypto;
pub mod hsm;
pub mod server_config;

use crate::config::Config;
use crate::constants::{crypto_keys, paths};
use crate::error::{OperatorError, Result};
use crate::resources::{self, apply_config_map, apply_secret, endpoints, object_meta};
use crate::types::ibpca::{CaKind, IBPCA};
use crate::update::{EventClassifier, Update};
use hsm::{HsmConfig, Strategy};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use server_config::ServerConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// What initialization did to the stored config and crypto of one CA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaChange {
    Unchanged,
    /// Nothing usable was stored, config and crypto were written for the first time
    Created,
    /// Existing config or crypto was rewritten
    Updated,
}

impl CaChange {
    fn from_state(state: &CaState) -> Self {
        match (state.changed, state.existed) {
            (false, _) => CaChange::Unchanged,
            (true, false) => CaChange::Created,
            (true, true) => CaChange::Updated,
        }
    }
}

/// Result of initializing both CAs of an instance
#[derive(Debug, Clone, PartialEq)]
pub struct Initialized {
    /// Strategy the CA deployment has to run with
    pub strategy: Strategy,
    pub ca: CaChange,
    pub tlsca: CaChange,
}

impl Initialized {
    /// Existing config or crypto was rewritten, running pods need a restart
    /// to pick it up
    pub fn changed(&self) -> bool {
        self.ca == CaChange::Updated || self.tlsca == CaChange::Updated
    }
}

/// Config and crypto of one CA while it is being initialized
#[derive(Debug)]
struct CaState {
    config: ServerConfig,
    crypto: BTreeMap<String, Vec<u8>>,
    strategy: Strategy,
    changed: bool,
    /// Config and CA certificate were stored before this pass
    existed: bool,
}

impl CaState {
    fn has(&self, key: &str) -> bool {
        self.crypto.get(key).is_some_and(|v| !v.is_empty())
    }
}

pub struct CaInitializer {
    client: Client,
    config: Arc<Config>,
    classifier: Arc<EventClassifier>,
}

impl CaInitializer {
    pub fn new(client: Client, config: Arc<Config>, classifier: Arc<EventClassifier>) -> Self {
        Self {
            client,
            config,
            classifier,
        }
    }

    #[instrument(skip(self, ca, update), fields(ca = %ca.key()))]
    pub async fn initialize(&self, ca: &IBPCA, update: &Update) -> Result<Initialized> {
        let enrollment = self.handle_enrollment_ca_init(ca, update).await?;
        let tls = self.handle_tls_ca_init(ca, update).await?;

        let strategy = match &enrollment.strategy {
            Strategy::Software => tls.strategy.clone(),
            other => other.clone(),
        };
        Ok(Initialized {
            strategy,
            ca: CaChange::from_state(&enrollment),
            tlsca: CaChange::from_state(&tls),
        })
    }

    async fn handle_enrollment_ca_init(&self, ca: &IBPCA, update: &Update) -> Result<CaState> {
        let mut state = self
            .prepare(ca, CaKind::Enrollment, update.ca_overrides_updated, update)
            .await?;
        if state.changed {
            self.ensure_ca_crypto(ca, CaKind::Enrollment, &mut state).await?;
        }
        self.ensure_server_tls(ca, &mut state)?;
        if state.changed {
            self.handle_config_resources(ca, CaKind::Enrollment, &mut state)
                .await?;
        }
        Ok(state)
    }

    async fn handle_tls_ca_init(&self, ca: &IBPCA, update: &Update) -> Result<CaState> {
        let mut state = self
            .prepare(ca, CaKind::Tls, update.tlsca_overrides_updated, update)
            .await?;
        if state.changed {
            self.ensure_ca_crypto(ca, CaKind::Tls, &mut state).await?;
            self.handle_config_resources(ca, CaKind::Tls, &mut state)
                .await?;
        }
        Ok(state)
    }

    /// Load what is stored and decide whether this CA needs (re)initializing
    async fn prepare(
        &self,
        ca: &IBPCA,
        kind: CaKind,
        overrides_updated: bool,
        update: &Update,
    ) -> Result<CaState> {
        let stored_config = self.load_config(ca, kind).await?;
        let stored_crypto = self.load_crypto(ca, kind).await?;
        let has_cert = stored_crypto
            .as_ref()
            .is_some_and(|c| c.get(crypto_keys::CERT).is_some_and(|v| !v.is_empty()));

        let existed = stored_config.is_some() && has_cert;
        let needs_init = !existed
            || overrides_updated
            || update.ca_crypto_updated;

        let (mut config, changed) = match stored_config {
            Some(config) if !needs_init => {
                debug!("{} config and crypto exist, nothing to initialize", kind);
                (config, false)
            }
            stored => {
                info!("Initializing {} for {}", kind, ca.key());
                let mut config = match stored {
                    Some(config) => config,
                    None => ServerConfig::default_for(kind)?,
                };
                if let Some(overlay) = ca.config_override(kind) {
                    config.merge_override(overlay);
                }
                (config, true)
            }
        };

        let mut crypto = stored_crypto.unwrap_or_default();
        if changed {
            crypto.extend(config.take_user_crypto()?);
        }

        let hsm = self.hsm_config(ca, &config).await?;
        let strategy = hsm::select_strategy(ca, config.is_pkcs11(), hsm.as_ref())?;

        Ok(CaState {
            config,
            crypto,
            strategy,
            changed,
            existed,
        })
    }

    /// The operator HSM config is only needed when no proxy is set
    async fn hsm_config(&self, ca: &IBPCA, config: &ServerConfig) -> Result<Option<HsmConfig>> {
        if !config.is_pkcs11() || ca.hsm_proxy_endpoint().is_some() {
            return Ok(None);
        }
        hsm::load(&self.client, &self.config.operator_namespace).await
    }

    /// Make sure the CA has a signing certificate, creating one if needed
    async fn ensure_ca_crypto(&self, ca: &IBPCA, kind: CaKind, state: &mut CaState) -> Result<()> {
        let has_cert = state.has(crypto_keys::CERT);
        let has_key = state.has(crypto_keys::KEY);

        match &state.strategy {
            Strategy::Software => match (has_cert, has_key) {
                (true, true) => Ok(()),
                (false, false) => {
                    let cn = common_name(ca, kind, &state.config);
                    let generated = crypto::self_signed_ca(&cn, &csr_hosts(ca, &state.config))?;
                    info!("Generated {} root certificate for {}", kind, ca.key());
                    state
                        .crypto
                        .insert(crypto_keys::CERT.to_string(), generated.cert_pem.into_bytes());
                    state
                        .crypto
                        .insert(crypto_keys::KEY.to_string(), generated.key_pem.into_bytes());
                    Ok(())
                }
                _ => Err(OperatorError::InvalidSpec(format!(
                    "{} certfile and keyfile must be provided together",
                    kind
                ))),
            },
            _ if has_cert => Ok(()),
            strategy => {
                let cert = self.run_hsm_init(ca, kind, strategy, &state.config).await?;
                state.crypto.insert(crypto_keys::CERT.to_string(), cert);
                Ok(())
            }
        }
    }

    /// Create the CA key in the HSM and fetch the certificate the job uploaded
    async fn run_hsm_init(
        &self,
        ca: &IBPCA,
        kind: CaKind,
        strategy: &Strategy,
        config: &ServerConfig,
    ) -> Result<Vec<u8>> {
        let ca_image = ca
            .spec
            .images
            .as_ref()
            .and_then(|i| i.ca())
            .ok_or_else(|| OperatorError::InvalidSpec("images.caImage must be set".to_string()))?;
        let operator_image = self.config.operator_image.clone().ok_or_else(|| {
            OperatorError::ConfigError("OPERATOR_IMAGE must be set to initialize HSM CAs".to_string())
        })?;

        let init_config = init_job_config(config, strategy);
        let config_map = hsm::build_init_config_map(ca, kind, init_config.to_yaml()?);
        let job = hsm::build_job(ca, kind, strategy, &ca_image, &operator_image)?;
        hsm::run_init_job(&self.client, ca, kind, job, config_map, &self.config).await?;

        let uploaded = self.load_crypto(ca, kind).await?.unwrap_or_default();
        let cert = uploaded
            .get(crypto_keys::CERT)
            .filter(|c| !c.is_empty())
            .cloned();
        let secret_name = ca.crypto_secret_name(kind);
        let namespace = ca.namespace().unwrap_or_default();
        self.classifier.acknowledge_secret(
            &namespace,
            &secret_name,
            Some(&to_secret_data(&uploaded)),
        );

        cert.ok_or_else(|| {
            let msg = format!("init job did not upload {} to {}", crypto_keys::CERT, secret_name);
            match kind {
                CaKind::Enrollment => OperatorError::CaInitFailed(msg),
                CaKind::Tls => OperatorError::TlsCaInitFailed(msg),
            }
        })
    }

    /// Server and operations TLS certificates of the enrollment CA
    fn ensure_server_tls(&self, ca: &IBPCA, state: &mut CaState) -> Result<()> {
        let pairs = [
            (
                crypto_keys::TLS_CERT,
                crypto_keys::TLS_KEY,
                tls_hosts(ca, &self.config),
            ),
            (
                crypto_keys::OPERATIONS_CERT,
                crypto_keys::OPERATIONS_KEY,
                operations_hosts(ca, &self.config),
            ),
        ];

        for (cert_key, key_key, hosts) in pairs {
            let valid = state.has(key_key)
                && state
                    .crypto
                    .get(cert_key)
                    .is_some_and(|c| crypto::covers_hosts(c, &hosts));
            if valid {
                continue;
            }
            info!("Generating {} for {}", cert_key, ca.key());
            let generated = crypto::tls_cert(&ca.name_any(), &hosts)?;
            state
                .crypto
                .insert(cert_key.to_string(), generated.cert_pem.into_bytes());
            state
                .crypto
                .insert(key_key.to_string(), generated.key_pem.into_bytes());
            state.changed = true;
        }
        Ok(())
    }

    /// Write the crypto secret and the server config ConfigMap
    async fn handle_config_resources(
        &self,
        ca: &IBPCA,
        kind: CaKind,
        state: &mut CaState,
    ) -> Result<()> {
        let present: Vec<String> = state
            .crypto
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        state
            .config
            .point_to_mount(kind, &present, state.strategy.is_hsm());
        if matches!(state.strategy, Strategy::Daemon(_)) {
            state.config.use_copied_library();
        }

        let secret = build_crypto_secret(ca, kind, &state.crypto);
        self.classifier.acknowledge_secret(
            &ca.namespace().unwrap_or_default(),
            &ca.crypto_secret_name(kind),
            secret.data.as_ref(),
        );
        apply_secret(&self.client, &secret).await?;
        apply_config_map(&self.client, &build_config_map(ca, kind, &state.config)?).await?;
        info!("Wrote {} config and crypto for {}", kind, ca.key());
        Ok(())
    }

    async fn load_config(&self, ca: &IBPCA, kind: CaKind) -> Result<Option<ServerConfig>> {
        load_config(&self.client, ca, kind).await
    }

    async fn load_crypto(&self, ca: &IBPCA, kind: CaKind) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        load_crypto(&self.client, ca, kind).await
    }
}

/// Read the stored server config of one CA
pub async fn load_config(client: &Client, ca: &IBPCA, kind: CaKind) -> Result<Option<ServerConfig>> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &ca.namespace().unwrap_or_default());
    let Some(cm) = api.get_opt(&ca.config_map_name(kind)).await? else {
        return Ok(None);
    };
    cm.data
        .as_ref()
        .and_then(|d| d.get(paths::SERVER_CONFIG_FILE))
        .map(|raw| ServerConfig::from_yaml(raw))
        .transpose()
}

/// Read a crypto secret as raw bytes per key
pub async fn load_crypto(
    client: &Client,
    ca: &IBPCA,
    kind: CaKind,
) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &ca.namespace().unwrap_or_default());
    let secret = api.get_opt(&ca.crypto_secret_name(kind)).await?;
    Ok(secret.map(|s| {
        s.data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect()
    }))
}

pub fn to_secret_data(crypto: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, ByteString> {
    crypto
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.clone())))
        .collect()
}

pub fn build_crypto_secret(ca: &IBPCA, kind: CaKind, crypto: &BTreeMap<String, Vec<u8>>) -> Secret {
    Secret {
        metadata: object_meta(ca, ca.crypto_secret_name(kind)),
        type_: Some("Opaque".to_string()),
        data: Some(to_secret_data(crypto)),
        ..Default::default()
    }
}

pub fn build_config_map(ca: &IBPCA, kind: CaKind, config: &ServerConfig) -> Result<ConfigMap> {
    Ok(ConfigMap {
        metadata: object_meta(ca, ca.config_map_name(kind)),
        data: Some(BTreeMap::from([(
            paths::SERVER_CONFIG_FILE.to_string(),
            config.to_yaml()?,
        )])),
        ..Default::default()
    })
}

/// Config `fabric-ca-server init` runs with inside the HSM job: no crypto
/// files, a throwaway database and no listeners that need certificates
fn init_job_config(config: &ServerConfig, strategy: &Strategy) -> ServerConfig {
    let mut init = config.clone();
    for path in [
        &["ca", "certfile"][..],
        &["ca", "keyfile"],
        &["ca", "chainfile"],
        &["operations"],
    ] {
        init.remove(path);
    }
    init.set(&["db", "type"], Value::String("sqlite3".to_string()));
    init.set(
        &["db", "datasource"],
        Value::String("/output/fabric-ca-server.db".to_string()),
    );
    init.set(&["tls", "enabled"], Value::Bool(false));
    if matches!(strategy, Strategy::Daemon(_)) {
        init.use_copied_library();
    }
    init
}

fn common_name(ca: &IBPCA, kind: CaKind, config: &ServerConfig) -> String {
    config
        .get_str(&["csr", "cn"])
        .or_else(|| config.ca_name())
        .filter(|cn| !cn.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}", ca.name_any(), kind))
}

fn csr_hosts(ca: &IBPCA, config: &ServerConfig) -> Vec<String> {
    let hosts: Vec<String> = config
        .get(&["csr", "hosts"])
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if hosts.is_empty() {
        resources::service::cluster_hosts(ca)
    } else {
        hosts
    }
}

fn local_hosts() -> [String; 2] {
    ["localhost".to_string(), "127.0.0.1".to_string()]
}

/// Hosts the CA API certificate must cover
pub fn tls_hosts(ca: &IBPCA, config: &Config) -> Vec<String> {
    let mut hosts = resources::service::cluster_hosts(ca);
    if let Some(endpoints) = endpoints(ca, config) {
        hosts.push(endpoints.api);
    }
    hosts.extend(local_hosts());
    hosts
}

/// Hosts the operations endpoint certificate must cover
pub fn operations_hosts(ca: &IBPCA, config: &Config) -> Vec<String> {
    let mut hosts = resources::service::cluster_hosts(ca);
    if let Some(endpoints) = endpoints(ca, config) {
        hosts.push(endpoints.operations);
    }
    hosts.extend(local_hosts());
    hosts
}
