// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Expiry checks and renewal of the CA server TLS certificate.

use crate::config::Config;
use crate::constants::crypto_keys;
use crate::error::{OperatorError, Result};
use crate::initializer::{self, crypto};
use crate::resources::apply_secret;
use crate::types::ibpca::{CaKind, IBPCA};
use crate::update::EventClassifier;
use chrono::{DateTime, Utc};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// How close a certificate is to its end of validity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertState {
    Valid,
    /// Inside the warning window
    Expiring { expires_at: i64 },
    Expired { expired_at: i64 },
}

/// Classify a certificate end date against now and the warning window
pub fn evaluate(not_after: i64, now: i64, warning_secs: i64) -> CertState {
    if not_after <= now {
        CertState::Expired {
            expired_at: not_after,
        }
    } else if not_after - now <= warning_secs {
        CertState::Expiring {
            expires_at: not_after,
        }
    } else {
        CertState::Valid
    }
}

fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

impl CertState {
    /// Status message for anything but a valid certificate
    pub fn message(&self, ca: &IBPCA) -> Option<String> {
        match self {
            CertState::Valid => None,
            CertState::Expiring { expires_at } => Some(format!(
                "TLS certificate of CA '{}' expires at {}",
                ca.name_any(),
                format_timestamp(*expires_at)
            )),
            CertState::Expired { expired_at } => Some(format!(
                "TLS certificate of CA '{}' expired at {}",
                ca.name_any(),
                format_timestamp(*expired_at)
            )),
        }
    }
}

pub struct CertificateManager {
    client: Client,
    config: Arc<Config>,
    classifier: Arc<EventClassifier>,
}

impl CertificateManager {
    pub fn new(client: Client, config: Arc<Config>, classifier: Arc<EventClassifier>) -> Self {
        Self {
            client,
            config,
            classifier,
        }
    }

    fn warning_period(&self, ca: &IBPCA) -> i64 {
        ca.spec
            .num_seconds_warning_period
            .filter(|s| *s > 0)
            .unwrap_or(self.config.cert_warning_period_secs)
    }

    /// Check the server TLS certificate of the enrollment CA
    #[instrument(skip(self, ca), fields(ca = %ca.key()))]
    pub async fn check(&self, ca: &IBPCA) -> Result<CertState> {
        let crypto = initializer::load_crypto(&self.client, ca, CaKind::Enrollment)
            .await?
            .unwrap_or_default();
        let Some(cert) = crypto.get(crypto_keys::TLS_CERT) else {
            return Err(OperatorError::CertificateError(format!(
                "{} has no {}",
                ca.crypto_secret_name(CaKind::Enrollment),
                crypto_keys::TLS_CERT
            )));
        };
        let not_after = crypto::not_after(cert)?;
        let state = evaluate(not_after, Utc::now().timestamp(), self.warning_period(ca));
        if state != CertState::Valid {
            warn!("{}", state.message(ca).unwrap_or_default());
        }
        Ok(state)
    }

    /// Replace the server TLS certificate with a freshly generated one
    #[instrument(skip(self, ca), fields(ca = %ca.key()))]
    pub async fn renew_tls_cert(&self, ca: &IBPCA) -> Result<()> {
        let mut crypto = initializer::load_crypto(&self.client, ca, CaKind::Enrollment)
            .await?
            .ok_or_else(|| {
                OperatorError::CertificateError(format!(
                    "{} does not exist",
                    ca.crypto_secret_name(CaKind::Enrollment)
                ))
            })?;

        let hosts = initializer::tls_hosts(ca, &self.config);
        let generated = crypto::tls_cert(&ca.name_any(), &hosts)?;
        crypto.insert(
            crypto_keys::TLS_CERT.to_string(),
            generated.cert_pem.into_bytes(),
        );
        crypto.insert(
            crypto_keys::TLS_KEY.to_string(),
            generated.key_pem.into_bytes(),
        );

        let secret = initializer::build_crypto_secret(ca, CaKind::Enrollment, &crypto);
        self.classifier.acknowledge_secret(
            &ca.namespace().unwrap_or_default(),
            &ca.crypto_secret_name(CaKind::Enrollment),
            secret.data.as_ref(),
        );
        apply_secret(&self.client, &secret).await?;
        info!("Renewed TLS certificate of {}", ca.key());
        Ok(())
    }
}
