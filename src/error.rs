// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid IBPCA spec: {0}")]
    InvalidSpec(String),

    #[error("License must be accepted before the CA can be deployed")]
    LicenseNotAccepted,

    #[error("CA initialization failed: {0}")]
    CaInitFailed(String),

    #[error("TLS CA initialization failed: {0}")]
    TlsCaInitFailed(String),

    #[error("HSM init job failed: {0}")]
    HsmJobFailed(String),

    #[error("Crypto generation failed: {0}")]
    CryptoError(String),

    #[error("Invalid server config: {0}")]
    ConfigError(String),

    #[error("Restart failed: {0}")]
    RestartFailed(String),

    #[error("Certificate check failed: {0}")]
    CertificateError(String),

    #[error("Migration failed: {0}")]
    MigrationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl OperatorError {
    /// Numeric code written to `status.errorcode`
    pub fn code(&self) -> i32 {
        match self {
            OperatorError::InvalidSpec(_) => 1,
            OperatorError::LicenseNotAccepted => 2,
            OperatorError::CaInitFailed(_) => 20,
            OperatorError::TlsCaInitFailed(_) => 21,
            OperatorError::HsmJobFailed(_) => 22,
            OperatorError::CryptoError(_) => 23,
            OperatorError::ConfigError(_) => 24,
            OperatorError::RestartFailed(_) => 30,
            OperatorError::CertificateError(_) => 31,
            OperatorError::MigrationError(_) => 40,
            OperatorError::SerializationError(_) => 50,
            OperatorError::KubeError(_) => 60,
        }
    }

    /// Breaking errors need a change to the resource before retrying makes sense
    pub fn is_breaking(&self) -> bool {
        matches!(
            self,
            OperatorError::InvalidSpec(_) | OperatorError::LicenseNotAccepted
        )
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(e: serde_yaml::Error) -> Self {
        OperatorError::SerializationError(e.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(e: serde_json::Error) -> Self {
        OperatorError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OperatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_errors_are_breaking() {
        assert!(OperatorError::InvalidSpec("bad".to_string()).is_breaking());
        assert!(OperatorError::LicenseNotAccepted.is_breaking());
    }

    #[test]
    fn test_runtime_errors_are_retried() {
        assert!(!OperatorError::HsmJobFailed("timeout".to_string()).is_breaking());
        assert!(!OperatorError::RestartFailed("conflict".to_string()).is_breaking());
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            OperatorError::InvalidSpec(String::new()),
            OperatorError::LicenseNotAccepted,
            OperatorError::CaInitFailed(String::new()),
            OperatorError::TlsCaInitFailed(String::new()),
            OperatorError::HsmJobFailed(String::new()),
            OperatorError::CryptoError(String::new()),
            OperatorError::ConfigError(String::new()),
            OperatorError::RestartFailed(String::new()),
            OperatorError::CertificateError(String::new()),
            OperatorError::MigrationError(String::new()),
            OperatorError::SerializationError(String::new()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
