// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// The operator name used for server-side apply
pub const OPERATOR_NAME: &str = "fabric-ca-operator";

/// Field manager for restart annotations, kept apart so deployment applies never drop them
pub const RESTART_MANAGER: &str = "fabric-ca-operator-restart";

/// Field manager of `upload-crypto` inside HSM init jobs
pub const UPLOAD_MANAGER: &str = "fabric-ca-operator-upload";

/// Version stamped into `status.version`
pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kubernetes label keys and values put on managed resources
pub mod labels {
    pub const APP: &str = "app";
    pub const NAME: &str = "app.kubernetes.io/name";
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const NAME_VALUE: &str = "fabric-ca";
    pub const MANAGED_BY_VALUE: &str = super::OPERATOR_NAME;

    /// Selector matching every object this operator manages
    pub fn managed_selector() -> String {
        format!("{}={}", MANAGED_BY, MANAGED_BY_VALUE)
    }
}

/// Annotation keys
pub mod annotations {
    /// Pod template annotation bumped to restart CA pods
    pub const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";
    pub const NGINX_SSL_PASSTHROUGH: &str = "nginx.ingress.kubernetes.io/ssl-passthrough";
    pub const NGINX_BACKEND_PROTOCOL: &str = "nginx.ingress.kubernetes.io/backend-protocol";
}

/// Ports exposed by the fabric-ca server
pub mod ports {
    pub const API: i32 = 7054;
    pub const OPERATIONS: i32 = 9443;
}

/// Filesystem layout inside the CA pod
pub mod paths {
    pub const DATA: &str = "/data";
    pub const CA_HOME: &str = "/data/ca";
    pub const CA_CRYPTO: &str = "/crypto/ca";
    pub const TLSCA_CRYPTO: &str = "/crypto/tlsca";
    pub const CA_CONFIG: &str = "/config/ca";
    pub const TLSCA_CONFIG: &str = "/config/tlsca";
    pub const SERVER_CONFIG_FILE: &str = "fabric-ca-server-config.yaml";
    pub const HSM_LIBRARY_DIR: &str = "/hsm/lib";
    pub const HSM_SHARED: &str = "/shared";
}

/// Keys inside the crypto secrets
pub mod crypto_keys {
    pub const CERT: &str = "cert.pem";
    pub const KEY: &str = "key.pem";
    pub const CHAIN: &str = "chain.pem";
    pub const TLS_CERT: &str = "tls-cert.pem";
    pub const TLS_KEY: &str = "tls-key.pem";
    pub const OPERATIONS_CERT: &str = "operations-cert.pem";
    pub const OPERATIONS_KEY: &str = "operations-key.pem";
}

/// Well known object names
pub mod names {
    /// Restart bookkeeping ConfigMap, one per namespace
    pub const RESTART_CONFIG: &str = "ca-restart-config";
    pub const RESTART_CONFIG_KEY: &str = "restart-config.json";
    /// Operator HSM configuration, in the operator namespace
    pub const HSM_CONFIG: &str = "ibp-hsm-config";
    pub const HSM_CONFIG_KEY: &str = "ibp-hsm-config.yaml";
    pub const SPEC_STATE_KEY: &str = "spec.yaml";
    pub const CONNECTION_PROFILE_KEY: &str = "profile.json";
}

/// Spec defaults
pub mod defaults {
    pub const REPLICAS: i32 = 1;
    pub const STORAGE_SIZE: &str = "100M";
    pub const SERVICE_TYPE: &str = "ClusterIP";
    pub const INGRESS_CLASS: &str = "nginx";
    pub const RESTART_WAIT_SECS: u64 = 600;
    pub const CERT_WARNING_PERIOD_SECS: i64 = 30 * 24 * 60 * 60;
    pub const HSM_JOB_TIMEOUT_SECS: u64 = 600;
    pub const RECONCILE_INTERVAL_SECS: u64 = 600;
    /// Longest instance name accepted unless `configoverride.maxnamelength` says otherwise
    pub const MAX_NAME_LENGTH: usize = 50;
}

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}
