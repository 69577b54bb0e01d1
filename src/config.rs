// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::defaults;
use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Flavour of cluster the operator runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    Kubernetes,
    OpenShift,
}

impl FromStr for ClusterType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "K8S" | "KUBERNETES" => Ok(ClusterType::Kubernetes),
            "OPENSHIFT" => Ok(ClusterType::OpenShift),
            other => bail!("unknown CLUSTER_TYPE '{}'", other),
        }
    }
}

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace the operator runs in, holds the HSM configuration
    pub operator_namespace: String,
    /// Namespace to watch, all namespaces when unset
    pub watch_namespace: Option<String>,
    pub cluster_type: ClusterType,
    /// Image running `upload-crypto` inside HSM init jobs
    pub operator_image: Option<String>,
    /// Domain used when an IBPCA does not set `spec.domain`
    pub ingress_domain: Option<String>,
    pub ingress_class: String,
    pub restart_wait: Duration,
    pub cert_warning_period_secs: i64,
    pub hsm_job_timeout: Duration,
    pub reconcile_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let operator_namespace = env::var("OPERATOR_NAMESPACE")
            .context("OPERATOR_NAMESPACE environment variable not set")?;
        let cluster_type = match non_empty("CLUSTER_TYPE") {
            Some(v) => v.parse()?,
            None => ClusterType::Kubernetes,
        };

        Ok(Config {
            operator_namespace,
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            cluster_type,
            operator_image: non_empty("OPERATOR_IMAGE"),
            ingress_domain: non_empty("INGRESS_DOMAIN"),
            ingress_class: non_empty("INGRESS_CLASS")
                .unwrap_or_else(|| defaults::INGRESS_CLASS.to_string()),
            restart_wait: Duration::from_secs(parse_or(
                "RESTART_WAIT_SECS",
                defaults::RESTART_WAIT_SECS,
            )?),
            cert_warning_period_secs: parse_or(
                "CERT_WARNING_PERIOD_SECS",
                defaults::CERT_WARNING_PERIOD_SECS,
            )?,
            hsm_job_timeout: Duration::from_secs(parse_or(
                "HSM_JOB_TIMEOUT_SECS",
                defaults::HSM_JOB_TIMEOUT_SECS,
            )?),
            reconcile_interval: Duration::from_secs(parse_or(
                "RECONCILE_INTERVAL_SECS",
                defaults::RECONCILE_INTERVAL_SECS,
            )?),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            operator_namespace: "default".to_string(),
            watch_namespace: None,
            cluster_type: ClusterType::Kubernetes,
            operator_image: None,
            ingress_domain: None,
            ingress_class: defaults::INGRESS_CLASS.to_string(),
            restart_wait: Duration::from_secs(defaults::RESTART_WAIT_SECS),
            cert_warning_period_secs: defaults::CERT_WARNING_PERIOD_SECS,
            hsm_job_timeout: Duration::from_secs(defaults::HSM_JOB_TIMEOUT_SECS),
            reconcile_interval: Duration::from_secs(defaults::RECONCILE_INTERVAL_SECS),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(key) {
        Some(v) => v
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, v)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_type_parsing() {
        assert_eq!("k8s".parse::<ClusterType>().unwrap(), ClusterType::Kubernetes);
        assert_eq!("OPENSHIFT".parse::<ClusterType>().unwrap(), ClusterType::OpenShift);
        assert!("rancher".parse::<ClusterType>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.restart_wait, Duration::from_secs(600));
        assert_eq!(config.ingress_class, "nginx");
        assert!(config.watch_namespace.is_none());
    }
}
