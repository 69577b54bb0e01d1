// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cluster flavours a CA can be deployed on.
//!
//! Both flavours share the reconcile sequence in [`base`]; they only differ
//! in how the CA endpoints are exposed outside the cluster.

pub mod base;
pub mod k8s;
pub mod openshift;

pub use base::Offering;

use crate::config::{ClusterType, Config};
use crate::error::Result;
use crate::types::ibpca::{StatusType, IBPCA};
use kube::Client;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Kubernetes,
    OpenShift,
}

impl From<ClusterType> for Flavor {
    fn from(cluster_type: ClusterType) -> Self {
        match cluster_type {
            ClusterType::Kubernetes => Flavor::Kubernetes,
            ClusterType::OpenShift => Flavor::OpenShift,
        }
    }
}

impl Flavor {
    /// Expose the CA API and operations endpoints
    pub async fn expose(&self, client: &Client, ca: &IBPCA, config: &Config) -> Result<()> {
        match self {
            Flavor::Kubernetes => k8s::expose(client, ca, config).await,
            Flavor::OpenShift => openshift::expose(client, ca, config).await,
        }
    }
}

/// Status reported by the offering instead of the one derived from pods
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferingStatus {
    pub status_type: StatusType,
    pub reason: String,
    pub message: String,
}

/// Outcome of one pass over an instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileResult {
    /// Run again right away, the current update is not done yet
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
    pub status: Option<OfferingStatus>,
}

impl ReconcileResult {
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            ..Default::default()
        }
    }

    /// Keep the earliest of the requested requeue delays
    pub fn requeue_after(&mut self, after: Duration) {
        self.requeue_after = Some(match self.requeue_after {
            Some(current) => current.min(after),
            None => after,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_after_keeps_earliest() {
        let mut result = ReconcileResult::default();
        result.requeue_after(Duration::from_secs(300));
        result.requeue_after(Duration::from_secs(60));
        result.requeue_after(Duration::from_secs(120));
        assert_eq!(result.requeue_after, Some(Duration::from_secs(60)));
        assert!(!result.requeue);
    }

    #[test]
    fn test_flavor_follows_cluster_type() {
        assert_eq!(Flavor::from(ClusterType::OpenShift), Flavor::OpenShift);
        assert_eq!(Flavor::from(ClusterType::Kubernetes), Flavor::Kubernetes);
    }
}
