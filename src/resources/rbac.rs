// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! ServiceAccount, Role and RoleBinding used by CA pods and HSM init jobs.

use crate::error::Result;
use crate::resources::{apply, object_meta};
use crate::types::ibpca::IBPCA;
use k8s_openapi::api::core::v1::{LocalObjectReference, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::{Client, ResourceExt};
use tracing::instrument;

#[instrument(skip(client, ca), fields(ca = %ca.key()))]
pub async fn reconcile(client: &Client, ca: &IBPCA) -> Result<()> {
    apply(client, &build_service_account(ca)).await?;
    apply(client, &build_role(ca)).await?;
    apply(client, &build_role_binding(ca)).await?;
    Ok(())
}

pub fn build_service_account(ca: &IBPCA) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(ca, ca.name_any()),
        image_pull_secrets: (!ca.spec.image_pull_secrets.is_empty()).then(|| {
            ca.spec
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect()
        }),
        ..Default::default()
    }
}

/// HSM init jobs upload the generated CA cert into the crypto secret
pub fn build_role(ca: &IBPCA) -> Role {
    Role {
        metadata: object_meta(ca, ca.name_any()),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            verbs: ["get", "create", "patch", "update"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            ..Default::default()
        }]),
    }
}

pub fn build_role_binding(ca: &IBPCA) -> RoleBinding {
    RoleBinding {
        metadata: object_meta(ca, ca.name_any()),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: ca.name_any(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: ca.name_any(),
            namespace: ca.namespace(),
            ..Default::default()
        }]),
    }
}
