// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resource managers for the objects an IBPCA owns.
//!
//! Every manager builds the desired object as a pure function and hands it to
//! [`apply`], which server-side applies it under the operator field manager.

pub mod deployment;
pub mod ingress;
pub mod pvc;
pub mod rbac;
pub mod route;
pub mod service;

use crate::config::Config;
use crate::constants::{labels, OPERATOR_NAME};
use crate::error::{OperatorError, Result};
use crate::types::ibpca::IBPCA;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info, instrument};

/// Labels put on every object owned by an instance
pub fn standard_labels(ca: &IBPCA) -> BTreeMap<String, String> {
    let mut l = selector_labels(ca);
    l.insert(labels::NAME.to_string(), labels::NAME_VALUE.to_string());
    l.insert(labels::INSTANCE.to_string(), ca.name_any());
    l.insert(
        labels::MANAGED_BY.to_string(),
        labels::MANAGED_BY_VALUE.to_string(),
    );
    l
}

/// Labels selecting the pods of an instance
pub fn selector_labels(ca: &IBPCA) -> BTreeMap<String, String> {
    BTreeMap::from([(labels::APP.to_string(), ca.name_any())])
}

/// Controller owner reference so owned objects are garbage collected with the CA
pub fn owner_reference(ca: &IBPCA) -> OwnerReference {
    OwnerReference {
        api_version: IBPCA::api_version(&()).to_string(),
        kind: IBPCA::kind(&()).to_string(),
        name: ca.name_any(),
        uid: ca.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata for an owned object
pub fn object_meta(ca: &IBPCA, name: impl Into<String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: ca.namespace(),
        labels: Some(standard_labels(ca)),
        owner_references: Some(vec![owner_reference(ca)]),
        ..Default::default()
    }
}

/// External hostnames of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub api: String,
    pub operations: String,
}

/// Hostnames derived from `spec.domain`, falling back to the operator domain.
/// Instances without any domain are not exposed outside the cluster.
pub fn endpoints(ca: &IBPCA, config: &Config) -> Option<Endpoints> {
    let domain = ca
        .spec
        .domain
        .clone()
        .filter(|d| !d.is_empty())
        .or_else(|| config.ingress_domain.clone())?;
    let prefix = format!("{}-{}", ca.namespace().unwrap_or_default(), ca.name_any());
    Some(Endpoints {
        api: format!("{}-ca.{}", prefix, domain),
        operations: format!("{}-operations.{}", prefix, domain),
    })
}

/// Server-side apply a namespaced object, creating or updating it
#[instrument(skip(client, obj), fields(kind = %K::kind(&()), name = %obj.name_any()))]
pub async fn apply<K>(client: &Client, obj: &K) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = obj.meta().name.clone().ok_or_else(|| {
        OperatorError::SerializationError(format!("{} has no name", K::kind(&())))
    })?;
    let namespace = obj.namespace().unwrap_or_default();
    let api: Api<K> = Api::namespaced(client.clone(), &namespace);

    debug!("Applying {} {}/{}", K::kind(&()), namespace, name);
    let applied = api
        .patch(&name, &PatchParams::apply(OPERATOR_NAME).force(), &Patch::Apply(obj))
        .await?;
    Ok(applied)
}

/// Delete a namespaced object, treating "not found" as done
pub async fn delete_if_exists<K>(client: &Client, namespace: &str, name: &str) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => {
            info!("Deleted {} {}/{}", K::kind(&()), namespace, name);
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!("{} {}/{} already gone", K::kind(&()), namespace, name);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn apply_config_map(client: &Client, cm: &ConfigMap) -> Result<ConfigMap> {
    apply(client, cm).await
}

pub async fn apply_secret(client: &Client, secret: &Secret) -> Result<Secret> {
    apply(client, secret).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockService;
    use crate::types::ibpca::tests::{accepted_spec, make_ca};

    #[test]
    fn test_owner_reference_points_at_ca() {
        let ca = make_ca("org1ca", accepted_spec());
        let owner = owner_reference(&ca);

        assert_eq!(owner.kind, "IBPCA");
        assert_eq!(owner.api_version, "ibp.com/v1beta1");
        assert_eq!(owner.name, "org1ca");
        assert_eq!(owner.uid, "uid-1234");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_standard_labels_include_selector() {
        let ca = make_ca("org1ca", accepted_spec());
        let l = standard_labels(&ca);

        assert_eq!(l.get("app").unwrap(), "org1ca");
        assert_eq!(l.get(labels::MANAGED_BY).unwrap(), OPERATOR_NAME);
        for (k, v) in selector_labels(&ca) {
            assert_eq!(l.get(&k), Some(&v));
        }
    }

    #[test]
    fn test_endpoints_prefer_spec_domain() {
        let mut spec = accepted_spec();
        spec.domain = Some("apps.example.com".to_string());
        let config = Config {
            ingress_domain: Some("fallback.io".to_string()),
            ..Default::default()
        };

        let endpoints = endpoints(&make_ca("org1ca", spec), &config).unwrap();
        assert_eq!(endpoints.api, "fabric-org1ca-ca.apps.example.com");
        assert_eq!(endpoints.operations, "fabric-org1ca-operations.apps.example.com");

        let fallback = super::endpoints(&make_ca("org1ca", accepted_spec()), &config).unwrap();
        assert_eq!(fallback.api, "fabric-org1ca-ca.fallback.io");
        assert!(super::endpoints(&make_ca("org1ca", accepted_spec()), &Config::default()).is_none());
    }

    #[tokio::test]
    async fn test_apply_uses_server_side_apply() {
        let mock = MockService::new().echo_writes();
        let client = mock.clone().into_client();
        let ca = make_ca("org1ca", accepted_spec());
        let cm = ConfigMap {
            metadata: object_meta(&ca, "org1ca-ca-config"),
            ..Default::default()
        };

        apply_config_map(&client, &cm).await.unwrap();

        let patches = mock.requests_with_method("PATCH");
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].path,
            "/api/v1/namespaces/fabric/configmaps/org1ca-ca-config"
        );
        assert!(patches[0].query.contains("fieldManager=fabric-ca-operator"));
        assert!(patches[0].query.contains("force=true"));
        assert_eq!(patches[0].json()["kind"], "ConfigMap");
    }

    #[tokio::test]
    async fn test_delete_missing_object_is_ok() {
        let client = MockService::new().into_client();
        delete_if_exists::<ConfigMap>(&client, "fabric", "gone")
            .await
            .unwrap();
    }
}
