// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use kube::{CustomResource, ResourceExt};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "ibp.com", version = "v1beta1", kind = "IBPCA", plural = "ibpcas")]
#[kube(namespaced)]
#[kube(status = "CaStatus")]
#[kube(shortname = "ca")]
#[serde(rename_all = "camelCase")]
pub struct IbpcaSpec {
    #[serde(default)]
    pub license: License,
    /// fabric-ca version
    #[serde(default, rename = "version", skip_serializing_if = "Option::is_none")]
    pub fabric_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<CaImages>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<CaResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<CaStorage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,
    #[serde(rename = "configoverride", skip_serializing_if = "Option::is_none")]
    pub config_override: Option<ConfigOverride>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hsm: Option<HsmSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_seconds_warning_period: Option<i64>,
    #[serde(default)]
    pub action: CaAction,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct License {
    #[serde(default)]
    pub accept: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaImages {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_init_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_init_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsm_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hsm_tag: Option<String>,
}

impl CaImages {
    pub fn ca(&self) -> Option<String> {
        image_ref(&self.ca_image, &self.ca_tag)
    }

    pub fn ca_init(&self) -> Option<String> {
        image_ref(&self.ca_init_image, &self.ca_init_tag)
    }

    pub fn hsm(&self) -> Option<String> {
        image_ref(&self.hsm_image, &self.hsm_tag)
    }

    /// True when the images needed to run the CA are all set
    pub fn is_complete(&self) -> bool {
        self.ca().is_some() && self.ca_init().is_some()
    }
}

fn image_ref(image: &Option<String>, tag: &Option<String>) -> Option<String> {
    match (image.as_deref(), tag.as_deref()) {
        (Some(i), Some(t)) if !i.is_empty() && !t.is_empty() => Some(format!("{}:{}", i, t)),
        _ => None,
    }
}

/// Requests and limits as quantity strings, e.g. `{"cpu": "100m"}`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<ResourceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<ResourceSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hsm_daemon: Option<ResourceSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct CaStorage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<StorageSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct StorageSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct ServiceSpec {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

/// Free-form fabric-ca server config fragments merged over the defaults
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct ConfigOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub ca: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub tlsca: Option<serde_json::Value>,
    #[serde(rename = "maxnamelength", skip_serializing_if = "Option::is_none")]
    pub max_name_length: Option<usize>,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct HsmSpec {
    /// Address of the PKCS#11 proxy, e.g. `tcp://pkcs11-proxy:2345`
    #[serde(rename = "pkcs11endpoint", skip_serializing_if = "Option::is_none")]
    pub pkcs11_endpoint: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct IngressSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
}

/// One-shot actions, reset by the operator once performed
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct CaAction {
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub renew: RenewAction,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct RenewAction {
    #[serde(default, rename = "tlscert")]
    pub tls_cert: bool,
}

impl CaAction {
    pub fn any(&self) -> bool {
        self.restart || self.renew.tls_cert
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum StatusType {
    Deploying,
    Deployed,
    Warning,
    Error,
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusType::Deploying => "Deploying",
            StatusType::Deployed => "Deployed",
            StatusType::Warning => "Warning",
            StatusType::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaStatus {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub status_type: Option<StatusType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<String>,
    /// Operator version that last reconciled this instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versions: Option<Versions>,
    #[serde(rename = "errorcode", skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
pub struct Versions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<String>,
}

/// The two fabric-ca server instances run per IBPCA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaKind {
    /// Issues enrollment identities
    Enrollment,
    /// Issues transport TLS certificates
    Tls,
}

impl CaKind {
    pub const ALL: [CaKind; 2] = [CaKind::Enrollment, CaKind::Tls];

    /// Prefix used in resource names and config keys
    pub fn prefix(&self) -> &'static str {
        match self {
            CaKind::Enrollment => "ca",
            CaKind::Tls => "tlsca",
        }
    }
}

impl fmt::Display for CaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl IBPCA {
    /// Key of this instance in the update queue and caches
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn crypto_secret_name(&self, kind: CaKind) -> String {
        format!("{}-{}-crypto", self.name_any(), kind.prefix())
    }

    pub fn config_map_name(&self, kind: CaKind) -> String {
        format!("{}-{}-config", self.name_any(), kind.prefix())
    }

    pub fn init_job_name(&self, kind: CaKind) -> String {
        format!("{}-{}-init", self.name_any(), kind.prefix())
    }

    pub fn spec_state_name(&self) -> String {
        format!("{}-spec", self.name_any())
    }

    pub fn connection_profile_name(&self) -> String {
        format!("{}-connection-profile", self.name_any())
    }

    /// Overrides for the given CA, if any
    pub fn config_override(&self, kind: CaKind) -> Option<&serde_json::Value> {
        let overrides = self.spec.config_override.as_ref()?;
        match kind {
            CaKind::Enrollment => overrides.ca.as_ref(),
            CaKind::Tls => overrides.tlsca.as_ref(),
        }
    }

    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(crate::constants::defaults::REPLICAS)
    }

    pub fn hsm_proxy_endpoint(&self) -> Option<&str> {
        self.spec
            .hsm
            .as_ref()
            .and_then(|h| h.pkcs11_endpoint.as_deref())
            .filter(|e| !e.is_empty())
    }

    /// An instance with a status type has been reconciled before
    pub fn has_status_type(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.status_type.is_some())
    }
}
