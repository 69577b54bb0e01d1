// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Last successfully reconciled spec, persisted so spec diffs survive
//! operator restarts.

use crate::constants::names;
use crate::error::Result;
use crate::resources::{self, apply_config_map};
use crate::types::ibpca::{IbpcaSpec, IBPCA};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Read the saved spec, `None` when it was never saved
#[instrument(skip(client, ca), fields(ca = %ca.key()))]
pub async fn load(client: &Client, ca: &IBPCA) -> Result<Option<IbpcaSpec>> {
    let namespace = ca.namespace().unwrap_or_default();
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);

    let Some(cm) = config_maps.get_opt(&ca.spec_state_name()).await? else {
        debug!("No saved spec found");
        return Ok(None);
    };
    decode(&cm)
}

/// Persist the spec that was just reconciled
#[instrument(skip(client, ca), fields(ca = %ca.key()))]
pub async fn save(client: &Client, ca: &IBPCA) -> Result<()> {
    let cm = encode(ca)?;
    apply_config_map(client, &cm).await?;
    Ok(())
}

fn encode(ca: &IBPCA) -> Result<ConfigMap> {
    let spec = serde_yaml::to_string(&ca.spec)?;
    Ok(ConfigMap {
        metadata: resources::object_meta(ca, ca.spec_state_name()),
        data: Some(BTreeMap::from([(names::SPEC_STATE_KEY.to_string(), spec)])),
        ..Default::default()
    })
}

fn decode(cm: &ConfigMap) -> Result<Option<IbpcaSpec>> {
    let Some(raw) = cm.data.as_ref().and_then(|d| d.get(names::SPEC_STATE_KEY)) else {
        return Ok(None);
    };
    Ok(Some(serde_yaml::from_str(raw)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{config_map_json, MockService};
    use crate::types::ibpca::tests::{accepted_spec, make_ca};

    #[test]
    fn test_encode_decode_keeps_spec() {
        let mut spec = accepted_spec();
        spec.fabric_version = Some("1.5.12".to_string());
        spec.domain = Some("example.com".to_string());
        let ca = make_ca("org1ca", spec.clone());

        let cm = encode(&ca).unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("org1ca-spec"));
        assert_eq!(decode(&cm).unwrap(), Some(spec));
    }

    #[test]
    fn test_decode_without_key() {
        assert_eq!(decode(&ConfigMap::default()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_missing_state() {
        let client = MockService::new().into_client();
        let ca = make_ca("org1ca", accepted_spec());

        assert_eq!(load(&client, &ca).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_load_saved_state() {
        let spec = accepted_spec();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        let client = MockService::new()
            .on_get(
                "/api/v1/namespaces/fabric/configmaps/org1ca-spec",
                200,
                &config_map_json("org1ca-spec", "fabric", &[(names::SPEC_STATE_KEY, &yaml)]),
            )
            .into_client();
        let ca = make_ca("org1ca", spec.clone());

        assert_eq!(load(&client, &ca).await.unwrap(), Some(spec));
    }
}
