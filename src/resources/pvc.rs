// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::defaults;
use crate::error::Result;
use crate::resources::deployment::pvc_name;
use crate::resources::{apply, object_meta};
use crate::types::ibpca::IBPCA;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Create the data PVC once; its spec is immutable after creation
#[instrument(skip(client, ca), fields(ca = %ca.key()))]
pub async fn reconcile(client: &Client, ca: &IBPCA) -> Result<()> {
    let namespace = ca.namespace().unwrap_or_default();
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &namespace);
    let name = pvc_name(ca);

    if api.get_opt(&name).await?.is_some() {
        debug!("PVC {} already exists", name);
        return Ok(());
    }

    info!("Creating PVC {}", name);
    apply(client, &build(ca)).await?;
    Ok(())
}

pub fn build(ca: &IBPCA) -> PersistentVolumeClaim {
    let storage = ca
        .spec
        .storage
        .as_ref()
        .and_then(|s| s.ca.clone())
        .unwrap_or_default();
    let size = storage
        .size
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| defaults::STORAGE_SIZE.to_string());

    PersistentVolumeClaim {
        metadata: object_meta(ca, pvc_name(ca)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.class.filter(|c| !c.is_empty()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}
