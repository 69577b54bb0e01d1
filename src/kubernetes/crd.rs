// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CRD availability checking utilities

use crate::constants::crd::{POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS};
use crate::error::Result;
use crate::types::IBPCA;
use kube::{discovery::Discovery, Client, Resource};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Wait for the IBPCA CRD to become available in the cluster.
/// This uses exponential backoff starting at POLL_INTERVAL_SECS seconds.
pub async fn wait_for_ibpca_crd(client: &Client) -> Result<()> {
    let mut interval = POLL_INTERVAL_SECS;
    let gvk = format!("{}/{} {}", IBPCA::group(&()), IBPCA::version(&()), IBPCA::kind(&()));

    loop {
        match check_ibpca_crd_exists(client).await {
            Ok(true) => {
                info!("IBPCA CRD ({}) is available", gvk);
                return Ok(());
            }
            Ok(false) => {
                info!(
                    "IBPCA CRD ({}) not yet available, waiting {} seconds...",
                    gvk, interval
                );
            }
            Err(e) => {
                warn!(
                    "Error checking for IBPCA CRD: {}, retrying in {} seconds...",
                    e, interval
                );
            }
        }

        sleep(Duration::from_secs(interval)).await;

        // Exponential backoff with max cap
        interval = (interval * 2).min(POLL_MAX_INTERVAL_SECS);
    }
}

/// Check if the IBPCA CRD exists by attempting to discover it.
async fn check_ibpca_crd_exists(client: &Client) -> Result<bool> {
    let group = IBPCA::group(&());
    let discovery = Discovery::new(client.clone())
        .filter(&[group.as_ref()])
        .run()
        .await?;

    let mut found = false;
    for api_group in discovery.groups() {
        if api_group.name() != group {
            continue;
        }
        for (ar, _caps) in api_group.recommended_resources() {
            if ar.kind == IBPCA::kind(&()) && ar.version == IBPCA::version(&()) {
                found = true;
                break;
            }
        }
    }

    Ok(found)
}
