// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::config::Config;
use crate::error::Result;
use crate::resources::{apply, endpoints, object_meta};
use crate::types::route::{Route, RoutePort, RouteSpec, RouteTargetReference, TlsConfig};
use crate::types::ibpca::IBPCA;
use kube::{Client, ResourceExt};
use tracing::{debug, instrument};

/// OpenShift routes for the API and operations endpoints
#[instrument(skip(client, ca, config), fields(ca = %ca.key()))]
pub async fn reconcile(client: &Client, ca: &IBPCA, config: &Config) -> Result<()> {
    let Some(endpoints) = endpoints(ca, config) else {
        debug!("No domain configured, skipping routes");
        return Ok(());
    };
    apply(client, &build(ca, "ca", &endpoints.api, "https")).await?;
    apply(client, &build(ca, "operations", &endpoints.operations, "operations")).await?;
    Ok(())
}

pub fn build(ca: &IBPCA, suffix: &str, host: &str, target_port: &str) -> Route {
    let mut route = Route::new(
        &format!("{}-{}", ca.name_any(), suffix),
        RouteSpec {
            host: Some(host.to_string()),
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: ca.name_any(),
                weight: Some(100),
            },
            port: Some(RoutePort {
                target_port: target_port.to_string(),
            }),
            tls: Some(TlsConfig {
                termination: "passthrough".to_string(),
                insecure_edge_termination_policy: Some("None".to_string()),
            }),
            wildcard_policy: Some("None".to_string()),
        },
    );
    route.metadata = object_meta(ca, route.name_any());
    route
}
