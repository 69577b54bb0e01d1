// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Plain Kubernetes: endpoints go through an Ingress.

use crate::config::Config;
use crate::error::Result;
use crate::resources::ingress;
use crate::types::ibpca::IBPCA;
use kube::Client;

pub async fn expose(client: &Client, ca: &IBPCA, config: &Config) -> Result<()> {
    ingress::reconcile(client, ca, config).await
}
