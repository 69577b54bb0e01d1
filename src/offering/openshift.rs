// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! OpenShift: endpoints go through passthrough Routes.

use crate::config::Config;
use crate::error::Result;
use crate::resources::route;
use crate::types::ibpca::IBPCA;
use kube::Client;

pub async fn expose(client: &Client, ca: &IBPCA, config: &Config) -> Result<()> {
    route::reconcile(client, ca, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockService;
    use crate::types::ibpca::tests::{accepted_spec, make_ca};

    #[tokio::test]
    async fn test_expose_applies_both_routes() {
        let mock = MockService::new().echo_writes();
        let config = Config {
            ingress_domain: Some("apps.example.com".to_string()),
            ..Default::default()
        };

        expose(&mock.clone().into_client(), &make_ca("org1ca", accepted_spec()), &config)
            .await
            .unwrap();

        let paths: Vec<String> = mock
            .requests_with_method("PATCH")
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(
            paths,
            vec![
                "/apis/route.openshift.io/v1/namespaces/fabric/routes/org1ca-ca",
                "/apis/route.openshift.io/v1/namespaces/fabric/routes/org1ca-operations",
            ]
        );
    }
}
