// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! `upload-crypto`: copies files produced inside an HSM init job into a
//! crypto secret.

use crate::constants::UPLOAD_MANAGER;
use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, Patch, PatchParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, instrument};

/// A `key=path` argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArg {
    pub key: String,
    pub path: PathBuf,
}

impl std::str::FromStr for FileArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((key, path)) = s.split_once('=') else {
            bail!("expected key=path, got '{}'", s);
        };
        if key.is_empty() || path.is_empty() {
            bail!("expected key=path, got '{}'", s);
        }
        Ok(FileArg {
            key: key.to_string(),
            path: PathBuf::from(path),
        })
    }
}

pub fn build_secret(name: &str, namespace: &str, data: BTreeMap<String, Vec<u8>>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.into_iter()
                .map(|(k, v)| (k, ByteString(v)))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Apply the files as keys of the secret, leaving other keys alone
#[instrument(skip(client, files))]
pub async fn upload(client: &Client, namespace: &str, secret: &str, files: &[FileArg]) -> Result<()> {
    let mut data = BTreeMap::new();
    for file in files {
        let content = tokio::fs::read(&file.path)
            .await
            .with_context(|| format!("reading {}", file.path.display()))?;
        if content.is_empty() {
            bail!("{} is empty", file.path.display());
        }
        data.insert(file.key.clone(), content);
    }

    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let keys: Vec<String> = data.keys().cloned().collect();
    api.patch(
        secret,
        &PatchParams::apply(UPLOAD_MANAGER).force(),
        &Patch::Apply(&build_secret(secret, namespace, data)),
    )
    .await
    .with_context(|| format!("uploading to secret {}/{}", namespace, secret))?;

    info!("Uploaded {:?} to secret {}/{}", keys, namespace, secret);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockService;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    #[test]
    fn test_parse_file_arg() {
        let arg: FileArg = "cert.pem=/output/ca-cert.pem".parse().unwrap();
        assert_eq!(arg.key, "cert.pem");
        assert_eq!(arg.path, PathBuf::from("/output/ca-cert.pem"));

        assert!("cert.pem".parse::<FileArg>().is_err());
        assert!("=/output/ca-cert.pem".parse::<FileArg>().is_err());
    }

    #[tokio::test]
    async fn test_upload_applies_file_contents() {
        let dir = std::env::temp_dir().join(format!("upload-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ca-cert.pem");
        std::fs::write(&path, "-----BEGIN CERTIFICATE-----\n").unwrap();

        let mock = MockService::new().echo_writes();
        upload(
            &mock.clone().into_client(),
            "fabric",
            "org1ca-ca-crypto",
            &[FileArg {
                key: "cert.pem".to_string(),
                path: path.clone(),
            }],
        )
        .await
        .unwrap();

        let patches = mock.requests_with_method("PATCH");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path, "/api/v1/namespaces/fabric/secrets/org1ca-ca-crypto");
        assert!(patches[0].query.contains("fieldManager=fabric-ca-operator-upload"));
        assert_eq!(
            patches[0].json()["data"]["cert.pem"],
            STANDARD.encode("-----BEGIN CERTIFICATE-----\n")
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_fails_before_any_request() {
        let mock = MockService::new().echo_writes();
        let result = upload(
            &mock.clone().into_client(),
            "fabric",
            "org1ca-ca-crypto",
            &[FileArg {
                key: "cert.pem".to_string(),
                path: PathBuf::from("/nonexistent/ca-cert.pem"),
            }],
        )
        .await;
        assert!(result.is_err());
        assert!(mock.requests().is_empty());
    }
}
