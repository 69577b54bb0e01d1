// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Version handling: the fabric-ca version table, spec defaults and config
//! migrations between fabric-ca releases.

use crate::constants::{defaults, OPERATOR_VERSION};
use crate::error::{OperatorError, Result};
use crate::initializer::server_config::ServerConfig;
use crate::initializer::{build_config_map, load_config};
use crate::resources::apply_config_map;
use crate::restart::{Reason, RestartManager};
use crate::types::ibpca::{CaImages, CaKind, IbpcaSpec, IBPCA};
use kube::Client;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument};

pub const DEFAULT_FABRIC_VERSION: &str = "1.5.12";

const CA_IMAGE: &str = "hyperledger/fabric-ca";
const INIT_IMAGE: &str = "registry.access.redhat.com/ubi8/ubi-minimal";
const INIT_TAG: &str = "8.10";

/// fabric-ca releases the operator knows default images for
const SUPPORTED_VERSIONS: [&str; 5] = ["1.4.9", "1.5.5", "1.5.7", "1.5.9", "1.5.12"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FabricVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FabricVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// First release with the 1.5 server config layout
const V1_5: FabricVersion = FabricVersion::new(1, 5, 0);

impl FromStr for FabricVersion {
    type Err = OperatorError;

    /// Accepts `1.5.12`, `v1.5.12` and build suffixes like `1.5.12-1`
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('v');
        let core = trimmed.split(['-', '+']).next().unwrap_or_default();
        let parts: Vec<&str> = core.split('.').collect();
        let invalid = || OperatorError::InvalidSpec(format!("invalid fabric-ca version '{}'", s));
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }
        let mut numbers = [0u32; 3];
        for (i, part) in parts.iter().enumerate() {
            numbers[i] = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl fmt::Display for FabricVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Default images for a fabric-ca version.
///
/// Versions missing from the table use the newest known patch release of
/// the same minor line.
pub fn default_images(version: &str) -> Option<CaImages> {
    let wanted: FabricVersion = version.parse().ok()?;
    let same_line: Vec<FabricVersion> = SUPPORTED_VERSIONS
        .iter()
        .filter_map(|v| v.parse::<FabricVersion>().ok())
        .filter(|v| v.major == wanted.major && v.minor == wanted.minor)
        .collect();
    let tag = if same_line.contains(&wanted) {
        wanted
    } else {
        same_line.into_iter().max()?
    };

    Some(CaImages {
        ca_image: Some(CA_IMAGE.to_string()),
        ca_tag: Some(tag.to_string()),
        ca_init_image: Some(INIT_IMAGE.to_string()),
        ca_init_tag: Some(INIT_TAG.to_string()),
        hsm_image: None,
        hsm_tag: None,
    })
}

fn fill(target: &mut Option<String>, default: Option<String>) -> bool {
    if target.as_deref().is_some_and(|t| !t.is_empty()) {
        return false;
    }
    match default {
        Some(d) => {
            *target = Some(d);
            true
        }
        None => false,
    }
}

/// Apply spec defaults: fabric version, replicas and images.
///
/// With `realign_images` the CA image tags are reset to the defaults of the
/// fabric version, used when the version changed without new images.
/// Returns the defaulted spec only when something changed.
pub fn apply_spec_defaults(spec: &IbpcaSpec, realign_images: bool) -> Result<Option<IbpcaSpec>> {
    let mut defaulted = spec.clone();
    let mut changed = false;

    if defaulted.fabric_version.as_deref().map_or(true, str::is_empty) {
        defaulted.fabric_version = Some(DEFAULT_FABRIC_VERSION.to_string());
        changed = true;
    }
    if defaulted.replicas.is_none() {
        defaulted.replicas = Some(defaults::REPLICAS);
        changed = true;
    }

    let version = defaulted
        .fabric_version
        .clone()
        .unwrap_or_else(|| DEFAULT_FABRIC_VERSION.to_string());
    let table = default_images(&version);
    let images = defaulted.images.get_or_insert_with(CaImages::default);

    if let Some(table) = table {
        if realign_images {
            for (target, default) in [
                (&mut images.ca_tag, &table.ca_tag),
                (&mut images.ca_init_tag, &table.ca_init_tag),
            ] {
                if target != default {
                    *target = default.clone();
                    changed = true;
                }
            }
        }
        changed |= fill(&mut images.ca_image, table.ca_image);
        changed |= fill(&mut images.ca_tag, table.ca_tag);
        changed |= fill(&mut images.ca_init_image, table.ca_init_image);
        changed |= fill(&mut images.ca_init_tag, table.ca_init_tag);
    }

    if !images.is_complete() {
        return Err(OperatorError::InvalidSpec(format!(
            "no default images for fabric-ca {}, set spec.images",
            version
        )));
    }
    Ok(changed.then_some(defaulted))
}

/// True when stored configs were written for a pre-1.5 server and the
/// instance now runs 1.5 or later
pub fn needs_config_migration(reconciled: Option<&str>, target: &str) -> bool {
    let (Some(from), Ok(to)) = (
        reconciled.and_then(|r| r.parse::<FabricVersion>().ok()),
        target.parse::<FabricVersion>(),
    ) else {
        return false;
    };
    from < V1_5 && to >= V1_5
}

/// Bring a server config to the 1.5 layout, returns true when it changed
pub fn migrate_config(config: &mut ServerConfig, target: &str) -> bool {
    let mut changed = false;
    if config.version() != Some(target) {
        config.set(&["version"], Value::String(target.to_string()));
        changed = true;
    }
    if config.get(&["ca", "reenrollignorecertexpiry"]).is_none() {
        config.set(&["ca", "reenrollignorecertexpiry"], Value::Bool(false));
        changed = true;
    }
    changed
}

/// Operator version recorded on the instance differs from the running one
pub fn operator_version_changed(ca: &IBPCA) -> bool {
    ca.status
        .as_ref()
        .and_then(|s| s.version.as_deref())
        .is_some_and(|v| v != OPERATOR_VERSION)
}

pub struct Migrator {
    client: Client,
    restart: Arc<RestartManager>,
}

impl Migrator {
    pub fn new(client: Client, restart: Arc<RestartManager>) -> Self {
        Self { client, restart }
    }

    /// Migrate stored server configs when the fabric version crossed into 1.5.
    ///
    /// Returns true when a config was rewritten and a restart requested.
    #[instrument(skip(self, ca), fields(ca = %ca.key()))]
    pub async fn migrate_fabric(&self, ca: &IBPCA) -> Result<bool> {
        let reconciled = ca
            .status
            .as_ref()
            .and_then(|s| s.versions.as_ref())
            .and_then(|v| v.reconciled.as_deref());
        let Some(target) = ca.spec.fabric_version.as_deref() else {
            return Ok(false);
        };
        if !needs_config_migration(reconciled, target) {
            return Ok(false);
        }

        info!(
            "Migrating fabric-ca config of {} from {} to {}",
            ca.key(),
            reconciled.unwrap_or_default(),
            target
        );
        let mut migrated = false;
        for kind in CaKind::ALL {
            let Some(mut config) = load_config(&self.client, ca, kind).await? else {
                continue;
            };
            if migrate_config(&mut config, target) {
                apply_config_map(&self.client, &build_config_map(ca, kind, &config)?)
                    .await
                    .map_err(|e| OperatorError::MigrationError(e.to_string()))?;
                migrated = true;
            }
        }

        if migrated {
            self.restart.request(ca, Reason::Migration).await?;
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::paths;
    use crate::test_utils::{config_map_json, MockService};
    use crate::types::ibpca::tests::{accepted_spec, make_ca};
    use crate::types::ibpca::{CaStatus, Versions};
    use std::time::Duration;

    #[test]
    fn test_parse_versions() {
        assert_eq!(
            "1.5.12".parse::<FabricVersion>().unwrap(),
            FabricVersion::new(1, 5, 12)
        );
        assert_eq!(
            "v1.4.9-2".parse::<FabricVersion>().unwrap(),
            FabricVersion::new(1, 4, 9)
        );
        assert_eq!(
            "1.5".parse::<FabricVersion>().unwrap(),
            FabricVersion::new(1, 5, 0)
        );
        assert!("latest".parse::<FabricVersion>().is_err());
        assert!("1.5.x".parse::<FabricVersion>().is_err());
    }

    #[test]
    fn test_default_images_fall_back_within_minor_line() {
        let exact = default_images("1.4.9").unwrap();
        assert_eq!(exact.ca_tag.as_deref(), Some("1.4.9"));

        let newer_patch = default_images("1.5.20").unwrap();
        assert_eq!(newer_patch.ca_tag.as_deref(), Some("1.5.12"));

        assert!(default_images("2.0.0").is_none());
    }

    #[test]
    fn test_defaults_fill_empty_spec() {
        let defaulted = apply_spec_defaults(&accepted_spec(), false)
            .unwrap()
            .unwrap();
        assert_eq!(defaulted.fabric_version.as_deref(), Some(DEFAULT_FABRIC_VERSION));
        assert_eq!(defaulted.replicas, Some(1));
        let images = defaulted.images.unwrap();
        assert_eq!(
            images.ca().as_deref(),
            Some("hyperledger/fabric-ca:1.5.12")
        );
        assert!(images.is_complete());
    }

    #[test]
    fn test_defaulted_spec_is_stable() {
        let defaulted = apply_spec_defaults(&accepted_spec(), false)
            .unwrap()
            .unwrap();
        assert!(apply_spec_defaults(&defaulted, false).unwrap().is_none());
    }

    #[test]
    fn test_user_images_are_kept() {
        let mut spec = accepted_spec();
        spec.fabric_version = Some("1.5.12".to_string());
        spec.replicas = Some(1);
        spec.images = Some(CaImages {
            ca_image: Some("registry.local/fabric-ca".to_string()),
            ca_tag: Some("custom".to_string()),
            ..Default::default()
        });

        let defaulted = apply_spec_defaults(&spec, false).unwrap().unwrap();
        let images = defaulted.images.unwrap();
        assert_eq!(images.ca().as_deref(), Some("registry.local/fabric-ca:custom"));
        assert_eq!(images.ca_init_image.as_deref(), Some(INIT_IMAGE));
    }

    #[test]
    fn test_version_change_realigns_tags() {
        let mut spec = apply_spec_defaults(&accepted_spec(), false)
            .unwrap()
            .unwrap();
        spec.fabric_version = Some("1.4.9".to_string());

        let defaulted = apply_spec_defaults(&spec, true).unwrap().unwrap();
        assert_eq!(
            defaulted.images.unwrap().ca_tag.as_deref(),
            Some("1.4.9")
        );
    }

    #[test]
    fn test_unknown_version_without_images_is_invalid() {
        let mut spec = accepted_spec();
        spec.fabric_version = Some("2.0.0".to_string());
        let err = apply_spec_defaults(&spec, false).unwrap_err();
        assert!(err.is_breaking());
    }

    #[test]
    fn test_migration_window() {
        assert!(needs_config_migration(Some("1.4.9"), "1.5.12"));
        assert!(!needs_config_migration(Some("1.5.7"), "1.5.12"));
        assert!(!needs_config_migration(None, "1.5.12"));
        assert!(!needs_config_migration(Some("1.4.9"), "1.4.9"));
    }

    #[test]
    fn test_migrate_config() {
        let mut config = ServerConfig::from_yaml("version: 1.4.9\nca:\n  name: ca\n").unwrap();
        assert!(migrate_config(&mut config, "1.5.12"));
        assert_eq!(config.version(), Some("1.5.12"));
        assert_eq!(
            config.get(&["ca", "reenrollignorecertexpiry"]),
            Some(&Value::Bool(false))
        );
        assert!(!migrate_config(&mut config, "1.5.12"));
    }

    #[test]
    fn test_operator_version_changed() {
        let mut ca = make_ca("org1ca", accepted_spec());
        assert!(!operator_version_changed(&ca));
        ca.status = Some(CaStatus {
            version: Some("0.0.1-old".to_string()),
            ..Default::default()
        });
        assert!(operator_version_changed(&ca));
    }

    #[tokio::test]
    async fn test_migrate_fabric_rewrites_configs_and_requests_restart() {
        let old = "version: 1.4.9\nca:\n  name: ca\n";
        let mock = MockService::new()
            .on_get(
                "/api/v1/namespaces/fabric/configmaps/org1ca-ca-config",
                200,
                &config_map_json("org1ca-ca-config", "fabric", &[(paths::SERVER_CONFIG_FILE, old)]),
            )
            .echo_writes();
        let client = mock.clone().into_client();
        let migrator = Migrator::new(
            client.clone(),
            Arc::new(RestartManager::new(client, Duration::from_secs(600))),
        );

        let mut spec = accepted_spec();
        spec.fabric_version = Some("1.5.12".to_string());
        let mut ca = make_ca("org1ca", spec);
        ca.status = Some(CaStatus {
            versions: Some(Versions {
                reconciled: Some("1.4.9".to_string()),
            }),
            ..Default::default()
        });

        assert!(migrator.migrate_fabric(&ca).await.unwrap());

        let patches = mock.requests_with_method("PATCH");
        let config_patch = patches
            .iter()
            .find(|r| r.path.ends_with("/configmaps/org1ca-ca-config"))
            .unwrap();
        let yaml = config_patch.json()["data"][paths::SERVER_CONFIG_FILE]
            .as_str()
            .unwrap()
            .to_string();
        assert!(yaml.contains("1.5.12"));
        assert!(yaml.contains("reenrollignorecertexpiry"));
        assert!(patches
            .iter()
            .any(|r| r.path.ends_with("/configmaps/ca-restart-config")));
    }
}
