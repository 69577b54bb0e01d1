// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! fabric-ca server configuration handling.
//!
//! The configuration is kept as a JSON value so user overrides, which are
//! free-form, can be merged over it without a typed model of every field.

use crate::constants::{crypto_keys, paths};
use crate::error::{OperatorError, Result};
use crate::types::ibpca::CaKind;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const DEFAULT_CA: &str = include_str!("defaults/ca.yaml");
const DEFAULT_TLSCA: &str = include_str!("defaults/tlsca.yaml");

/// Config fields that may carry base64 PEM material, and the secret key it moves to
const USER_CRYPTO_FIELDS: [(&[&str], &str); 5] = [
    (&["ca", "certfile"], crypto_keys::CERT),
    (&["ca", "keyfile"], crypto_keys::KEY),
    (&["ca", "chainfile"], crypto_keys::CHAIN),
    (&["tls", "certfile"], crypto_keys::TLS_CERT),
    (&["tls", "keyfile"], crypto_keys::TLS_KEY),
];

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    value: Value,
}

impl ServerConfig {
    /// Built-in configuration for a fresh CA
    pub fn default_for(kind: CaKind) -> Result<Self> {
        let raw = match kind {
            CaKind::Enrollment => DEFAULT_CA,
            CaKind::Tls => DEFAULT_TLSCA,
        };
        Self::from_yaml(raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(raw)
            .map_err(|e| OperatorError::ConfigError(format!("unreadable server config: {}", e)))?;
        if !value.is_object() {
            return Err(OperatorError::ConfigError(
                "server config must be a mapping".to_string(),
            ));
        }
        Ok(Self { value })
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.value)?)
    }

    /// Merge a user override over this config
    pub fn merge_override(&mut self, overlay: &Value) {
        merge(&mut self.value, overlay);
    }

    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.value, |v, key| v.get(*key))
    }

    pub fn get_str(&self, path: &[&str]) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Set a value, creating intermediate mappings as needed
    pub fn set(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut current = &mut self.value;
        for key in parents {
            if !current.get(*key).is_some_and(Value::is_object) {
                current[*key] = Value::Object(Map::new());
            }
            current = &mut current[*key];
        }
        current[*last] = value;
    }

    pub fn remove(&mut self, path: &[&str]) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let parent = parents
            .iter()
            .try_fold(&mut self.value, |v, key| v.get_mut(*key));
        if let Some(Value::Object(map)) = parent {
            map.remove(*last);
        }
    }

    pub fn is_pkcs11(&self) -> bool {
        self.get_str(&["bccsp", "default"])
            .is_some_and(|d| d.eq_ignore_ascii_case("PKCS11"))
    }

    pub fn ca_name(&self) -> Option<&str> {
        self.get_str(&["ca", "name"]).filter(|n| !n.is_empty())
    }

    pub fn version(&self) -> Option<&str> {
        self.get_str(&["version"])
    }

    pub fn pkcs11_library(&self) -> Option<&str> {
        self.get_str(&["bccsp", "pkcs11", "library"])
    }

    /// Move base64 PEM values out of the config.
    ///
    /// Returns the decoded PEMs keyed by their crypto secret key. Fields holding
    /// anything else, e.g. a file path, stay untouched.
    pub fn take_user_crypto(&mut self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut crypto = BTreeMap::new();
        for (path, key) in USER_CRYPTO_FIELDS {
            let Some(raw) = self.get_str(path).filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            let Some(pem) = decode_pem(raw) else {
                continue;
            };
            crypto.insert(key.to_string(), pem);
            self.remove(path);
        }
        Ok(crypto)
    }

    /// Point crypto file fields at the mounted crypto secret.
    ///
    /// `present` lists the keys that exist in the secret; optional files such
    /// as the chain are only referenced when present.
    pub fn point_to_mount(&mut self, kind: CaKind, present: &[String], hsm: bool) {
        let dir = match kind {
            CaKind::Enrollment => paths::CA_CRYPTO,
            CaKind::Tls => paths::TLSCA_CRYPTO,
        };
        let file = |key: &str| Value::String(format!("{}/{}", dir, key));
        let has = |key: &str| present.iter().any(|p| p == key);

        self.set(&["ca", "certfile"], file(crypto_keys::CERT));
        if hsm {
            self.remove(&["ca", "keyfile"]);
        } else {
            self.set(&["ca", "keyfile"], file(crypto_keys::KEY));
        }
        if has(crypto_keys::CHAIN) {
            self.set(&["ca", "chainfile"], file(crypto_keys::CHAIN));
        } else {
            self.remove(&["ca", "chainfile"]);
        }

        if kind == CaKind::Enrollment {
            self.set(&["tls", "enabled"], Value::Bool(true));
            self.set(&["tls", "certfile"], file(crypto_keys::TLS_CERT));
            self.set(&["tls", "keyfile"], file(crypto_keys::TLS_KEY));
            self.set(
                &["operations", "tls", "cert", "file"],
                file(crypto_keys::OPERATIONS_CERT),
            );
            self.set(
                &["operations", "tls", "key", "file"],
                file(crypto_keys::OPERATIONS_KEY),
            );
        }
    }

    /// The HSM library is copied into a shared volume by the daemon setup
    pub fn use_copied_library(&mut self) {
        let Some(library) = self.pkcs11_library() else {
            return;
        };
        let file = library.rsplit('/').next().unwrap_or(library).to_string();
        self.set(
            &["bccsp", "pkcs11", "library"],
            Value::String(format!("{}/{}", paths::HSM_LIBRARY_DIR, file)),
        );
    }
}

/// Deep merge: mappings merge key by key, nulls are ignored and every other
/// value replaces what was there
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                if value.is_null() {
                    continue;
                }
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Decode a base64 value that holds PEM data
fn decode_pem(raw: &str) -> Option<Vec<u8>> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = STANDARD.decode(compact).ok()?;
    decoded
        .windows(b"-----BEGIN".len())
        .any(|w| w == b"-----BEGIN")
        .then_some(decoded)
}
