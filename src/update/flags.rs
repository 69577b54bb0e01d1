// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The set of changes a reconcile pass has to act on.

use crate::types::ibpca::IbpcaSpec;

/// Flags describing what changed on an instance since its last reconcile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Update {
    pub spec_updated: bool,
    pub ca_overrides_updated: bool,
    pub tlsca_overrides_updated: bool,
    pub restart_needed: bool,
    pub ca_crypto_updated: bool,
    pub ca_crypto_created: bool,
    pub renew_tls_cert: bool,
    pub images_updated: bool,
    pub fabric_version_updated: bool,
    pub ca_tag_updated: bool,
}

impl Update {
    /// Diff two versions of a spec the way the watch predicate does
    pub fn from_spec_diff(old: &IbpcaSpec, new: &IbpcaSpec) -> Self {
        if old == new {
            return Update::default();
        }

        let old_overrides = old.config_override.as_ref();
        let new_overrides = new.config_override.as_ref();
        let old_images = old.images.as_ref();
        let new_images = new.images.as_ref();

        Update {
            spec_updated: true,
            ca_overrides_updated: old_overrides.and_then(|o| o.ca.as_ref())
                != new_overrides.and_then(|o| o.ca.as_ref()),
            tlsca_overrides_updated: old_overrides.and_then(|o| o.tlsca.as_ref())
                != new_overrides.and_then(|o| o.tlsca.as_ref()),
            restart_needed: new.action.restart,
            renew_tls_cert: new.action.renew.tls_cert,
            images_updated: old_images != new_images,
            fabric_version_updated: old.fabric_version != new.fabric_version,
            ca_tag_updated: old_images.and_then(|i| i.ca_tag.as_ref())
                != new_images.and_then(|i| i.ca_tag.as_ref()),
            ..Default::default()
        }
    }

    pub fn config_overrides_updated(&self) -> bool {
        self.ca_overrides_updated || self.tlsca_overrides_updated
    }

    /// Names of the flags that are set, in declaration order
    pub fn true_flags(&self) -> Vec<&'static str> {
        [
            (self.spec_updated, "specUpdated"),
            (self.ca_overrides_updated, "caOverridesUpdated"),
            (self.tlsca_overrides_updated, "tlscaOverridesUpdated"),
            (self.restart_needed, "restartNeeded"),
            (self.ca_crypto_updated, "caCryptoUpdated"),
            (self.ca_crypto_created, "caCryptoCreated"),
            (self.renew_tls_cert, "renewTLSCert"),
            (self.images_updated, "imagesUpdated"),
            (self.fabric_version_updated, "fabricVersionUpdated"),
            (self.ca_tag_updated, "caTagUpdated"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        *self == Update::default()
    }
}
