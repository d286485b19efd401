//! Per-operation system context.
//!
//! Carries the platform choices, registry access settings, and compression
//! preferences that transports and the copy engine consult.

use stevedore_common::types::{Platform, default_variant};

use crate::compression::Algorithm;

/// Settings that influence how a transport reads or writes images.
#[derive(Debug, Clone, Default)]
pub struct SystemContext {
    /// Architecture to select from lists instead of the local one.
    pub architecture_choice: Option<String>,
    /// Operating system to select instead of `linux`.
    pub os_choice: Option<String>,
    /// Architecture variant to select.
    pub variant_choice: Option<String>,
    /// Registries contacted over plain HTTP.
    pub insecure_registries: Vec<String>,
    /// Contact every registry over plain HTTP.
    pub insecure_all: bool,
    /// Basic credentials for registries, as `(username, password)`.
    pub registry_auth: Option<(String, String)>,
    /// Compression applied to layers written by a destination.
    pub compression_format: Option<Algorithm>,
}

impl SystemContext {
    /// Returns a context that selects the given architecture.
    #[must_use]
    pub fn for_architecture(architecture: impl Into<String>) -> Self {
        Self {
            architecture_choice: Some(architecture.into()),
            ..Self::default()
        }
    }

    /// Returns the platform this context asks for.
    #[must_use]
    pub fn wanted_platform(&self) -> Platform {
        let local = Platform::local();
        let architecture = self
            .architecture_choice
            .clone()
            .unwrap_or(local.architecture.clone());
        let variant = match (&self.variant_choice, &self.architecture_choice) {
            (Some(v), _) => Some(v.clone()),
            (None, Some(_)) => None,
            (None, None) => local.variant,
        };
        Platform {
            architecture,
            os: self.os_choice.clone().unwrap_or(local.os),
            variant,
            ..Platform::default()
        }
    }

    /// Returns whether `registry` should be contacted over plain HTTP.
    #[must_use]
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure_all || self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// Returns whether a manifest for `candidate` can run on `wanted`.
///
/// OS and architecture must match exactly. When a variant is wanted the
/// candidate must carry it, or omit it while it is the architecture's
/// default variant.
#[must_use]
pub fn platform_matches(wanted: &Platform, candidate: &Platform) -> bool {
    if wanted.os != candidate.os || wanted.architecture != candidate.architecture {
        return false;
    }
    match (&wanted.variant, &candidate.variant) {
        (None, _) => true,
        (Some(w), Some(c)) => w == c,
        (Some(w), None) => default_variant(&wanted.architecture) == Some(w.as_str()),
    }
}
