//! Manifest schemas and media types.
//!
//! Covers the two list formats (Docker manifest list v2, OCI image index)
//! and the two single-image formats (Docker schema 2, OCI image manifest).
//! Anything else, including Docker schema 1, is unsupported.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{Digest, Platform};

/// Docker manifest list v2.
pub const DOCKER_V2_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// Docker image manifest schema 2.
pub const DOCKER_V2_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker image manifest schema 1.
pub const DOCKER_V2_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Signed Docker image manifest schema 1.
pub const DOCKER_V2_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// Docker image configuration.
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// OCI image configuration.
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Media types accepted when asking a registry for a manifest.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] =
    &[OCI_INDEX, DOCKER_V2_LIST, OCI_MANIFEST, DOCKER_V2_SCHEMA2];

/// Broad kind of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// A list of per-platform manifests.
    List,
    /// A single-platform image manifest.
    Image,
}

/// Classifies a manifest media type.
///
/// # Errors
///
/// Returns `StevedoreError::UnsupportedMediaType` for anything that is not
/// one of the four supported types.
pub fn classify(media_type: &str, reference: &str) -> Result<ManifestKind> {
    match media_type {
        DOCKER_V2_LIST | OCI_INDEX => Ok(ManifestKind::List),
        DOCKER_V2_SCHEMA2 | OCI_MANIFEST => Ok(ManifestKind::Image),
        other => Err(StevedoreError::UnsupportedMediaType {
            media_type: other.to_string(),
            reference: reference.to_string(),
        }),
    }
}

/// Returns whether `media_type` is a list type.
#[must_use]
pub fn is_list(media_type: &str) -> bool {
    matches!(media_type, DOCKER_V2_LIST | OCI_INDEX)
}

/// Guesses the media type of a manifest blob from its content.
///
/// An explicit `mediaType` field wins; otherwise the shape decides.
#[must_use]
pub fn guess_media_type(blob: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "schemaVersion", default)]
        schema_version: u32,
        #[serde(rename = "mediaType", default)]
        media_type: Option<String>,
        #[serde(default)]
        manifests: Option<serde_json::Value>,
        #[serde(default)]
        layers: Option<serde_json::Value>,
        #[serde(default)]
        signatures: Option<serde_json::Value>,
    }

    let Ok(probe) = serde_json::from_slice::<Probe>(blob) else {
        return String::new();
    };
    if let Some(mt) = probe.media_type.filter(|m| !m.is_empty()) {
        return mt;
    }
    match probe.schema_version {
        1 if probe.signatures.is_some() => DOCKER_V2_SCHEMA1_SIGNED.to_string(),
        1 => DOCKER_V2_SCHEMA1.to_string(),
        2 if probe.manifests.is_some() => OCI_INDEX.to_string(),
        2 if probe.layers.is_some() => OCI_MANIFEST.to_string(),
        _ => String::new(),
    }
}

/// Content descriptor, as found in lists and image manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size of the referenced content in bytes.
    pub size: u64,
    /// Alternate download locations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Arbitrary annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Platform of the referenced manifest (lists only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Describes `data` with the given media type.
    #[must_use]
    pub fn for_content(media_type: &str, data: &[u8]) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: Digest::sha256_of(data),
            size: data.len() as u64,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            platform: None,
        }
    }
}

/// A manifest list or image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageIndex {
    /// Always 2.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// List media type.
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Per-platform entries.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    /// List-level annotations (OCI only).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// Parses a list blob.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::MalformedData` if the blob is not a list.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let index: Self =
            serde_json::from_slice(blob).map_err(|e| StevedoreError::malformed("manifest list", e))?;
        if index.schema_version != 2 {
            return Err(StevedoreError::malformed(
                "manifest list",
                format!("unexpected schema version {}", index.schema_version),
            ));
        }
        Ok(index)
    }

    /// Serializes the list as `media_type`.
    ///
    /// Docker lists cannot carry annotations, so they are dropped for that
    /// format.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::UnsupportedMediaType` for non-list types.
    pub fn to_blob(&self, media_type: &str) -> Result<Vec<u8>> {
        let mut out = self.clone();
        match media_type {
            DOCKER_V2_LIST => {
                out.annotations.clear();
                for m in &mut out.manifests {
                    m.annotations.clear();
                    m.urls.clear();
                }
            }
            OCI_INDEX => {}
            other => {
                return Err(StevedoreError::UnsupportedMediaType {
                    media_type: other.to_string(),
                    reference: "manifest list".to_string(),
                });
            }
        }
        out.schema_version = 2;
        out.media_type = Some(media_type.to_string());
        Ok(serde_json::to_vec_pretty(&out)?)
    }
}

/// A single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Always 2.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Manifest media type.
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Image configuration blob.
    pub config: Descriptor,
    /// Filesystem layers, bottom first.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Annotations (OCI only).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    /// Parses an image manifest blob.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::MalformedData` on decode failure.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob).map_err(|e| StevedoreError::malformed("image manifest", e))
    }

    /// Serializes the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// The part of an image configuration that identifies its platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    /// CPU architecture.
    #[serde(default)]
    pub architecture: String,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Architecture variant.
    #[serde(default)]
    pub variant: Option<String>,
    /// Operating system version.
    #[serde(rename = "os.version", default)]
    pub os_version: Option<String>,
    /// Operating system features.
    #[serde(rename = "os.features", default)]
    pub os_features: Vec<String>,
}

impl ImageConfig {
    /// Parses a configuration blob, keeping only platform fields.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::MalformedData` on decode failure.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob).map_err(|e| StevedoreError::malformed("image config", e))
    }

    /// Returns the platform described by this configuration.
    #[must_use]
    pub fn platform(&self) -> Platform {
        Platform {
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            variant: self.variant.clone().filter(|v| !v.is_empty()),
            os_version: self.os_version.clone().filter(|v| !v.is_empty()),
            os_features: self.os_features.clone(),
        }
    }
}
