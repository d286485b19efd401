//! Domain primitive types used across the Stevedore workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{Result, StevedoreError};

/// Content-addressed digest in `algorithm:hex` form.
///
/// Only `sha256` and `sha512` are accepted, matching what registries serve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parses and validates a digest string.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Config` if the algorithm is unknown or the
    /// encoded part has the wrong length or alphabet.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = |why: &str| StevedoreError::Config {
            message: format!("invalid digest {value:?}: {why}"),
        };
        let (algorithm, encoded) = value
            .split_once(':')
            .ok_or_else(|| invalid("missing algorithm"))?;
        let expected_len = match algorithm {
            "sha256" => 64,
            "sha512" => 128,
            _ => return Err(invalid("unsupported algorithm")),
        };
        if encoded.len() != expected_len
            || !encoded
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(invalid("bad encoding"));
        }
        Ok(Self(value.to_string()))
    }

    /// Computes the SHA-256 digest of `data`.
    #[must_use]
    pub fn sha256_of(data: &[u8]) -> Self {
        Self(format!("sha256:{:x}", Sha256::digest(data)))
    }

    /// Computes the SHA-512 digest of `data`.
    #[must_use]
    pub fn sha512_of(data: &[u8]) -> Self {
        Self(format!("sha512:{:x}", Sha512::digest(data)))
    }

    /// Returns the algorithm part (e.g. `sha256`).
    #[must_use]
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map_or("", |(a, _)| a)
    }

    /// Returns the hex-encoded part.
    #[must_use]
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, e)| e)
    }

    /// Returns the full `algorithm:hex` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = StevedoreError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// Unique identifier for an image record in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(String);

impl ImageId {
    /// Creates an image ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random 64-character hex identifier.
    #[must_use]
    pub fn generate() -> Self {
        let seed = uuid::Uuid::new_v4();
        Self(Digest::sha256_of(seed.as_bytes()).encoded().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target platform of an image manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture in Go notation (`amd64`, `arm64`, `ppc64le`, ...).
    pub architecture: String,
    /// Operating system (`linux`, `windows`, ...).
    pub os: String,
    /// Architecture variant (`v7`, `v8`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Operating system version, used by Windows images.
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Required operating system features.
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
}

impl Platform {
    /// Creates a platform from OS and architecture.
    #[must_use]
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            ..Self::default()
        }
    }

    /// Returns the platform of the running host, in container notation.
    #[must_use]
    pub fn local() -> Self {
        let (architecture, variant) = local_architecture();
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: variant.map(str::to_string),
            ..Self::default()
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// Maps the Rust target architecture to the name registries use.
fn local_architecture() -> (&'static str, Option<&'static str>) {
    match std::env::consts::ARCH {
        "x86_64" => ("amd64", None),
        "x86" => ("386", None),
        "aarch64" => ("arm64", None),
        "arm" => ("arm", Some("v7")),
        "powerpc64" => ("ppc64le", None),
        "s390x" => ("s390x", None),
        "riscv64" => ("riscv64", None),
        "mips64" => ("mips64le", None),
        other => (other, None),
    }
}

/// Variant assumed for an architecture when a manifest omits it.
#[must_use]
pub fn default_variant(architecture: &str) -> Option<&'static str> {
    match architecture {
        "arm64" => Some("v8"),
        "arm" => Some("v7"),
        _ => None,
    }
}
