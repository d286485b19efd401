//! Transport-qualified image references.
//!
//! Two transports are understood:
//! - `docker://[registry/]repository[:tag][@digest]` for registries,
//! - `dir:/path/to/directory` for a local directory layout.

use std::fmt;
use std::path::PathBuf;

use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::Digest;

/// Registry used when a reference names none.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Host serving the Docker Hub API.
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Tag used when a reference has neither tag nor digest.
const DEFAULT_TAG: &str = "latest";

/// A reference to an image in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerReference {
    /// Registry host, with optional port.
    pub registry: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Tag, if any.
    pub tag: Option<String>,
    /// Digest, if any.
    pub digest: Option<Digest>,
}

impl DockerReference {
    /// Parses `[registry/]repository[:tag][@digest]`.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::InvalidReference` for empty names, bad
    /// digests, or upper-case repositories.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |message: &str| StevedoreError::InvalidReference {
            reference: reference.to_string(),
            message: message.to_string(),
        };
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }

        let (name_tag, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => (
                name,
                Some(Digest::parse(digest).map_err(|e| invalid(&e.to_string()))?),
            ),
            None => (trimmed, None),
        };

        // A colon after the last slash separates the tag; one before it
        // belongs to a registry port.
        let last_slash = name_tag.rfind('/').map_or(0, |p| p + 1);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if tag.as_deref() == Some("") {
            return Err(invalid("empty tag"));
        }

        let (registry, repository) = split_registry(name);
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository path component"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };
        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Host to contact for the registry API.
    #[must_use]
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Tag or digest to request the primary manifest by; the digest wins.
    #[must_use]
    pub fn manifest_reference(&self) -> String {
        self.digest
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.tag.clone())
            .unwrap_or_else(|| DEFAULT_TAG.to_string())
    }

    /// Returns a copy of this reference pinned to `digest`.
    #[must_use]
    pub fn with_digest(&self, digest: &Digest) -> Self {
        Self {
            tag: None,
            digest: Some(digest.clone()),
            ..self.clone()
        }
    }
}

impl fmt::Display for DockerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Splits a name into registry and repository, applying Docker Hub
/// defaults when the first component is not a host.
fn split_registry(name: &str) -> (String, String) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains(['.', ':']) || first == "localhost" {
            return (first.to_string(), rest.to_string());
        }
    }
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{name}")
    };
    (DEFAULT_REGISTRY.to_string(), repository)
}

/// An image reference qualified by its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportReference {
    /// A registry image (`docker://`).
    Docker(DockerReference),
    /// A local directory layout (`dir:`).
    Dir(PathBuf),
}

impl TransportReference {
    /// Parses `transport:details`.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::InvalidReference` for unknown transports or
    /// malformed details.
    pub fn parse(reference: &str) -> Result<Self> {
        if let Some(rest) = reference.strip_prefix("docker:") {
            let Some(name) = rest.strip_prefix("//") else {
                return Err(StevedoreError::InvalidReference {
                    reference: reference.to_string(),
                    message: "docker references must start with docker://".into(),
                });
            };
            return Ok(Self::Docker(DockerReference::parse(name)?));
        }
        if let Some(path) = reference.strip_prefix("dir:") {
            if path.is_empty() {
                return Err(StevedoreError::InvalidReference {
                    reference: reference.to_string(),
                    message: "empty directory path".into(),
                });
            }
            return Ok(Self::Dir(PathBuf::from(path)));
        }
        Err(StevedoreError::InvalidReference {
            reference: reference.to_string(),
            message: "unsupported transport (expected docker:// or dir:)".into(),
        })
    }

    /// Name of the transport.
    #[must_use]
    pub const fn transport_name(&self) -> &'static str {
        match self {
            Self::Docker(_) => "docker",
            Self::Dir(_) => "dir",
        }
    }
}

impl fmt::Display for TransportReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker(r) => write!(f, "docker://{r}"),
            Self::Dir(p) => write!(f, "dir:{}", p.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAUSE_ARM64: &str =
        "sha256:f365626a556e58189fc21d099fc64603db0f440bff07f77c740989515c544a39";

    #[test]
    fn short_names_expand_to_docker_hub_library() {
        let r = DockerReference::parse("nginx").expect("parse");
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.api_host(), "registry-1.docker.io");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r = DockerReference::parse("localhost:5000/bogus/dest").expect("parse");
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "bogus/dest");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn digest_reference_has_no_default_tag() {
        let r = DockerReference::parse(&format!("k8s.gcr.io/pause@{PAUSE_ARM64}")).expect("parse");
        assert_eq!(r.registry, "k8s.gcr.io");
        assert_eq!(r.tag, None);
        assert_eq!(r.manifest_reference(), PAUSE_ARM64);
        assert_eq!(r.to_string(), format!("k8s.gcr.io/pause@{PAUSE_ARM64}"));
    }

    #[test]
    fn invalid_docker_references_are_rejected() {
        assert!(DockerReference::parse("").is_err());
        assert!(DockerReference::parse("Upper/Case").is_err());
        assert!(DockerReference::parse("repo@sha256:short").is_err());
        assert!(DockerReference::parse("repo:").is_err());
    }

    #[test]
    fn transport_prefixes_select_variant() {
        let docker = TransportReference::parse("docker://k8s.gcr.io/pause:3.1").expect("docker");
        assert_eq!(docker.transport_name(), "docker");
        assert_eq!(docker.to_string(), "docker://k8s.gcr.io/pause:3.1");

        let dir = TransportReference::parse("dir:/tmp/out").expect("dir");
        assert_eq!(dir, TransportReference::Dir(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn unknown_transports_are_rejected() {
        assert!(TransportReference::parse("ftp://example.com/image").is_err());
        assert!(TransportReference::parse("docker:nginx").is_err());
        assert!(TransportReference::parse("dir:").is_err());
    }
}
