//! In-memory manifest list model.
//!
//! A [`ManifestList`] is an ordered set of [`Instance`]s, unique by digest,
//! plus list-level metadata. It is a plain owned value; callers that share
//! one across threads provide their own synchronization.

use std::collections::BTreeMap;

use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{Digest, ImageId, Platform};
use stevedore_transport::manifest::{
    DOCKER_V2_LIST, Descriptor, ImageIndex, OCI_INDEX, OCI_MANIFEST, is_list,
};

/// One platform-specific entry of a manifest list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    digest: Digest,
    platform: Platform,
    media_type: String,
    size: u64,
    annotations: BTreeMap<String, String>,
    source: Option<String>,
}

impl Instance {
    pub(crate) fn new(
        digest: Digest,
        platform: Platform,
        media_type: String,
        size: u64,
        annotations: BTreeMap<String, String>,
        source: Option<String>,
    ) -> Self {
        Self {
            digest,
            platform,
            media_type,
            size,
            annotations,
            source,
        }
    }

    /// Digest of the instance manifest.
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Platform the instance runs on.
    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Media type of the instance manifest.
    #[must_use]
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Size of the instance manifest in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Annotations carried by the list entry.
    #[must_use]
    pub const fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// Transport reference the instance was resolved from, if known.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            urls: Vec::new(),
            annotations: self.annotations.clone(),
            platform: Some(self.platform.clone()),
        }
    }
}

/// A multi-platform manifest list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestList {
    instances: Vec<Instance>,
    media_type: Option<String>,
    /// Encoding of the blob the list was parsed from.
    loaded_type: Option<String>,
    annotations: BTreeMap<String, String>,
    saved_as: Option<ImageId>,
}

impl ManifestList {
    /// Returns a new, empty list.
    #[must_use]
    pub fn create() -> Self {
        Self::default()
    }

    /// Digests of the current instances, in insertion order.
    #[must_use]
    pub fn instances(&self) -> Vec<Digest> {
        self.instances.iter().map(|i| i.digest.clone()).collect()
    }

    /// Iterates over the instances in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter()
    }

    /// Looks up one instance.
    #[must_use]
    pub fn instance(&self, digest: &Digest) -> Option<&Instance> {
        self.instances.iter().find(|i| &i.digest == digest)
    }

    /// Number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the list has no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Removes an instance.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if no instance has `digest`.
    pub fn remove(&mut self, digest: &Digest) -> Result<()> {
        let position = self
            .instances
            .iter()
            .position(|i| &i.digest == digest)
            .ok_or_else(|| StevedoreError::NotFound {
                kind: "instance",
                id: digest.to_string(),
            })?;
        let removed = self.instances.remove(position);
        tracing::info!(digest = %removed.digest, platform = %removed.platform, "removed instance");
        Ok(())
    }

    /// Adds an instance, or replaces the entry with the same digest while
    /// keeping its position.
    pub(crate) fn add_instance(&mut self, instance: Instance) {
        match self
            .instances
            .iter_mut()
            .find(|i| i.digest == instance.digest)
        {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
    }

    /// Overrides the media type used when serializing; `None` restores
    /// automatic selection.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::UnsupportedMediaType` for non-list types.
    pub fn set_media_type(&mut self, media_type: Option<&str>) -> Result<()> {
        if let Some(mt) = media_type {
            if !is_list(mt) {
                return Err(StevedoreError::UnsupportedMediaType {
                    media_type: mt.to_string(),
                    reference: "manifest list".into(),
                });
            }
        }
        self.media_type = media_type.map(str::to_string);
        Ok(())
    }

    /// Media type the list serializes as by default.
    ///
    /// Without an override this is an OCI index when any instance is an OCI
    /// manifest or annotations are present. Otherwise a parsed list keeps
    /// the encoding it was read in, and a new list is a Docker list.
    #[must_use]
    pub fn media_type(&self) -> &str {
        if let Some(mt) = &self.media_type {
            return mt;
        }
        let needs_oci = !self.annotations.is_empty()
            || self
                .instances
                .iter()
                .any(|i| i.media_type == OCI_MANIFEST || !i.annotations.is_empty());
        if needs_oci {
            OCI_INDEX
        } else {
            self.loaded_type.as_deref().unwrap_or(DOCKER_V2_LIST)
        }
    }

    /// Replaces the list-level annotations.
    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        self.annotations = annotations;
    }

    /// List-level annotations.
    #[must_use]
    pub const fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// Serializes the list as `media_type`, or its default media type.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::UnsupportedMediaType` for non-list types.
    pub fn serialize(&self, media_type: Option<&str>) -> Result<Vec<u8>> {
        let media_type = media_type.unwrap_or_else(|| self.media_type());
        let index = ImageIndex {
            schema_version: 2,
            media_type: None,
            manifests: self.instances.iter().map(Instance::descriptor).collect(),
            annotations: self.annotations.clone(),
        };
        index.to_blob(media_type)
    }

    /// Parses a serialized list. Instance sources are not part of the
    /// blob and start out unknown.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::MalformedData` if `blob` is not a list.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let index = ImageIndex::from_blob(blob)?;
        if let Some(mt) = index.media_type.as_deref() {
            if !is_list(mt) {
                return Err(StevedoreError::malformed(
                    "manifest list",
                    format!("media type {mt} is not a list type"),
                ));
            }
        }
        let instances = index
            .manifests
            .into_iter()
            .map(|d| Instance {
                digest: d.digest,
                platform: d.platform.unwrap_or_default(),
                media_type: d.media_type,
                size: d.size,
                annotations: d.annotations,
                source: None,
            })
            .collect();
        Ok(Self {
            instances,
            media_type: None,
            loaded_type: index.media_type,
            annotations: index.annotations,
            saved_as: None,
        })
    }

    /// Identifier of the store record this list was last saved to or
    /// loaded from.
    #[must_use]
    pub const fn saved_image(&self) -> Option<&ImageId> {
        self.saved_as.as_ref()
    }

    pub(crate) fn mark_saved(&mut self, id: ImageId) {
        self.saved_as = Some(id);
    }

    /// Digest to source reference map of instances with a known source.
    pub(crate) fn sources(&self) -> BTreeMap<Digest, String> {
        self.instances
            .iter()
            .filter_map(|i| i.source.clone().map(|s| (i.digest.clone(), s)))
            .collect()
    }

    pub(crate) fn apply_sources(&mut self, sources: &BTreeMap<Digest, String>) {
        for instance in &mut self.instances {
            if let Some(source) = sources.get(&instance.digest) {
                instance.source = Some(source.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_transport::manifest::DOCKER_V2_SCHEMA2;

    fn instance(seed: &str, arch: &str) -> Instance {
        Instance::new(
            Digest::sha256_of(seed.as_bytes()),
            Platform::new("linux", arch),
            DOCKER_V2_SCHEMA2.to_string(),
            seed.len() as u64,
            BTreeMap::new(),
            Some(format!("dir:/images/{seed}")),
        )
    }

    #[test]
    fn created_list_is_empty() {
        let list = ManifestList::create();
        assert!(list.instances().is_empty());
        assert!(list.is_empty());
        assert!(list.saved_image().is_none());
    }

    #[test]
    fn adding_same_digest_updates_in_place() {
        let mut list = ManifestList::create();
        list.add_instance(instance("a", "amd64"));
        list.add_instance(instance("b", "arm64"));
        let mut again = instance("a", "amd64");
        again.size = 99;
        list.add_instance(again);

        assert_eq!(list.len(), 2);
        assert_eq!(list.instances()[0], Digest::sha256_of(b"a"));
        assert_eq!(
            list.instance(&Digest::sha256_of(b"a")).map(Instance::size),
            Some(99)
        );
    }

    #[test]
    fn remove_unknown_digest_is_not_found() {
        let mut list = ManifestList::create();
        list.add_instance(instance("a", "amd64"));
        assert!(matches!(
            list.remove(&Digest::sha256_of(b"zzz")),
            Err(StevedoreError::NotFound { .. })
        ));
        list.remove(&Digest::sha256_of(b"a")).expect("remove");
        assert!(list.is_empty());
    }

    #[test]
    fn media_type_switches_to_oci_for_annotations() {
        let mut list = ManifestList::create();
        list.add_instance(instance("a", "amd64"));
        assert_eq!(list.media_type(), DOCKER_V2_LIST);

        let mut annotations = BTreeMap::new();
        let _ = annotations.insert("org.opencontainers.image.title".into(), "demo".into());
        list.set_annotations(annotations);
        assert_eq!(list.media_type(), OCI_INDEX);

        list.set_media_type(Some(DOCKER_V2_LIST)).expect("override");
        assert_eq!(list.media_type(), DOCKER_V2_LIST);
        assert!(list.set_media_type(Some(OCI_MANIFEST)).is_err());
    }

    #[test]
    fn serialized_list_parses_back_without_sources() {
        let mut list = ManifestList::create();
        list.add_instance(instance("a", "amd64"));
        list.add_instance(instance("b", "arm64"));
        let blob = list.serialize(None).expect("serialize");

        let parsed = ManifestList::from_blob(&blob).expect("parse");
        assert_eq!(parsed.instances(), list.instances());
        assert_eq!(parsed.iter().next().and_then(Instance::source), None);
        assert_eq!(
            parsed
                .instance(&Digest::sha256_of(b"b"))
                .map(|i| i.platform().architecture.as_str()),
            Some("arm64")
        );

        let mut restored = parsed;
        restored.apply_sources(&list.sources());
        assert_eq!(restored.iter().next().and_then(Instance::source), Some("dir:/images/a"));
    }

    #[test]
    fn image_manifest_blob_is_malformed_as_list() {
        let blob = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","manifests":[]}"#;
        assert!(matches!(
            ManifestList::from_blob(blob),
            Err(StevedoreError::MalformedData { .. })
        ));
        assert!(matches!(
            ManifestList::from_blob(b"not json"),
            Err(StevedoreError::MalformedData { .. })
        ));
    }

    #[test]
    fn parsed_list_promotes_to_oci_when_annotated() {
        let mut list = ManifestList::create();
        list.add_instance(instance("a", "amd64"));
        let blob = list.serialize(None).expect("serialize");

        let mut parsed = ManifestList::from_blob(&blob).expect("parse");
        assert_eq!(parsed.media_type(), DOCKER_V2_LIST);

        let mut annotations = BTreeMap::new();
        let _ = annotations.insert("org.opencontainers.image.title".into(), "demo".into());
        parsed.set_annotations(annotations);
        assert_eq!(parsed.media_type(), OCI_INDEX);

        let reparsed = ManifestList::from_blob(&parsed.serialize(None).expect("serialize"))
            .expect("parse");
        assert_eq!(
            reparsed.annotations().get("org.opencontainers.image.title"),
            Some(&"demo".to_string())
        );
    }

    #[test]
    fn parsed_oci_index_stays_oci() {
        let mut list = ManifestList::create();
        list.add_instance(instance("a", "amd64"));
        let blob = list.serialize(Some(OCI_INDEX)).expect("serialize");
        let parsed = ManifestList::from_blob(&blob).expect("parse");
        assert_eq!(parsed.media_type(), OCI_INDEX);
    }
}
