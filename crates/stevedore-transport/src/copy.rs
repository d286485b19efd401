//! Copying images and lists between transports.
//!
//! [`copy_image`] reads the primary manifest of a source, selects which
//! list instances to carry over, copies their configs and layers (applying
//! compression overrides), writes the instance manifests, and finally writes
//! the (possibly pruned or extended) primary manifest.

use std::collections::HashSet;

use stevedore_common::context::Context;
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::Digest;

use crate::compression::Algorithm;
use crate::manifest::{
    DOCKER_CONFIG, DOCKER_V2_LIST, DOCKER_V2_SCHEMA2, Descriptor, ImageIndex, ImageManifest,
    ManifestKind, OCI_CONFIG, OCI_INDEX, OCI_MANIFEST, classify,
};
use crate::source::{ImageDestination, ImageSource};
use crate::system::{SystemContext, platform_matches};

/// Annotation prefix marking an instance added as a compression variant.
pub const COMPRESSION_ANNOTATION_PREFIX: &str = "io.github.containers.compression.";

/// Which instances of a list a copy carries over.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Every instance.
    #[default]
    AllImages,
    /// Only the instance matching the source context's platform; the
    /// destination receives that image alone, not a list.
    LocalPlatformOnly,
    /// Only the listed digests. Digests absent from the list are ignored.
    SpecificDigests(Vec<Digest>),
}

/// Options for [`copy_image`].
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Context used when reading from the source.
    pub source_ctx: SystemContext,
    /// Context used when writing; its `compression_format` applies to layers.
    pub dest_ctx: SystemContext,
    /// Instances to copy.
    pub selection: SelectionPolicy,
    /// Recompress every layer to `dest_ctx.compression_format`, not only
    /// uncompressed ones.
    pub force_compression_format: bool,
    /// Extra compression variants appended for each instance when copying
    /// all images.
    pub add_compression: Vec<Algorithm>,
}

/// Result of a successful copy.
#[derive(Debug, Clone)]
pub struct CopyOutcome {
    /// The primary manifest written to the destination.
    pub manifest: Vec<u8>,
    /// Digest of `manifest`.
    pub digest: Digest,
}

/// Target compression for one image copy: the algorithm and whether every
/// layer must use it.
type CompressionTarget = Option<(Algorithm, bool)>;

/// Picks the list entry that best matches the platform `sys` asks for.
///
/// An entry whose variant matches exactly is preferred over one that only
/// matches through the architecture's default variant.
#[must_use]
pub fn choose_instance<'a>(index: &'a ImageIndex, sys: &SystemContext) -> Option<&'a Descriptor> {
    let wanted = sys.wanted_platform();
    let candidates: Vec<&Descriptor> = index
        .manifests
        .iter()
        .filter(|d| {
            d.platform
                .as_ref()
                .is_some_and(|p| platform_matches(&wanted, p))
        })
        .collect();
    candidates
        .iter()
        .find(|d| d.platform.as_ref().is_some_and(|p| p.variant == wanted.variant))
        .or_else(|| candidates.first())
        .copied()
}

/// Copies the image or list served by `source` into `destination`.
///
/// # Errors
///
/// - `StevedoreError::Config` if a forced compression has no format.
/// - `StevedoreError::UnsupportedMediaType` for unsupported manifests.
/// - `StevedoreError::NotFound` if `LocalPlatformOnly` matches nothing.
/// - Transport errors from either side, and `Cancelled`.
pub fn copy_image(
    ctx: &Context,
    source: &dyn ImageSource,
    destination: &mut dyn ImageDestination,
    options: &CopyOptions,
) -> Result<CopyOutcome> {
    if options.force_compression_format && options.dest_ctx.compression_format.is_none() {
        return Err(StevedoreError::Config {
            message: "forcing compression requires a compression format".into(),
        });
    }
    let target = options
        .dest_ctx
        .compression_format
        .map(|algo| (algo, options.force_compression_format));

    let (primary, media_type) = source.manifest(ctx, None)?;
    tracing::info!(
        source = %source.reference(),
        destination = %destination.reference(),
        media_type = %media_type,
        "copying image"
    );

    let outcome = match classify(&media_type, &source.reference())? {
        ManifestKind::Image => {
            let (manifest, mt) =
                copy_single(ctx, source, destination, &primary, &media_type, target)?;
            destination.put_manifest(ctx, &manifest, &mt, None)?;
            outcome_for(manifest)
        }
        ManifestKind::List => copy_list(ctx, source, destination, options, &primary, target)?,
    };
    destination.commit(ctx)?;
    tracing::info!(digest = %outcome.digest, "copy complete");
    Ok(outcome)
}

fn outcome_for(manifest: Vec<u8>) -> CopyOutcome {
    let digest = Digest::sha256_of(&manifest);
    CopyOutcome { manifest, digest }
}

fn copy_list(
    ctx: &Context,
    source: &dyn ImageSource,
    destination: &mut dyn ImageDestination,
    options: &CopyOptions,
    primary: &[u8],
    target: CompressionTarget,
) -> Result<CopyOutcome> {
    let mut index = ImageIndex::from_blob(primary)?;

    let selected: Vec<Descriptor> = match &options.selection {
        SelectionPolicy::AllImages => index.manifests.clone(),
        SelectionPolicy::SpecificDigests(digests) => {
            let wanted: HashSet<&Digest> = digests.iter().collect();
            index
                .manifests
                .iter()
                .filter(|d| wanted.contains(&d.digest))
                .cloned()
                .collect()
        }
        SelectionPolicy::LocalPlatformOnly => {
            let chosen = choose_instance(&index, &options.source_ctx).ok_or_else(|| {
                StevedoreError::NotFound {
                    kind: "image for platform",
                    id: options.source_ctx.wanted_platform().to_string(),
                }
            })?;
            tracing::debug!(digest = %chosen.digest, "copying platform image only");
            let dedicated = source_for(ctx, source, options, &chosen.digest)?;
            let src = dedicated.as_deref().unwrap_or(source);
            let (bytes, media_type) = read_instance(ctx, src, &chosen.digest)?;
            let (manifest, media_type) =
                copy_single(ctx, src, destination, &bytes, &media_type, target)?;
            destination.put_manifest(ctx, &manifest, &media_type, None)?;
            return Ok(outcome_for(manifest));
        }
    };

    let mut copied = Vec::with_capacity(selected.len());
    for descriptor in &selected {
        ctx.check()?;
        copied.push(copy_instance(ctx, source, destination, options, descriptor, target)?);
    }

    if options.selection == SelectionPolicy::AllImages {
        let mut seen: HashSet<Digest> = copied.iter().map(|d| d.digest.clone()).collect();
        let mut variants = Vec::new();
        for algo in &options.add_compression {
            for descriptor in &selected {
                ctx.check()?;
                let forced = Some((*algo, true));
                let mut variant =
                    copy_instance(ctx, source, destination, options, descriptor, forced)?;
                if !seen.insert(variant.digest.clone()) {
                    continue;
                }
                let _ = variant.annotations.insert(
                    format!("{COMPRESSION_ANNOTATION_PREFIX}{}", algo.name()),
                    "true".to_string(),
                );
                variants.push(variant);
            }
        }
        copied.extend(variants);
    }

    let source_media_type = index.media_type.clone().unwrap_or_else(|| OCI_INDEX.to_string());
    let needs_oci = copied
        .iter()
        .any(|d| d.media_type == OCI_MANIFEST || !d.annotations.is_empty());
    let media_type = if source_media_type == DOCKER_V2_LIST && needs_oci {
        OCI_INDEX
    } else {
        source_media_type.as_str()
    };
    index.manifests = copied;
    let manifest = index.to_blob(media_type)?;
    destination.put_manifest(ctx, &manifest, media_type, None)?;
    Ok(outcome_for(manifest))
}

fn source_for(
    ctx: &Context,
    source: &dyn ImageSource,
    options: &CopyOptions,
    instance: &Digest,
) -> Result<Option<Box<dyn ImageSource>>> {
    source.instance_source(ctx, &options.source_ctx, instance)
}

/// Reads an instance manifest, rejecting nested lists.
fn read_instance(
    ctx: &Context,
    src: &dyn ImageSource,
    instance: &Digest,
) -> Result<(Vec<u8>, String)> {
    let (bytes, media_type) = src.manifest(ctx, Some(instance))?;
    if classify(&media_type, &src.reference())? != ManifestKind::Image {
        return Err(StevedoreError::UnsupportedMediaType {
            media_type,
            reference: format!("{}@{instance}", src.reference()),
        });
    }
    Ok((bytes, media_type))
}

/// Copies one list instance and returns its descriptor in the output list.
fn copy_instance(
    ctx: &Context,
    source: &dyn ImageSource,
    destination: &mut dyn ImageDestination,
    options: &CopyOptions,
    descriptor: &Descriptor,
    target: CompressionTarget,
) -> Result<Descriptor> {
    let dedicated = source_for(ctx, source, options, &descriptor.digest)?;
    let src = dedicated.as_deref().unwrap_or(source);
    let (bytes, media_type) = read_instance(ctx, src, &descriptor.digest)?;
    let (manifest, media_type) = copy_single(ctx, src, destination, &bytes, &media_type, target)?;
    let digest = Digest::sha256_of(&manifest);
    destination.put_manifest(ctx, &manifest, &media_type, Some(&digest))?;
    tracing::debug!(
        source_digest = %descriptor.digest,
        digest = %digest,
        "instance copied"
    );
    Ok(Descriptor {
        media_type,
        digest,
        size: manifest.len() as u64,
        ..descriptor.clone()
    })
}

/// Copies the config and layers of one image manifest, returning the
/// manifest to write and its media type. The original bytes are returned
/// untouched when no layer had to change.
fn copy_single(
    ctx: &Context,
    source: &dyn ImageSource,
    destination: &mut dyn ImageDestination,
    manifest_bytes: &[u8],
    media_type: &str,
    target: CompressionTarget,
) -> Result<(Vec<u8>, String)> {
    let mut manifest = ImageManifest::from_blob(manifest_bytes)?;

    let plans: Vec<Option<(Algorithm, Algorithm)>> = manifest
        .layers
        .iter()
        .map(|layer| {
            Algorithm::from_layer_media_type(&layer.media_type).map(|current| {
                let wanted = match target {
                    Some((algo, true)) => algo,
                    Some((algo, false)) if current == Algorithm::Uncompressed => algo,
                    _ => current,
                };
                (current, wanted)
            })
        })
        .collect();
    let to_oci = media_type == DOCKER_V2_SCHEMA2
        && plans
            .iter()
            .flatten()
            .any(|(_, wanted)| wanted.layer_media_type(DOCKER_V2_SCHEMA2).is_none());
    let out_media_type = if to_oci { OCI_MANIFEST } else { media_type };

    copy_blob(ctx, source, destination, &manifest.config)?;

    let mut changed = to_oci;
    for (layer, plan) in manifest.layers.iter_mut().zip(plans) {
        ctx.check()?;
        match plan {
            Some((current, wanted)) if current != wanted => {
                let data = source.blob(ctx, layer)?;
                let recompressed = current.recompress(&data, wanted)?;
                let digest = Digest::sha256_of(&recompressed);
                if !destination.has_blob(ctx, &digest)? {
                    destination.put_blob(ctx, &digest, &recompressed)?;
                }
                tracing::debug!(
                    from = %current,
                    to = %wanted,
                    digest = %digest,
                    "layer recompressed"
                );
                layer.digest = digest;
                layer.size = recompressed.len() as u64;
                if let Some(mt) = wanted.layer_media_type(out_media_type) {
                    layer.media_type = mt.to_string();
                }
                changed = true;
            }
            Some((current, _)) => {
                copy_blob(ctx, source, destination, layer)?;
                if let Some(mt) = current.layer_media_type(out_media_type) {
                    layer.media_type = mt.to_string();
                }
            }
            None => copy_blob(ctx, source, destination, layer)?,
        }
    }

    if !changed {
        return Ok((manifest_bytes.to_vec(), media_type.to_string()));
    }
    if to_oci && manifest.config.media_type == DOCKER_CONFIG {
        manifest.config.media_type = OCI_CONFIG.to_string();
    }
    manifest.media_type = Some(out_media_type.to_string());
    Ok((manifest.to_blob()?, out_media_type.to_string()))
}

fn copy_blob(
    ctx: &Context,
    source: &dyn ImageSource,
    destination: &mut dyn ImageDestination,
    descriptor: &Descriptor,
) -> Result<()> {
    if destination.has_blob(ctx, &descriptor.digest)? {
        tracing::debug!(digest = %descriptor.digest, "blob already present");
        return Ok(());
    }
    let data = source.blob(ctx, descriptor)?;
    destination.put_blob(ctx, &descriptor.digest, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use stevedore_common::types::Platform;

    use crate::dir::{DirDestination, DirSource};

    const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

    fn write_image(dest: &mut DirDestination, platform: &Platform) -> Descriptor {
        let ctx = Context::new();
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": platform.architecture,
            "os": platform.os,
            "rootfs": {"type": "layers", "diff_ids": []},
        }))
        .expect("config");
        let layer = Algorithm::Gzip
            .compress(format!("rootfs for {platform}").as_bytes())
            .expect("gzip");
        let config_desc = Descriptor::for_content(DOCKER_CONFIG, &config);
        let layer_desc = Descriptor::for_content(
            "application/vnd.docker.image.rootfs.diff.tar.gzip",
            &layer,
        );
        dest.put_blob(&ctx, &config_desc.digest, &config).expect("config blob");
        dest.put_blob(&ctx, &layer_desc.digest, &layer).expect("layer blob");
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(DOCKER_V2_SCHEMA2.to_string()),
            config: config_desc,
            layers: vec![layer_desc],
            annotations: std::collections::BTreeMap::new(),
        }
        .to_blob()
        .expect("manifest");
        let mut desc = Descriptor::for_content(DOCKER_V2_SCHEMA2, &manifest);
        desc.platform = Some(platform.clone());
        dest.put_manifest(&ctx, &manifest, DOCKER_V2_SCHEMA2, Some(&desc.digest))
            .expect("instance manifest");
        desc
    }

    fn write_list(path: &Path) -> Vec<Descriptor> {
        let mut dest = DirDestination::create(path).expect("dest");
        let descs: Vec<Descriptor> = [("linux", "amd64"), ("linux", "arm64")]
            .iter()
            .map(|(os, arch)| write_image(&mut dest, &Platform::new(*os, *arch)))
            .collect();
        let index = ImageIndex {
            schema_version: 2,
            media_type: None,
            manifests: descs.clone(),
            annotations: std::collections::BTreeMap::new(),
        };
        dest.put_manifest(
            &Context::new(),
            &index.to_blob(DOCKER_V2_LIST).expect("list"),
            DOCKER_V2_LIST,
            None,
        )
        .expect("list manifest");
        descs
    }

    fn copy_to(src: &Path, dst: &Path, options: &CopyOptions) -> Result<CopyOutcome> {
        let source = DirSource::open(src).expect("source");
        let mut destination = DirDestination::create(dst).expect("destination");
        copy_image(&Context::new(), &source, &mut destination, options)
    }

    #[test]
    fn all_images_copy_preserves_instances() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        let descs = write_list(src.path());

        let outcome = copy_to(src.path(), dst.path(), &CopyOptions::default()).expect("copy");
        let index = ImageIndex::from_blob(&outcome.manifest).expect("index");
        let digests: Vec<_> = index.manifests.iter().map(|d| d.digest.clone()).collect();
        assert_eq!(digests, descs.iter().map(|d| d.digest.clone()).collect::<Vec<_>>());
        assert_eq!(outcome.digest, Digest::sha256_of(&outcome.manifest));
        for d in &descs {
            assert!(dst
                .path()
                .join(format!("{}.manifest.json", d.digest.encoded()))
                .exists());
        }
    }

    #[test]
    fn specific_digests_prune_the_list() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        let descs = write_list(src.path());
        let options = CopyOptions {
            selection: SelectionPolicy::SpecificDigests(vec![
                descs[1].digest.clone(),
                Digest::sha256_of(b"not in the list"),
            ]),
            ..CopyOptions::default()
        };

        let outcome = copy_to(src.path(), dst.path(), &options).expect("copy");
        let index = ImageIndex::from_blob(&outcome.manifest).expect("index");
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.manifests[0].digest, descs[1].digest);
    }

    #[test]
    fn local_platform_copy_writes_a_single_image() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        let descs = write_list(src.path());
        let options = CopyOptions {
            source_ctx: SystemContext::for_architecture("arm64"),
            selection: SelectionPolicy::LocalPlatformOnly,
            ..CopyOptions::default()
        };

        let outcome = copy_to(src.path(), dst.path(), &options).expect("copy");
        assert_eq!(outcome.digest, descs[1].digest);
    }

    #[test]
    fn local_platform_without_match_is_not_found() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        let _ = write_list(src.path());
        let options = CopyOptions {
            source_ctx: SystemContext::for_architecture("s390x"),
            selection: SelectionPolicy::LocalPlatformOnly,
            ..CopyOptions::default()
        };
        assert!(matches!(
            copy_to(src.path(), dst.path(), &options),
            Err(StevedoreError::NotFound { .. })
        ));
    }

    #[test]
    fn forced_zstd_converts_instances_to_oci() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        let _ = write_list(src.path());
        let options = CopyOptions {
            dest_ctx: SystemContext {
                compression_format: Some(Algorithm::Zstd),
                ..SystemContext::default()
            },
            force_compression_format: true,
            ..CopyOptions::default()
        };

        let outcome = copy_to(src.path(), dst.path(), &options).expect("copy");
        let index = ImageIndex::from_blob(&outcome.manifest).expect("index");
        assert_eq!(index.media_type.as_deref(), Some(OCI_INDEX));

        let reader = DirSource::open(dst.path()).expect("reader");
        let entry = &index.manifests[0];
        assert_eq!(entry.media_type, OCI_MANIFEST);
        let (bytes, _) = reader
            .manifest(&Context::new(), Some(&entry.digest))
            .expect("instance");
        let manifest = ImageManifest::from_blob(&bytes).expect("manifest");
        assert_eq!(manifest.config.media_type, OCI_CONFIG);
        assert_eq!(manifest.layers[0].media_type, OCI_LAYER_ZSTD);
        let layer = reader
            .blob(&Context::new(), &manifest.layers[0])
            .expect("layer");
        assert_eq!(Algorithm::sniff(&layer), Algorithm::Zstd);
    }

    #[test]
    fn unforced_format_keeps_compressed_layers() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        let descs = write_list(src.path());
        let options = CopyOptions {
            dest_ctx: SystemContext {
                compression_format: Some(Algorithm::Zstd),
                ..SystemContext::default()
            },
            ..CopyOptions::default()
        };

        let outcome = copy_to(src.path(), dst.path(), &options).expect("copy");
        let index = ImageIndex::from_blob(&outcome.manifest).expect("index");
        assert_eq!(index.manifests[0].digest, descs[0].digest);
        assert_eq!(index.media_type.as_deref(), Some(DOCKER_V2_LIST));
    }

    #[test]
    fn add_compression_appends_annotated_variants() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        let descs = write_list(src.path());
        let options = CopyOptions {
            add_compression: vec![Algorithm::Zstd],
            ..CopyOptions::default()
        };

        let outcome = copy_to(src.path(), dst.path(), &options).expect("copy");
        let index = ImageIndex::from_blob(&outcome.manifest).expect("index");
        assert_eq!(index.media_type.as_deref(), Some(OCI_INDEX));
        assert_eq!(index.manifests.len(), descs.len() * 2);
        let variants: Vec<_> = index
            .manifests
            .iter()
            .filter(|d| d.annotations.contains_key("io.github.containers.compression.zstd"))
            .collect();
        assert_eq!(variants.len(), descs.len());
        assert_eq!(variants[0].platform, descs[0].platform);
    }

    #[test]
    fn forcing_without_format_is_a_config_error() {
        let src = tempfile::tempdir().expect("src");
        let dst = tempfile::tempdir().expect("dst");
        let _ = write_list(src.path());
        let options = CopyOptions {
            force_compression_format: true,
            ..CopyOptions::default()
        };
        assert!(matches!(
            copy_to(src.path(), dst.path(), &options),
            Err(StevedoreError::Config { .. })
        ));
    }

    #[test]
    fn choose_instance_prefers_exact_variant() {
        let mut plain = Descriptor::for_content(DOCKER_V2_SCHEMA2, b"plain");
        plain.platform = Some(Platform::new("linux", "arm64"));
        let mut v8 = Descriptor::for_content(DOCKER_V2_SCHEMA2, b"v8");
        let mut p = Platform::new("linux", "arm64");
        p.variant = Some("v8".into());
        v8.platform = Some(p);
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(OCI_INDEX.into()),
            manifests: vec![plain, v8.clone()],
            annotations: std::collections::BTreeMap::new(),
        };
        let sys = SystemContext {
            architecture_choice: Some("arm64".into()),
            variant_choice: Some("v8".into()),
            ..SystemContext::default()
        };
        assert_eq!(choose_instance(&index, &sys).map(|d| &d.digest), Some(&v8.digest));
    }
}
