//! Resolving image references into list instances.

use std::collections::BTreeMap;

use stevedore_common::context::Context;
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{Digest, Platform};
use stevedore_transport::copy::choose_instance;
use stevedore_transport::hash;
use stevedore_transport::manifest::{
    Descriptor, ImageConfig, ImageIndex, ImageManifest, ManifestKind, classify,
};
use stevedore_transport::{ImageSource, SystemContext, TransportReference, new_image_source};

use crate::list::{Instance, ManifestList};

impl ManifestList {
    /// Adds the image(s) named by `reference`.
    ///
    /// For a list source, `all_platforms` adds every instance and returns
    /// the digest of the source list; otherwise only the instance matching
    /// the platform `sys` asks for is added and its digest returned. A
    /// single-image source always adds exactly that image.
    ///
    /// # Errors
    ///
    /// - `StevedoreError::Fetch` if a manifest or config cannot be read or
    ///   does not match its digest.
    /// - `StevedoreError::UnsupportedMediaType` for unsupported manifests.
    /// - `StevedoreError::NotFound` if no instance matches the platform.
    /// - `StevedoreError::Cancelled` if `ctx` is cancelled.
    pub fn add(
        &mut self,
        ctx: &Context,
        sys: &SystemContext,
        reference: &TransportReference,
        all_platforms: bool,
    ) -> Result<Digest> {
        self.resolve_and_add(ctx, sys, reference, all_platforms)
            .map_err(|e| match e {
                StevedoreError::HashMismatch { .. } => StevedoreError::Fetch {
                    reference: reference.to_string(),
                    message: e.to_string(),
                    transient: false,
                },
                other => other,
            })
    }

    fn resolve_and_add(
        &mut self,
        ctx: &Context,
        sys: &SystemContext,
        reference: &TransportReference,
        all_platforms: bool,
    ) -> Result<Digest> {
        ctx.check()?;
        let source = new_image_source(reference, sys)?;
        let origin = reference.to_string();
        let (primary, media_type) = source.manifest(ctx, None)?;

        match classify(&media_type, &source.reference())? {
            ManifestKind::Image => {
                let digest = Digest::sha256_of(&primary);
                let platform = platform_from_config(ctx, source.as_ref(), &primary)?;
                let size = primary.len() as u64;
                self.add_resolved(Instance::new(
                    digest.clone(),
                    platform,
                    media_type,
                    size,
                    BTreeMap::new(),
                    Some(origin),
                ));
                Ok(digest)
            }
            ManifestKind::List => {
                let index = ImageIndex::from_blob(&primary)?;
                if all_platforms {
                    for descriptor in &index.manifests {
                        ctx.check()?;
                        let instance =
                            resolve_instance(ctx, source.as_ref(), descriptor, &origin)?;
                        self.add_resolved(instance);
                    }
                    Ok(Digest::sha256_of(&primary))
                } else {
                    let descriptor = choose_instance(&index, sys).ok_or_else(|| {
                        StevedoreError::NotFound {
                            kind: "image for platform",
                            id: format!("{} in {origin}", sys.wanted_platform()),
                        }
                    })?;
                    let instance = resolve_instance(ctx, source.as_ref(), descriptor, &origin)?;
                    let digest = instance.digest().clone();
                    self.add_resolved(instance);
                    Ok(digest)
                }
            }
        }
    }

    fn add_resolved(&mut self, instance: Instance) {
        tracing::info!(
            digest = %instance.digest(),
            platform = %instance.platform(),
            source = instance.source().unwrap_or_default(),
            "added instance"
        );
        self.add_instance(instance);
    }
}

/// Fetches one list entry and builds its instance, verifying the digest.
fn resolve_instance(
    ctx: &Context,
    source: &dyn ImageSource,
    descriptor: &Descriptor,
    origin: &str,
) -> Result<Instance> {
    let (manifest, media_type) = source.manifest(ctx, Some(&descriptor.digest))?;
    let reference = format!("{}@{}", source.reference(), descriptor.digest);
    if classify(&media_type, &reference)? != ManifestKind::Image {
        return Err(StevedoreError::UnsupportedMediaType {
            media_type,
            reference,
        });
    }
    hash::validate(&reference, &manifest, &descriptor.digest)?;
    let digest = Digest::sha256_of(&manifest);
    let platform = match &descriptor.platform {
        Some(p) => p.clone(),
        None => platform_from_config(ctx, source, &manifest)?,
    };
    Ok(Instance::new(
        digest,
        platform,
        media_type,
        manifest.len() as u64,
        descriptor.annotations.clone(),
        Some(origin.to_string()),
    ))
}

fn platform_from_config(
    ctx: &Context,
    source: &dyn ImageSource,
    manifest: &[u8],
) -> Result<Platform> {
    let manifest = ImageManifest::from_blob(manifest)?;
    let config = source.blob(ctx, &manifest.config)?;
    Ok(ImageConfig::from_blob(&config)?.platform())
}
