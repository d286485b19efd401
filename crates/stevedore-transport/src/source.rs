//! Image source and destination abstractions.
//!
//! A source serves manifests and blobs of one image (or list); a
//! destination receives them. Both are opened from a
//! [`TransportReference`] and are dropped when the operation ends.

use stevedore_common::context::Context;
use stevedore_common::error::Result;
use stevedore_common::types::Digest;

use crate::dir::{DirDestination, DirSource};
use crate::docker::{RegistryDestination, RegistrySource};
use crate::manifest::Descriptor;
use crate::reference::TransportReference;
use crate::system::SystemContext;

/// Read access to an image.
pub trait ImageSource {
    /// Human-readable reference, used in logs and errors.
    fn reference(&self) -> String;

    /// Returns the primary manifest (`instance == None`) or the manifest
    /// of one list instance, together with its media type.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Fetch` if the manifest cannot be read.
    fn manifest(&self, ctx: &Context, instance: Option<&Digest>) -> Result<(Vec<u8>, String)>;

    /// Returns the content of a blob.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Fetch` if the blob cannot be read.
    fn blob(&self, ctx: &Context, descriptor: &Descriptor) -> Result<Vec<u8>>;

    /// Returns a dedicated source for one list instance when its manifest
    /// and blobs live somewhere other than this source. `None` means this
    /// source serves the instance itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance's own source cannot be opened.
    fn instance_source(
        &self,
        _ctx: &Context,
        _sys: &SystemContext,
        _instance: &Digest,
    ) -> Result<Option<Box<dyn ImageSource>>> {
        Ok(None)
    }
}

/// Write access to an image location.
pub trait ImageDestination {
    /// Human-readable reference, used in logs and errors.
    fn reference(&self) -> String;

    /// Returns whether the destination already has a blob.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Push` if the check itself fails.
    fn has_blob(&self, ctx: &Context, digest: &Digest) -> Result<bool>;

    /// Stores a blob.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Push` if the blob cannot be written.
    fn put_blob(&mut self, ctx: &Context, digest: &Digest, data: &[u8]) -> Result<()>;

    /// Stores the primary manifest (`instance == None`) or one instance
    /// manifest of a list.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Push` if the manifest cannot be written.
    fn put_manifest(
        &mut self,
        ctx: &Context,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&Digest>,
    ) -> Result<()>;

    /// Finalizes the write.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Push` if finalization fails.
    fn commit(&mut self, ctx: &Context) -> Result<()>;
}

/// Opens a source for `reference`.
///
/// # Errors
///
/// Returns an error if the location does not exist or cannot be reached.
pub fn new_image_source(
    reference: &TransportReference,
    sys: &SystemContext,
) -> Result<Box<dyn ImageSource>> {
    tracing::debug!(reference = %reference, "opening image source");
    match reference {
        TransportReference::Docker(r) => Ok(Box::new(RegistrySource::new(r.clone(), sys)?)),
        TransportReference::Dir(path) => Ok(Box::new(DirSource::open(path)?)),
    }
}

/// Opens a destination for `reference`.
///
/// # Errors
///
/// Returns an error if the location cannot be prepared.
pub fn new_image_destination(
    reference: &TransportReference,
    sys: &SystemContext,
) -> Result<Box<dyn ImageDestination>> {
    tracing::debug!(reference = %reference, "opening image destination");
    match reference {
        TransportReference::Docker(r) => Ok(Box::new(RegistryDestination::new(r.clone(), sys)?)),
        TransportReference::Dir(path) => Ok(Box::new(DirDestination::create(path)?)),
    }
}
