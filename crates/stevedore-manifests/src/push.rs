//! Publishing saved manifest lists.

use std::fmt;
use std::time::Duration;

use stevedore_common::context::Context;
use stevedore_common::error::Result;
use stevedore_common::types::Digest;
use stevedore_store::Store;
use stevedore_transport::{
    Algorithm, CopyOptions, SelectionPolicy, SystemContext, TransportReference, copy_image,
    new_image_destination,
};

use crate::list::ManifestList;
use crate::retry::{RetryObserver, RetryPolicy, retry};

/// Options for [`ManifestList::push`].
#[derive(Clone, Default)]
pub struct PushOptions {
    /// Instances to publish.
    pub selection: SelectionPolicy,
    /// Context for reading instance sources; also picks the platform for
    /// `LocalPlatformOnly`.
    pub source_ctx: SystemContext,
    /// Context for the destination, including its compression format.
    pub dest_ctx: SystemContext,
    /// Extra compression variants to publish next to each instance.
    pub add_compression: Vec<Algorithm>,
    /// Recompress every layer to `dest_ctx.compression_format`.
    pub force_compression_format: bool,
    /// Retries after a transient failure (default 3).
    pub max_retries: Option<u32>,
    /// Fixed delay between retries (default doubles from 1s).
    pub retry_delay: Option<Duration>,
    /// Receives each retry as it happens.
    pub retry_observer: Option<RetryObserver>,
}

impl fmt::Debug for PushOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushOptions")
            .field("selection", &self.selection)
            .field("source_ctx", &self.source_ctx)
            .field("dest_ctx", &self.dest_ctx)
            .field("add_compression", &self.add_compression)
            .field("force_compression_format", &self.force_compression_format)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

impl ManifestList {
    /// Copies the saved list to `destination`.
    ///
    /// Transient transport failures are retried per the options; each
    /// retry is logged and reported to the observer.
    ///
    /// Returns the manifest written at the destination and its digest.
    ///
    /// # Errors
    ///
    /// - `StevedoreError::Precondition` if the list was never saved.
    /// - The last transport error once retries are exhausted.
    /// - `StevedoreError::Cancelled` if `ctx` is cancelled.
    pub fn push(
        &self,
        ctx: &Context,
        store: &Store,
        destination: &TransportReference,
        options: &PushOptions,
    ) -> Result<(Vec<u8>, Digest)> {
        let source = self
            .reference(store, options.selection.clone())?
            .with_system_context(options.source_ctx.clone());
        let copy_options = CopyOptions {
            source_ctx: options.source_ctx.clone(),
            dest_ctx: options.dest_ctx.clone(),
            selection: source.selection().clone(),
            force_compression_format: options.force_compression_format,
            add_compression: options.add_compression.clone(),
        };
        let policy = RetryPolicy::new(options.max_retries, options.retry_delay);

        tracing::info!(
            list = %source,
            destination = %destination,
            selection = ?copy_options.selection,
            "pushing manifest list"
        );
        let outcome = retry(ctx, &policy, options.retry_observer.as_ref(), || {
            let mut target = new_image_destination(destination, &options.dest_ctx)?;
            copy_image(ctx, &source, target.as_mut(), &copy_options)
        })?;
        tracing::info!(destination = %destination, digest = %outcome.digest, "pushed manifest list");
        Ok((outcome.manifest, outcome.digest))
    }
}
