//! Copyable references to saved manifest lists.
//!
//! A [`ListReference`] binds a snapshot of a saved list to its store
//! record and a selection policy. It serves the list manifest itself and
//! delegates instance manifests and blobs to the sources the instances
//! were resolved from.

use std::collections::HashSet;
use std::fmt;

use stevedore_common::context::Context;
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{Digest, ImageId};
use stevedore_store::Store;
use stevedore_transport::manifest::Descriptor;
use stevedore_transport::{
    ImageSource, SelectionPolicy, SystemContext, TransportReference, new_image_source,
};

use crate::list::ManifestList;

/// A saved manifest list, ready to be copied.
#[derive(Debug, Clone)]
pub struct ListReference {
    store: Store,
    image_id: ImageId,
    list: ManifestList,
    selection: SelectionPolicy,
    sys: SystemContext,
}

impl ListReference {
    /// Selection the copy should apply.
    #[must_use]
    pub const fn selection(&self) -> &SelectionPolicy {
        &self.selection
    }

    /// Store record the list was saved to.
    #[must_use]
    pub const fn image_id(&self) -> &ImageId {
        &self.image_id
    }

    /// Context used to open instance sources.
    #[must_use]
    pub fn with_system_context(mut self, sys: SystemContext) -> Self {
        self.sys = sys;
        self
    }

    fn open_instance(&self, instance: &Digest, sys: &SystemContext) -> Result<Box<dyn ImageSource>> {
        let entry = self
            .list
            .instance(instance)
            .ok_or_else(|| StevedoreError::NotFound {
                kind: "instance",
                id: instance.to_string(),
            })?;
        let origin = entry.source().ok_or_else(|| StevedoreError::Fetch {
            reference: self.to_string(),
            message: format!("no source recorded for instance {instance}"),
            transient: false,
        })?;
        new_image_source(&TransportReference::parse(origin)?, sys)
    }
}

impl fmt::Display for ListReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "list:{}", self.image_id)
    }
}

impl ImageSource for ListReference {
    fn reference(&self) -> String {
        self.to_string()
    }

    fn manifest(&self, ctx: &Context, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        ctx.check()?;
        match instance {
            None => {
                // The record must still exist when the copy starts.
                let _ = self.store.image(self.image_id.as_str())?;
                let media_type = self.list.media_type().to_string();
                Ok((self.list.serialize(Some(&media_type))?, media_type))
            }
            Some(digest) => self
                .open_instance(digest, &self.sys)?
                .manifest(ctx, Some(digest)),
        }
    }

    fn blob(&self, ctx: &Context, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let mut tried = HashSet::new();
        for instance in self.list.iter() {
            let Some(origin) = instance.source() else {
                continue;
            };
            if !tried.insert(origin) {
                continue;
            }
            match self
                .open_instance(instance.digest(), &self.sys)?
                .blob(ctx, descriptor)
            {
                Ok(data) => return Ok(data),
                Err(StevedoreError::Fetch {
                    transient: false, ..
                }) => {}
                Err(e) => return Err(e),
            }
        }
        Err(StevedoreError::Fetch {
            reference: self.to_string(),
            message: format!("blob {} not found in any instance source", descriptor.digest),
            transient: false,
        })
    }

    fn instance_source(
        &self,
        _ctx: &Context,
        sys: &SystemContext,
        instance: &Digest,
    ) -> Result<Option<Box<dyn ImageSource>>> {
        self.open_instance(instance, sys).map(Some)
    }
}

impl ManifestList {
    /// Builds a copyable reference to this list.
    ///
    /// Digests in `SpecificDigests` that are not part of the list are
    /// dropped silently; see [`ManifestList::reference_strict`].
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Precondition` if the list was never saved
    /// or loaded.
    pub fn reference(&self, store: &Store, selection: SelectionPolicy) -> Result<ListReference> {
        self.build_reference(store, selection, false)
    }

    /// Like [`ManifestList::reference`], but rejects unknown digests.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Precondition` if the list was never saved,
    /// or `StevedoreError::NotFound` for a digest not in the list.
    pub fn reference_strict(
        &self,
        store: &Store,
        selection: SelectionPolicy,
    ) -> Result<ListReference> {
        self.build_reference(store, selection, true)
    }

    fn build_reference(
        &self,
        store: &Store,
        selection: SelectionPolicy,
        strict: bool,
    ) -> Result<ListReference> {
        let image_id = self
            .saved_image()
            .cloned()
            .ok_or_else(|| StevedoreError::Precondition {
                message: "list not yet saved".into(),
            })?;

        let selection = match selection {
            SelectionPolicy::SpecificDigests(digests) => {
                let mut kept = Vec::with_capacity(digests.len());
                for digest in digests {
                    if self.instance(&digest).is_some() {
                        kept.push(digest);
                    } else if strict {
                        return Err(StevedoreError::NotFound {
                            kind: "instance",
                            id: digest.to_string(),
                        });
                    } else {
                        tracing::debug!(digest = %digest, "ignoring digest not in list");
                    }
                }
                SelectionPolicy::SpecificDigests(kept)
            }
            other => other,
        };

        Ok(ListReference {
            store: store.clone(),
            image_id,
            list: self.clone(),
            selection,
            sys: SystemContext::default(),
        })
    }
}
