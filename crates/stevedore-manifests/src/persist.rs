//! Saving manifest lists to, and loading them from, the content store.
//!
//! A saved list is an image record whose big-data items are:
//! - `manifest`: the serialized list,
//! - `manifest-<digest>`: the same blob addressed by its digest,
//! - `instances.json`: the source reference of each instance.

use std::collections::BTreeMap;

use stevedore_common::constants::{DIGEST_MANIFEST_KEY_PREFIX, INSTANCES_DATA_KEY, LIST_MANIFEST_KEY};
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{Digest, ImageId};
use stevedore_store::{ImageLock, Store};

use crate::list::ManifestList;

impl ManifestList {
    /// Saves the list into `store`.
    ///
    /// With `existing == None` a new record carrying `names` is created;
    /// otherwise the existing record is updated in place and `names` are
    /// added to it. `media_type` overrides the list's media type for this
    /// and later saves. The list is marked as saved to the returned record.
    ///
    /// # Errors
    ///
    /// - `StevedoreError::NotFound` if `existing` does not exist.
    /// - `StevedoreError::Config` if a name of a new record is taken.
    /// - `StevedoreError::UnsupportedMediaType` for a non-list media type.
    pub fn save_to_image(
        &mut self,
        store: &Store,
        existing: Option<&ImageId>,
        names: &[String],
        media_type: Option<&str>,
    ) -> Result<ImageId> {
        if media_type.is_some() {
            self.set_media_type(media_type)?;
        }
        let blob = self.serialize(None)?;
        let digest = Digest::sha256_of(&blob);

        let (id, created) = match existing {
            Some(id) => {
                let record = store.image(id.as_str())?;
                store.add_names(&record.id, names)?;
                (record.id, false)
            }
            None => (store.create_image(None, names, "")?.id, true),
        };

        if let Err(e) = write_list(store, &id, &blob, &digest, &self.sources()) {
            if created {
                if let Err(cleanup) = store.delete_image(&id) {
                    tracing::warn!(id = %id, error = %cleanup, "failed to remove partially saved list");
                }
            }
            return Err(e);
        }

        self.mark_saved(id.clone());
        tracing::info!(
            id = %id,
            digest = %digest,
            instances = self.len(),
            "saved manifest list"
        );
        Ok(id)
    }
}

fn write_list(
    store: &Store,
    id: &ImageId,
    blob: &[u8],
    digest: &Digest,
    sources: &BTreeMap<Digest, String>,
) -> Result<()> {
    store.set_big_data(id, LIST_MANIFEST_KEY, blob)?;
    store.set_big_data(id, &format!("{DIGEST_MANIFEST_KEY_PREFIX}{digest}"), blob)?;
    store.set_big_data(id, INSTANCES_DATA_KEY, &serde_json::to_vec_pretty(sources)?)?;
    store.set_digest(id, digest)
}

/// Loads a list by image identifier or, failing that, by name.
///
/// # Errors
///
/// - `StevedoreError::NotFound` if no record matches or it holds no list.
/// - `StevedoreError::MalformedData` if the stored blob is not a list.
pub fn load_from_image(store: &Store, id_or_name: &str) -> Result<(ImageId, ManifestList)> {
    let record = store.image(id_or_name)?;
    let blob = store.big_data(&record.id, LIST_MANIFEST_KEY)?;
    let mut list = ManifestList::from_blob(&blob)?;

    match store.big_data(&record.id, INSTANCES_DATA_KEY) {
        Ok(data) => {
            let sources: BTreeMap<Digest, String> = serde_json::from_slice(&data)
                .map_err(|e| StevedoreError::malformed("instance sources", e))?;
            list.apply_sources(&sources);
        }
        Err(StevedoreError::NotFound { .. }) => {
            tracing::debug!(id = %record.id, "list has no recorded instance sources");
        }
        Err(e) => return Err(e),
    }

    list.mark_saved(record.id.clone());
    tracing::debug!(id = %record.id, instances = list.len(), "loaded manifest list");
    Ok((record.id, list))
}

/// Returns the advisory lock guarding saves and loads of one list image.
///
/// # Errors
///
/// Returns an error if the lock file cannot be opened.
pub fn locker_for_image(store: &Store, id: &ImageId) -> Result<ImageLock> {
    store.lock_for_image(id)
}
