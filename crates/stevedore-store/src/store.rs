//! Content store facade.
//!
//! [`Store`] combines the on-disk layout, the image catalog, and per-image
//! locks into the operations higher layers consume: create or look up an
//! image record, attach names, read and write keyed blobs, and obtain the
//! advisory lock for a record.

use std::path::{Path, PathBuf};

use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{Digest, ImageId};

use crate::catalog::{ImageCatalog, ImageRecord};
use crate::lock::{FileLock, LockGuard};
use crate::storage::{StorageBackend, read_optional, write_atomic};

/// A local content store rooted at a directory.
#[derive(Debug, Clone)]
pub struct Store {
    backend: StorageBackend,
    catalog: ImageCatalog,
}

impl Store {
    /// Opens or initializes a store at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let backend = StorageBackend::open(root)?;
        let catalog = ImageCatalog::new(backend.catalog_path(), backend.catalog_lock_path());
        Ok(Self { backend, catalog })
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.backend.root()
    }

    /// Creates a new image record.
    ///
    /// When `id` is `None` a random identifier is generated.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Config` if the identifier or one of the
    /// names is already in use.
    pub fn create_image(
        &self,
        id: Option<ImageId>,
        names: &[String],
        metadata: &str,
    ) -> Result<ImageRecord> {
        let id = id.unwrap_or_else(ImageId::generate);
        let _ = self.backend.image_dir(&id)?;
        let record = ImageRecord {
            id: id.clone(),
            names: dedup(names),
            digest: None,
            big_data_names: Vec::new(),
            metadata: metadata.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let created = record.clone();
        self.catalog.update(move |entries| {
            if entries.iter().any(|e| e.id == record.id) {
                return Err(StevedoreError::Config {
                    message: format!("image id {} already in use", record.id),
                });
            }
            if let Some(name) = record
                .names
                .iter()
                .find(|n| entries.iter().any(|e| e.names.contains(n)))
            {
                return Err(StevedoreError::Config {
                    message: format!("image name {name:?} already in use"),
                });
            }
            entries.push(record);
            Ok(())
        })?;
        tracing::info!(id = %id, names = ?created.names, "created image record");
        Ok(created)
    }

    /// Looks up an image by identifier, then by name.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if no record matches.
    pub fn image(&self, id_or_name: &str) -> Result<ImageRecord> {
        self.catalog.find(id_or_name)
    }

    /// Lists all image records.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn images(&self) -> Result<Vec<ImageRecord>> {
        self.catalog.list()
    }

    /// Adds names to an image, taking them away from any other image that
    /// currently carries them.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if the image does not exist.
    pub fn add_names(&self, id: &ImageId, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.catalog.update(|entries| {
            if !entries.iter().any(|e| &e.id == id) {
                return Err(not_found(id));
            }
            for entry in entries.iter_mut() {
                if &entry.id == id {
                    for name in names {
                        if !entry.names.contains(name) {
                            entry.names.push(name.clone());
                        }
                    }
                } else {
                    entry.names.retain(|n| !names.contains(n));
                }
            }
            Ok(())
        })
    }

    /// Records the digest of an image's primary manifest.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if the image does not exist.
    pub fn set_digest(&self, id: &ImageId, digest: &Digest) -> Result<()> {
        self.catalog.update(|entries| {
            let entry = entries
                .iter_mut()
                .find(|e| &e.id == id)
                .ok_or_else(|| not_found(id))?;
            entry.digest = Some(digest.clone());
            Ok(())
        })
    }

    /// Stores a keyed blob for an image, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if the image does not exist, or an
    /// I/O error if the blob cannot be written.
    pub fn set_big_data(&self, id: &ImageId, key: &str, data: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StevedoreError::Config {
                message: "big data key must not be empty".into(),
            });
        }
        let path = self.backend.big_data_path(id, key)?;
        self.catalog.update(|entries| {
            let entry = entries
                .iter_mut()
                .find(|e| &e.id == id)
                .ok_or_else(|| not_found(id))?;
            write_atomic(&path, data)?;
            if !entry.big_data_names.iter().any(|k| k == key) {
                entry.big_data_names.push(key.to_string());
            }
            Ok(())
        })?;
        tracing::debug!(id = %id, key, size = data.len(), "stored image data");
        Ok(())
    }

    /// Reads a keyed blob of an image.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if the image or the key does not
    /// exist.
    pub fn big_data(&self, id: &ImageId, key: &str) -> Result<Vec<u8>> {
        let path = self.backend.big_data_path(id, key)?;
        read_optional(&path)?.ok_or_else(|| StevedoreError::NotFound {
            kind: "image data",
            id: format!("{id}/{key}"),
        })
    }

    /// Deletes an image record and its blobs.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if the image does not exist.
    pub fn delete_image(&self, id: &ImageId) -> Result<()> {
        let dir = self.backend.image_dir(id)?;
        self.catalog.update(|entries| {
            let before = entries.len();
            entries.retain(|e| &e.id != id);
            if entries.len() == before {
                return Err(not_found(id));
            }
            Ok(())
        })?;
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| StevedoreError::io(&dir, e))?;
        }
        tracing::info!(id = %id, "deleted image record");
        Ok(())
    }

    /// Returns the advisory lock associated with an image record.
    ///
    /// The lock is not enforced by the store: callers take it around any
    /// save/load sequence that must not interleave with another writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened.
    pub fn lock_for_image(&self, id: &ImageId) -> Result<ImageLock> {
        let path = self.backend.lock_path(id)?;
        Ok(ImageLock {
            id: id.clone(),
            lock: FileLock::open(&path)?,
        })
    }
}

/// Exclusive advisory lock scoped to one image record.
#[derive(Debug)]
pub struct ImageLock {
    id: ImageId,
    lock: FileLock,
}

impl ImageLock {
    /// Blocks until the lock is held; it is released when the guard drops.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        self.lock.lock()
    }

    /// Returns the image this lock belongs to.
    #[must_use]
    pub const fn image_id(&self) -> &ImageId {
        &self.id
    }
}

fn not_found(id: &ImageId) -> StevedoreError {
    StevedoreError::NotFound {
        kind: "image",
        id: id.to_string(),
    }
}

fn dedup(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !out.contains(name) {
            out.push(name.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).expect("open");
        (dir, store)
    }

    #[test]
    fn create_then_lookup_by_id_and_name() {
        let (_dir, store) = open_store();
        let record = store
            .create_image(None, &["foo".to_string()], "")
            .expect("create");
        assert_eq!(store.image(record.id.as_str()).expect("by id"), record);
        assert_eq!(store.image("foo").expect("by name").id, record.id);
        assert!(matches!(
            store.image("bar"),
            Err(StevedoreError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_name_is_rejected_on_create() {
        let (_dir, store) = open_store();
        let _ = store
            .create_image(None, &["foo".to_string()], "")
            .expect("create");
        assert!(store.create_image(None, &["foo".to_string()], "").is_err());
    }

    #[test]
    fn add_names_moves_name_between_images() {
        let (_dir, store) = open_store();
        let a = store
            .create_image(None, &["shared".to_string()], "")
            .expect("create a");
        let b = store.create_image(None, &[], "").expect("create b");

        store
            .add_names(&b.id, &["shared".to_string()])
            .expect("add names");
        assert_eq!(store.image("shared").expect("lookup").id, b.id);
        assert!(store.image(a.id.as_str()).expect("a").names.is_empty());
    }

    #[test]
    fn big_data_round_trip_and_missing_key() {
        let (_dir, store) = open_store();
        let record = store.create_image(None, &[], "").expect("create");
        store
            .set_big_data(&record.id, "manifest", b"{}")
            .expect("set");
        store
            .set_big_data(&record.id, "manifest", b"{\"a\":1}")
            .expect("overwrite");

        assert_eq!(store.big_data(&record.id, "manifest").expect("get"), b"{\"a\":1}");
        assert_eq!(
            store.image(record.id.as_str()).expect("record").big_data_names,
            vec!["manifest"]
        );
        assert!(matches!(
            store.big_data(&record.id, "other"),
            Err(StevedoreError::NotFound { .. })
        ));
    }

    #[test]
    fn big_data_requires_existing_image() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.set_big_data(&ImageId::new("missing"), "manifest", b"{}"),
            Err(StevedoreError::NotFound { .. })
        ));
    }

    #[test]
    fn delete_removes_record_and_blobs() {
        let (dir, store) = open_store();
        let record = store.create_image(None, &["gone".into()], "").expect("create");
        store.set_big_data(&record.id, "k", b"v").expect("set");
        store.delete_image(&record.id).expect("delete");

        assert!(store.image("gone").is_err());
        assert!(!dir.path().join("images").join(record.id.as_str()).exists());
        assert!(store.delete_image(&record.id).is_err());
    }

    #[test]
    fn set_digest_is_recorded() {
        let (_dir, store) = open_store();
        let record = store.create_image(None, &[], "").expect("create");
        let digest = Digest::sha256_of(b"list");
        store.set_digest(&record.id, &digest).expect("set digest");
        assert_eq!(
            store.image(record.id.as_str()).expect("record").digest,
            Some(digest)
        );
    }

    #[test]
    fn image_lock_is_reacquirable_after_release() {
        let (_dir, store) = open_store();
        let record = store.create_image(None, &[], "").expect("create");
        let lock = store.lock_for_image(&record.id).expect("locker");
        assert_eq!(lock.image_id(), &record.id);
        drop(lock.lock().expect("first"));
        drop(lock.lock().expect("second"));
    }
}
