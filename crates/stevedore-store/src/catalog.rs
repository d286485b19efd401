//! Image record catalog.
//!
//! Maintains the index of image records (identifier, names, digest, and the
//! keys of their big-data items) in a single JSON file. Every mutation runs
//! under the store-wide catalog lock and rewrites the file atomically.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::{Digest, ImageId};

use crate::lock::FileLock;
use crate::storage::{read_optional, write_atomic};

/// One image record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Unique identifier for this image.
    pub id: ImageId,
    /// Names (tags) pointing at this image.
    #[serde(default)]
    pub names: Vec<String>,
    /// Digest of the image's primary manifest, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Keys of the big-data items stored for this image.
    #[serde(default)]
    pub big_data_names: Vec<String>,
    /// Free-form metadata supplied at creation.
    #[serde(default)]
    pub metadata: String,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

impl ImageRecord {
    /// Returns whether `id_or_name` denotes this record.
    #[must_use]
    pub fn matches(&self, id_or_name: &str) -> bool {
        self.id.as_str() == id_or_name || self.names.iter().any(|n| n == id_or_name)
    }
}

/// Image catalog backed by a JSON file.
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    catalog_path: PathBuf,
    lock_path: PathBuf,
}

impl ImageCatalog {
    /// Creates a catalog handle for the given files.
    #[must_use]
    pub const fn new(catalog_path: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            catalog_path,
            lock_path,
        }
    }

    /// Lists all records.
    ///
    /// Reads without taking the lock: the file is only ever replaced
    /// atomically, so a reader always sees a complete snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog file cannot be read or parsed.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        match read_optional(&self.catalog_path)? {
            None => Ok(Vec::new()),
            Some(content) => serde_json::from_slice(&content)
                .map_err(|e| StevedoreError::malformed("image catalog", e)),
        }
    }

    /// Finds a record, first by identifier and then by name.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if nothing matches.
    pub fn find(&self, id_or_name: &str) -> Result<ImageRecord> {
        let entries = self.list()?;
        entries
            .iter()
            .find(|e| e.id.as_str() == id_or_name)
            .or_else(|| entries.iter().find(|e| e.names.iter().any(|n| n == id_or_name)))
            .cloned()
            .ok_or_else(|| StevedoreError::NotFound {
                kind: "image",
                id: id_or_name.to_string(),
            })
    }

    /// Applies `f` to the records under the catalog lock and persists the
    /// result if `f` succeeds.
    ///
    /// # Errors
    ///
    /// Returns any error from locking, reading, `f`, or writing.
    pub fn update<T>(&self, f: impl FnOnce(&mut Vec<ImageRecord>) -> Result<T>) -> Result<T> {
        let lock = FileLock::open(&self.lock_path)?;
        let _guard = lock.lock()?;
        let mut entries = self.list()?;
        let out = f(&mut entries)?;
        let json = serde_json::to_vec_pretty(&entries)?;
        write_atomic(&self.catalog_path, &json)?;
        Ok(out)
    }
}
