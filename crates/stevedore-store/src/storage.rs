//! On-disk layout of the content store.
//!
//! ```text
//! <root>/
//!   catalog.json          image records
//!   catalog.lock          guards catalog read-modify-write
//!   images/<id>/<key>     big-data blobs, one file per key
//!   locks/<id>.lock       per-image advisory locks
//! ```
//!
//! Every file is replaced atomically (temp file + rename) so concurrent
//! readers see either the previous or the new content, never a mix.

use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::ImageId;

/// Manages the directory layout of a store.
#[derive(Debug, Clone)]
pub struct StorageBackend {
    /// Root directory for all stored data.
    root: PathBuf,
}

impl StorageBackend {
    /// Opens or initializes the storage backend at the given root.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tracing::info!(path = %root.display(), "opening storage backend");
        for dir in [root.join("images"), root.join("locks")] {
            std::fs::create_dir_all(&dir).map_err(|e| StevedoreError::io(&dir, e))?;
        }
        Ok(Self { root })
    }

    /// Returns the root storage path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the catalog file.
    #[must_use]
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.json")
    }

    /// Path of the lock file guarding the catalog.
    #[must_use]
    pub fn catalog_lock_path(&self) -> PathBuf {
        self.root.join("catalog.lock")
    }

    /// Directory holding an image's big-data files.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Config` if the identifier could escape the
    /// store root.
    pub fn image_dir(&self, id: &ImageId) -> Result<PathBuf> {
        check_id(id)?;
        Ok(self.root.join("images").join(id.as_str()))
    }

    /// Path of one big-data item of an image.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Config` if the identifier is unsafe.
    pub fn big_data_path(&self, id: &ImageId, key: &str) -> Result<PathBuf> {
        Ok(self.image_dir(id)?.join(encode_key(key)))
    }

    /// Path of an image's advisory lock file.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Config` if the identifier is unsafe.
    pub fn lock_path(&self, id: &ImageId) -> Result<PathBuf> {
        check_id(id)?;
        Ok(self.root.join("locks").join(format!("{id}.lock")))
    }
}

/// Replaces `path` with `data` atomically.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StevedoreError::io(parent, e))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| StevedoreError::io(parent, e))?;
    tmp.write_all(data)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| StevedoreError::io(tmp.path(), e))?;
    let _ = tmp
        .persist(path)
        .map_err(|e| StevedoreError::io(path, e.error))?;
    Ok(())
}

/// Reads a whole file, mapping a missing file to `None`.
///
/// # Errors
///
/// Returns an error for any failure other than the file not existing.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StevedoreError::io(path, e)),
    }
}

fn check_id(id: &ImageId) -> Result<()> {
    let s = id.as_str();
    if s.is_empty() || s.contains(['/', '\\']) || s == "." || s == ".." {
        return Err(StevedoreError::Config {
            message: format!("invalid image id {s:?}"),
        });
    }
    Ok(())
}

/// Maps a big-data key to a file name, percent-encoding anything outside
/// `[A-Za-z0-9._-]`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_open_creates_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path()).expect("open");
        assert_eq!(storage.root(), dir.path());
        assert!(dir.path().join("images").is_dir());
        assert!(dir.path().join("locks").is_dir());
    }

    #[test]
    fn big_data_path_encodes_digest_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path()).expect("open");
        let path = storage
            .big_data_path(&ImageId::new("abc"), "manifest-sha256:00ff")
            .expect("path");
        assert!(path.ends_with("images/abc/manifest-sha256%3A00ff"));
    }

    #[test]
    fn hidden_keys_are_not_dotfiles() {
        assert_eq!(encode_key(".."), "%2E.");
        assert_eq!(encode_key("a/b"), "a%2Fb");
    }

    #[test]
    fn unsafe_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = StorageBackend::open(dir.path()).expect("open");
        assert!(storage.image_dir(&ImageId::new("../escape")).is_err());
        assert!(storage.lock_path(&ImageId::new("")).is_err());
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("file");
        write_atomic(&path, b"first").expect("write");
        write_atomic(&path, b"second").expect("rewrite");
        assert_eq!(read_optional(&path).expect("read"), Some(b"second".to_vec()));
        assert_eq!(read_optional(&dir.path().join("absent")).expect("read"), None);
    }
}
