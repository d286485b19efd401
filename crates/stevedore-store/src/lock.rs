//! Advisory file locks.
//!
//! A lock is an open lock file plus a `flock`-style exclusive lock taken
//! through `fs4`. The guard returned by [`FileLock::lock`] releases the lock
//! when dropped, so a lock can never be leaked past its scope. Locks are
//! advisory: they only exclude other holders of the same lock file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use stevedore_common::error::{Result, StevedoreError};

/// A named lock file that can be acquired exclusively.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Opens (creating if needed) the lock file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StevedoreError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StevedoreError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Blocks until the exclusive lock is held.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system refuses the lock.
    pub fn lock(&self) -> Result<LockGuard<'_>> {
        tracing::debug!(path = %self.path.display(), "acquiring lock");
        FileExt::lock_exclusive(&self.file).map_err(|e| StevedoreError::io(&self.path, e))?;
        Ok(LockGuard { lock: self })
    }

    /// Returns the path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Holds a [`FileLock`] until dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a FileLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock.file) {
            tracing::warn!(path = %self.lock.path.display(), error = %e, "failed to release lock");
        }
    }
}
