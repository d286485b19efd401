//! Local directory transport (`dir:`).
//!
//! Layout of a directory holding one image or list:
//!
//! ```text
//! version                 "Directory Transport Version: 1.1"
//! manifest.json           primary manifest
//! <hex>.manifest.json     per-instance manifests of a list
//! <hex>                   blobs (configs and layers)
//! ```

use std::path::{Path, PathBuf};

use stevedore_common::context::Context;
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::Digest;

use crate::hash;
use crate::manifest::{Descriptor, guess_media_type};
use crate::source::{ImageDestination, ImageSource};

const VERSION_FILE: &str = "version";
const VERSION: &str = "Directory Transport Version: 1.1\n";
const MANIFEST_FILE: &str = "manifest.json";

fn instance_manifest_file(digest: &Digest) -> String {
    format!("{}.manifest.json", digest.encoded())
}

/// Reads an image from a directory.
#[derive(Debug)]
pub struct DirSource {
    path: PathBuf,
}

impl DirSource {
    /// Opens the directory at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Fetch` if the directory does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            return Err(StevedoreError::Fetch {
                reference: format!("dir:{}", path.display()),
                message: "no such directory".into(),
                transient: false,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path.join(name);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StevedoreError::Fetch {
                reference: self.reference(),
                message: format!("reading {}: {e}", path.display()),
                transient: false,
            }),
        }
    }

    fn missing(&self, what: String) -> StevedoreError {
        StevedoreError::Fetch {
            reference: self.reference(),
            message: format!("{what} not found"),
            transient: false,
        }
    }
}

impl ImageSource for DirSource {
    fn reference(&self) -> String {
        format!("dir:{}", self.path.display())
    }

    fn manifest(&self, ctx: &Context, instance: Option<&Digest>) -> Result<(Vec<u8>, String)> {
        ctx.check()?;
        let data = match instance {
            None => self
                .read(MANIFEST_FILE)?
                .ok_or_else(|| self.missing("manifest".into()))?,
            Some(digest) => match self.read(&instance_manifest_file(digest))? {
                Some(data) => data,
                None => {
                    // A single image can be addressed by its own digest.
                    let primary = self
                        .read(MANIFEST_FILE)?
                        .ok_or_else(|| self.missing(format!("manifest {digest}")))?;
                    if &Digest::sha256_of(&primary) != digest {
                        return Err(self.missing(format!("manifest {digest}")));
                    }
                    primary
                }
            },
        };
        let media_type = guess_media_type(&data);
        Ok((data, media_type))
    }

    fn blob(&self, ctx: &Context, descriptor: &Descriptor) -> Result<Vec<u8>> {
        ctx.check()?;
        let data = self
            .read(descriptor.digest.encoded())?
            .ok_or_else(|| self.missing(format!("blob {}", descriptor.digest)))?;
        hash::validate(&descriptor.digest.to_string(), &data, &descriptor.digest)?;
        Ok(data)
    }
}

/// Writes an image into a directory.
#[derive(Debug)]
pub struct DirDestination {
    path: PathBuf,
}

impl DirDestination {
    /// Prepares `path` for writing.
    ///
    /// An existing directory is reused only if it is empty or was written
    /// by this transport before; in the latter case its content is
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Push` if the directory holds unrelated
    /// files or cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        let reference = format!("dir:{}", path.display());
        let push_err = |message: String| StevedoreError::Push {
            reference: reference.clone(),
            message,
            transient: false,
        };
        if path.exists() {
            let entries: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|e| push_err(e.to_string()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .collect();
            if !entries.is_empty() {
                if !path.join(VERSION_FILE).exists() {
                    return Err(push_err(
                        "refusing to overwrite a non-empty directory not created by this transport"
                            .into(),
                    ));
                }
                for entry in entries {
                    let removed = if entry.is_dir() {
                        std::fs::remove_dir_all(&entry)
                    } else {
                        std::fs::remove_file(&entry)
                    };
                    removed.map_err(|e| push_err(format!("clearing {}: {e}", entry.display())))?;
                }
            }
        } else {
            std::fs::create_dir_all(path).map_err(|e| push_err(e.to_string()))?;
        }
        std::fs::write(path.join(VERSION_FILE), VERSION).map_err(|e| push_err(e.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path.join(name);
        std::fs::write(&path, data).map_err(|e| StevedoreError::Push {
            reference: self.reference(),
            message: format!("writing {}: {e}", path.display()),
            transient: false,
        })
    }
}

impl ImageDestination for DirDestination {
    fn reference(&self) -> String {
        format!("dir:{}", self.path.display())
    }

    fn has_blob(&self, ctx: &Context, digest: &Digest) -> Result<bool> {
        ctx.check()?;
        Ok(self.path.join(digest.encoded()).is_file())
    }

    fn put_blob(&mut self, ctx: &Context, digest: &Digest, data: &[u8]) -> Result<()> {
        ctx.check()?;
        self.write(digest.encoded(), data)
    }

    fn put_manifest(
        &mut self,
        ctx: &Context,
        manifest: &[u8],
        _media_type: &str,
        instance: Option<&Digest>,
    ) -> Result<()> {
        ctx.check()?;
        match instance {
            None => self.write(MANIFEST_FILE, manifest),
            Some(digest) => self.write(&instance_manifest_file(digest), manifest),
        }
    }

    fn commit(&mut self, ctx: &Context) -> Result<()> {
        ctx.check()?;
        tracing::debug!(path = %self.path.display(), "directory image committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::DOCKER_V2_LIST;

    #[test]
    fn destination_then_source_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = Context::new();
        let blob = b"config".to_vec();
        let digest = Digest::sha256_of(&blob);
        let list = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.list.v2+json","manifests":[]}"#;

        let mut dest = DirDestination::create(dir.path()).expect("create");
        dest.put_blob(&ctx, &digest, &blob).expect("blob");
        dest.put_manifest(&ctx, list, DOCKER_V2_LIST, None)
            .expect("manifest");
        dest.commit(&ctx).expect("commit");
        assert!(dest.has_blob(&ctx, &digest).expect("has"));

        let src = DirSource::open(dir.path()).expect("open");
        let (data, media_type) = src.manifest(&ctx, None).expect("manifest");
        assert_eq!(data, list);
        assert_eq!(media_type, DOCKER_V2_LIST);
        let desc = Descriptor::for_content("application/octet-stream", &blob);
        assert_eq!(src.blob(&ctx, &desc).expect("blob"), blob);
    }

    #[test]
    fn single_image_is_addressable_by_its_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = Context::new();
        let manifest = br#"{"schemaVersion":2,"config":{"mediaType":"x","digest":"sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855","size":0},"layers":[]}"#;
        std::fs::write(dir.path().join(MANIFEST_FILE), manifest).expect("write");

        let src = DirSource::open(dir.path()).expect("open");
        let own = Digest::sha256_of(manifest);
        assert!(src.manifest(&ctx, Some(&own)).is_ok());
        let other = Digest::sha256_of(b"other");
        assert!(src.manifest(&ctx, Some(&other)).is_err());
    }

    #[test]
    fn corrupted_blob_fails_verification() {
        let dir = tempfile::tempdir().expect("tempdir");
        let digest = Digest::sha256_of(b"original");
        std::fs::write(dir.path().join(digest.encoded()), b"tampered").expect("write");
        let src = DirSource::open(dir.path()).expect("open");
        let desc = Descriptor::for_content("x", b"original");
        assert!(matches!(
            src.blob(&Context::new(), &desc),
            Err(StevedoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn destination_refuses_foreign_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("precious.txt"), b"keep me").expect("write");
        assert!(DirDestination::create(dir.path()).is_err());
        assert!(dir.path().join("precious.txt").exists());
    }

    #[test]
    fn destination_replaces_previous_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = Context::new();
        let mut first = DirDestination::create(dir.path()).expect("first");
        first
            .put_blob(&ctx, &Digest::sha256_of(b"old"), b"old")
            .expect("blob");
        let _second = DirDestination::create(dir.path()).expect("second");
        assert!(!dir.path().join(Digest::sha256_of(b"old").encoded()).exists());
        assert!(dir.path().join(VERSION_FILE).exists());
    }

    #[test]
    fn missing_directory_is_a_permanent_fetch_error() {
        let err = DirSource::open(Path::new("/nonexistent/stevedore")).expect_err("missing");
        assert!(matches!(err, StevedoreError::Fetch { transient: false, .. }));
    }

    #[test]
    fn cancelled_context_stops_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = DirSource::open(dir.path()).expect("open");
        let ctx = Context::new();
        ctx.cancel();
        assert!(matches!(
            src.manifest(&ctx, None),
            Err(StevedoreError::Cancelled)
        ));
    }
}
