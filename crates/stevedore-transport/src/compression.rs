//! Layer compression codecs.
//!
//! Layers travel as tar archives that are either uncompressed, gzip
//! compressed (`flate2`), or zstd compressed (`zstd`). The copy engine uses
//! this module to recompress layers when a destination forces a format or
//! asks for additional compression variants.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use stevedore_common::error::{Result, StevedoreError};

use crate::manifest::DOCKER_V2_SCHEMA2;

const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// A layer compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// No compression.
    Uncompressed,
    /// gzip (RFC 1952).
    Gzip,
    /// Zstandard.
    Zstd,
}

impl Algorithm {
    /// Every supported algorithm.
    #[must_use]
    pub const fn supported() -> &'static [Self] {
        &[Self::Gzip, Self::Zstd, Self::Uncompressed]
    }

    /// Returns the algorithm's canonical name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Uncompressed => "uncompressed",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }

    /// Detects the algorithm used by a layer from its media type.
    ///
    /// Returns `None` for media types that are not plain layers
    /// (foreign or non-distributable layers are never transformed).
    #[must_use]
    pub fn from_layer_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            DOCKER_LAYER | OCI_LAYER => Some(Self::Uncompressed),
            DOCKER_LAYER_GZIP | OCI_LAYER_GZIP => Some(Self::Gzip),
            OCI_LAYER_ZSTD => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Detects the algorithm from a blob's magic bytes.
    #[must_use]
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else if data.starts_with(ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::Uncompressed
        }
    }

    /// Layer media type for this algorithm within a manifest of type
    /// `manifest_media_type`, or `None` when the manifest format cannot
    /// express it (zstd in Docker schema 2).
    #[must_use]
    pub fn layer_media_type(self, manifest_media_type: &str) -> Option<&'static str> {
        if manifest_media_type == DOCKER_V2_SCHEMA2 {
            return match self {
                Self::Uncompressed => Some(DOCKER_LAYER),
                Self::Gzip => Some(DOCKER_LAYER_GZIP),
                Self::Zstd => None,
            };
        }
        Some(match self {
            Self::Uncompressed => OCI_LAYER,
            Self::Gzip => OCI_LAYER_GZIP,
            Self::Zstd => OCI_LAYER_ZSTD,
        })
    }

    /// Compresses `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder fails.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Uncompressed => Ok(data.to_vec()),
            Self::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data).map_err(codec_error)?;
                encoder.finish().map_err(codec_error)
            }
            Self::Zstd => zstd::stream::encode_all(data, 3).map_err(codec_error),
        }
    }

    /// Decompresses `data`.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::MalformedData` if `data` is not valid for
    /// this algorithm.
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Uncompressed => Ok(data.to_vec()),
            Self::Gzip => {
                let mut out = Vec::new();
                let _ = flate2::read::GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| StevedoreError::malformed("gzip layer", e))?;
                Ok(out)
            }
            Self::Zstd => {
                zstd::stream::decode_all(data).map_err(|e| StevedoreError::malformed("zstd layer", e))
            }
        }
    }

    /// Re-encodes a layer from `self` to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding or encoding fails.
    pub fn recompress(self, data: &[u8], target: Self) -> Result<Vec<u8>> {
        if self == target {
            return Ok(data.to_vec());
        }
        target.compress(&self.decompress(data)?)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::supported()
            .iter()
            .copied()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| StevedoreError::Config {
                message: format!(
                    "unsupported compression format {s:?} (supported: gzip, zstd, uncompressed)"
                ),
            })
    }
}

fn codec_error(e: std::io::Error) -> StevedoreError {
    StevedoreError::Config {
        message: format!("compression failed: {e}"),
    }
}
