//! # stevedore-transport
//!
//! Moving images between locations.
//!
//! Handles:
//! - **References**: `docker://` and `dir:` reference parsing.
//! - **Manifests**: list and image manifest schemas and media types.
//! - **Transports**: image sources and destinations for a registry and a
//!   local directory.
//! - **Compression**: gzip and zstd layer codecs.
//! - **Copy**: selective, recompressing copy of images and lists.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod compression;
pub mod copy;
pub mod dir;
pub mod docker;
pub mod hash;
pub mod manifest;
pub mod reference;
pub mod source;
pub mod system;

pub use compression::Algorithm;
pub use copy::{CopyOptions, CopyOutcome, SelectionPolicy, copy_image};
pub use reference::{DockerReference, TransportReference};
pub use source::{ImageDestination, ImageSource, new_image_destination, new_image_source};
pub use system::SystemContext;
