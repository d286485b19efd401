//! # stevedore-store
//!
//! Local content store for Stevedore.
//!
//! Handles:
//! - **Catalog**: image records with identifiers, names, and digests.
//! - **Storage**: keyed big-data blobs per image, written atomically.
//! - **Locks**: advisory exclusive locks scoped to one image record.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod catalog;
pub mod lock;
pub mod storage;
pub mod store;

pub use catalog::ImageRecord;
pub use lock::LockGuard;
pub use store::{ImageLock, Store};
