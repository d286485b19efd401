//! # stevedore-manifests
//!
//! Multi-platform manifest lists.
//!
//! Handles:
//! - **Model**: ordered, digest-unique list instances.
//! - **Resolution**: adding instances from `docker://` or `dir:` references.
//! - **Persistence**: saving lists into the content store and loading them
//!   back by identifier or name, under a per-record lock.
//! - **Publishing**: selecting instances and copying them to a destination
//!   with bounded retry.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod list;
pub mod persist;
pub mod push;
pub mod reference;
pub mod resolve;
pub mod retry;

pub use list::{Instance, ManifestList};
pub use persist::{load_from_image, locker_for_image};
pub use push::PushOptions;
pub use reference::ListReference;
pub use retry::{RetryEvent, RetryObserver, RetryPolicy};
pub use stevedore_transport::SelectionPolicy;
