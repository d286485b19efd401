//! # stevedore-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Stevedore workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the primitives (digests, image identifiers,
//! platforms, cancellation) that the store, transport, and manifest crates
//! build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod types;
