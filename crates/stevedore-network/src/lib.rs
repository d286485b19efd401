//! # stevedore-network
//!
//! Container network configuration backed by CNI configuration lists.
//!
//! Handles:
//! - **Networks**: listing, inspecting, creating, and removing networks
//!   stored as `*.conflist` files.
//! - **Default network**: a bridge network synthesized in memory when no
//!   file defines it.
//! - **Plugins**: locating CNI plugin binaries in the configured
//!   directories.
//!
//! Plugins are never executed here; attaching containers to networks is
//! left to the runtime.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cni;
pub mod types;

pub use cni::{CniNetwork, InitConfig, new_cni_network_interface};
pub use types::{ContainerNetwork, Network, Subnet};
