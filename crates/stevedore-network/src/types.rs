//! Network model shared by every backend.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stevedore_common::error::Result;

/// Driver used for networks that do not name one.
pub const BRIDGE_DRIVER: &str = "bridge";

/// Drivers that can be created.
pub const SUPPORTED_DRIVERS: &[&str] = &[BRIDGE_DRIVER, "macvlan", "ipvlan"];

/// One address range of a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Range in CIDR notation, e.g. `10.88.0.0/16`.
    pub subnet: String,
    /// Gateway address; the first host address when unset at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// A container network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Network {
    /// Unique name.
    pub name: String,
    /// Hex identifier derived from the name.
    #[serde(default)]
    pub id: String,
    /// Plugin type of the main plugin (`bridge`, `macvlan`, `ipvlan`).
    #[serde(default)]
    pub driver: String,
    /// Host interface: the bridge name, or the parent device for
    /// `macvlan`/`ipvlan`.
    #[serde(default)]
    pub network_interface: String,
    /// Address ranges.
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    /// Whether containers get IPv6 addresses.
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// Whether traffic is kept off the host's outside interfaces.
    #[serde(default)]
    pub internal: bool,
    /// Whether the `dnsname` plugin serves container names.
    #[serde(default)]
    pub dns_enabled: bool,
    /// User labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Driver options, e.g. `mtu`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    /// When the configuration was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

/// Manages the networks containers can join.
pub trait ContainerNetwork: Send + Sync {
    /// Returns every network, the default one included, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration directory cannot be read.
    fn networks(&self) -> Result<Vec<Network>>;

    /// Looks a network up by name, full identifier, or unique identifier
    /// prefix.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if nothing matches, or
    /// `StevedoreError::Network` if an identifier prefix is ambiguous.
    fn network_inspect(&self, name_or_id: &str) -> Result<Network>;

    /// Validates and stores a new network, filling in defaults.
    ///
    /// Returns the network as stored.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Network` for invalid definitions or
    /// conflicts with existing networks.
    fn network_create(&self, network: Network) -> Result<Network>;

    /// Removes a network.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` for unknown networks, or
    /// `StevedoreError::Network` for the default network.
    fn network_remove(&self, name_or_id: &str) -> Result<()>;

    /// Name of the network containers join by default.
    fn default_network(&self) -> &str;

    /// Locates the binary of `plugin` in the plugin directories.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::NotFound` if no directory contains it.
    fn plugin_path(&self, plugin: &str) -> Result<PathBuf>;
}
