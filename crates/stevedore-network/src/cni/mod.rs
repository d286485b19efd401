//! CNI-backed [`ContainerNetwork`].
//!
//! Every network is a `<name>.conflist` file in the configuration
//! directory. The default network needs no file: when none defines it, a
//! bridge network on the default subnet is synthesized on each read.
//! Writers serialize through a lock file in the same directory.

pub mod conflist;
pub mod subnet;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use stevedore_common::config::NetworkConfig;
use stevedore_common::error::{Result, StevedoreError};
use stevedore_store::lock::FileLock;
use stevedore_store::storage::write_atomic;

use crate::types::{BRIDGE_DRIVER, ContainerNetwork, Network, SUPPORTED_DRIVERS, Subnet};
use conflist::{ConfigList, network_id};
use subnet::{Cidr, next_free_ipv4};

const CONFLIST_EXTENSION: &str = "conflist";
const LOCK_FILE: &str = "cni.lock";
const BRIDGE_PREFIX: &str = "cni-podman";

/// Settings for [`new_cni_network_interface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    /// Directory holding `*.conflist` files; created if missing.
    pub cni_config_dir: PathBuf,
    /// Directories searched for plugin binaries, in order.
    pub cni_plugin_dirs: Vec<PathBuf>,
    /// Name of the default network.
    pub default_network: String,
    /// Subnet of the default network when synthesized.
    pub default_subnet: String,
}

impl From<&NetworkConfig> for InitConfig {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            cni_config_dir: config.cni_config_dir.clone(),
            cni_plugin_dirs: config.cni_plugin_dirs.clone(),
            default_network: config.default_network.clone(),
            default_subnet: config.default_subnet.clone(),
        }
    }
}

/// Builds a CNI network interface.
///
/// # Errors
///
/// - `StevedoreError::Network` if the default network name or subnet is
///   invalid.
/// - `StevedoreError::Io` if the configuration directory cannot be created.
pub fn new_cni_network_interface(config: InitConfig) -> Result<Box<dyn ContainerNetwork>> {
    Ok(Box::new(CniNetwork::new(config)?))
}

/// Networks stored as CNI configuration lists.
#[derive(Debug)]
pub struct CniNetwork {
    config: InitConfig,
    default_cidr: Cidr,
    lock: FileLock,
}

/// A network together with the file that defines it.
struct Loaded {
    network: Network,
    path: Option<PathBuf>,
}

impl CniNetwork {
    /// Validates `config` and prepares the configuration directory.
    ///
    /// # Errors
    ///
    /// See [`new_cni_network_interface`].
    pub fn new(config: InitConfig) -> Result<Self> {
        validate_name(&config.default_network)?;
        let default_cidr = Cidr::parse(&config.default_subnet)?;
        std::fs::create_dir_all(&config.cni_config_dir)
            .map_err(|e| StevedoreError::io(&config.cni_config_dir, e))?;
        let lock = FileLock::open(&config.cni_config_dir.join(LOCK_FILE))?;
        tracing::debug!(
            config_dir = %config.cni_config_dir.display(),
            default_network = %config.default_network,
            "CNI network interface ready"
        );
        Ok(Self {
            config,
            default_cidr,
            lock,
        })
    }

    /// Reads every configuration list, skipping invalid files.
    fn load(&self) -> Result<Vec<Loaded>> {
        let dir = &self.config.cni_config_dir;
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| StevedoreError::io(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == CONFLIST_EXTENSION))
            .collect();
        paths.sort();

        let mut loaded: Vec<Loaded> = Vec::with_capacity(paths.len() + 1);
        for path in paths {
            let data = std::fs::read(&path).map_err(|e| StevedoreError::io(&path, e))?;
            let list = match ConfigList::from_slice(&data) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping invalid CNI config");
                    continue;
                }
            };
            if loaded.iter().any(|l| l.network.name == list.name) {
                tracing::warn!(
                    path = %path.display(),
                    name = %list.name,
                    "skipping CNI config with duplicate network name"
                );
                continue;
            }
            let mut network = list.to_network();
            network.created = modified_at(&path);
            loaded.push(Loaded {
                network,
                path: Some(path),
            });
        }

        if !loaded.iter().any(|l| l.network.name == self.config.default_network) {
            loaded.push(Loaded {
                network: self.default_bridge(),
                path: None,
            });
        }
        loaded.sort_by(|a, b| a.network.name.cmp(&b.network.name));
        Ok(loaded)
    }

    fn default_bridge(&self) -> Network {
        Network {
            name: self.config.default_network.clone(),
            id: network_id(&self.config.default_network),
            driver: BRIDGE_DRIVER.to_string(),
            network_interface: format!("{BRIDGE_PREFIX}0"),
            subnets: vec![Subnet {
                subnet: self.default_cidr.to_string(),
                gateway: Some(self.default_cidr.first_host().to_string()),
            }],
            ipv6_enabled: self.default_cidr.is_ipv6(),
            ..Network::default()
        }
    }

    fn find(&self, name_or_id: &str) -> Result<Loaded> {
        let mut loaded = self.load()?;
        if let Some(pos) = loaded
            .iter()
            .position(|l| l.network.name == name_or_id || l.network.id == name_or_id)
        {
            return Ok(loaded.swap_remove(pos));
        }
        let mut matches: Vec<usize> = loaded
            .iter()
            .enumerate()
            .filter(|(_, l)| !name_or_id.is_empty() && l.network.id.starts_with(name_or_id))
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => Err(StevedoreError::NotFound {
                kind: "network",
                id: name_or_id.to_string(),
            }),
            1 => Ok(loaded.swap_remove(matches.remove(0))),
            n => Err(StevedoreError::Network {
                message: format!("network id prefix {name_or_id:?} is ambiguous ({n} matches)"),
            }),
        }
    }

    /// Fills defaults into `network` and checks it against `existing`.
    fn prepare(&self, mut network: Network, existing: &[Loaded]) -> Result<Network> {
        validate_name(&network.name)?;
        if existing.iter().any(|l| l.network.name == network.name) {
            return Err(StevedoreError::Network {
                message: format!("network name {} already used", network.name),
            });
        }
        if network.driver.is_empty() {
            network.driver = BRIDGE_DRIVER.to_string();
        }
        if !SUPPORTED_DRIVERS.contains(&network.driver.as_str()) {
            return Err(StevedoreError::Network {
                message: format!("unsupported driver {}", network.driver),
            });
        }
        if let Some(mtu) = network.options.get("mtu") {
            let _: u32 = mtu.parse().map_err(|_| StevedoreError::Network {
                message: format!("invalid mtu {mtu:?}"),
            })?;
        }

        let used: Vec<Cidr> = existing
            .iter()
            .flat_map(|l| l.network.subnets.iter())
            .filter_map(|s| Cidr::parse(&s.subnet).ok())
            .collect();
        if network.subnets.is_empty() {
            network.subnets.push(Subnet {
                subnet: next_free_ipv4(&used)?.to_string(),
                gateway: None,
            });
        }
        let mut claimed = used;
        for subnet in &mut network.subnets {
            let cidr = Cidr::parse(&subnet.subnet)?;
            if claimed.iter().any(|c| c.overlaps(&cidr)) {
                return Err(StevedoreError::Network {
                    message: format!("subnet {cidr} is already used on the host or by another network"),
                });
            }
            let gateway = match subnet.gateway.take() {
                Some(gateway) => {
                    let ip = gateway.parse().map_err(|_| StevedoreError::Network {
                        message: format!("invalid gateway {gateway:?}"),
                    })?;
                    if !cidr.contains(ip) {
                        return Err(StevedoreError::Network {
                            message: format!("gateway {gateway} is not in subnet {cidr}"),
                        });
                    }
                    gateway
                }
                None => cidr.first_host().to_string(),
            };
            subnet.gateway = Some(gateway);
            if cidr.is_ipv6() {
                network.ipv6_enabled = true;
            }
            claimed.push(cidr);
        }

        if network.driver == BRIDGE_DRIVER {
            if network.network_interface.is_empty() {
                network.network_interface = next_bridge_name(existing);
            } else if existing
                .iter()
                .any(|l| l.network.network_interface == network.network_interface)
            {
                return Err(StevedoreError::Network {
                    message: format!(
                        "bridge name {} already in use",
                        network.network_interface
                    ),
                });
            }
        }

        network.id = network_id(&network.name);
        Ok(network)
    }

    fn conflist_path(&self, name: &str) -> PathBuf {
        self.config
            .cni_config_dir
            .join(format!("{name}.{CONFLIST_EXTENSION}"))
    }
}

impl ContainerNetwork for CniNetwork {
    fn networks(&self) -> Result<Vec<Network>> {
        Ok(self.load()?.into_iter().map(|l| l.network).collect())
    }

    fn network_inspect(&self, name_or_id: &str) -> Result<Network> {
        self.find(name_or_id).map(|l| l.network)
    }

    fn network_create(&self, network: Network) -> Result<Network> {
        let _guard = self.lock.lock()?;
        let existing = self.load()?;
        let mut network = self.prepare(network, &existing)?;

        let path = self.conflist_path(&network.name);
        write_atomic(&path, &ConfigList::from_network(&network).to_vec()?)?;
        network.created = modified_at(&path);
        tracing::info!(
            name = %network.name,
            driver = %network.driver,
            path = %path.display(),
            "created network"
        );
        Ok(network)
    }

    fn network_remove(&self, name_or_id: &str) -> Result<()> {
        let _guard = self.lock.lock()?;
        let loaded = self.find(name_or_id)?;
        if loaded.network.name == self.config.default_network {
            return Err(StevedoreError::Network {
                message: format!("default network {} cannot be removed", loaded.network.name),
            });
        }
        if let Some(path) = &loaded.path {
            std::fs::remove_file(path).map_err(|e| StevedoreError::io(path, e))?;
        }
        tracing::info!(name = %loaded.network.name, "removed network");
        Ok(())
    }

    fn default_network(&self) -> &str {
        &self.config.default_network
    }

    fn plugin_path(&self, plugin: &str) -> Result<PathBuf> {
        let search: OsString = std::env::join_paths(&self.config.cni_plugin_dirs).map_err(|e| {
            StevedoreError::Config {
                message: format!("invalid CNI plugin directory: {e}"),
            }
        })?;
        which::which_in(plugin, Some(search), &self.config.cni_config_dir).map_err(|_| {
            StevedoreError::NotFound {
                kind: "CNI plugin",
                id: format!(
                    "{plugin} in {}",
                    self.config
                        .cni_plugin_dirs
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>()
                        .join(":")
                ),
            }
        })
    }
}

/// Network names: alphanumerics plus `_`, `.`, `-`, not starting with
/// punctuation.
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StevedoreError::Network {
            message: format!(
                "invalid network name {name:?}: must match [a-zA-Z0-9][a-zA-Z0-9_.-]*"
            ),
        })
    }
}

fn next_bridge_name(existing: &[Loaded]) -> String {
    (0u32..)
        .map(|i| format!("{BRIDGE_PREFIX}{i}"))
        .find(|name| !existing.iter().any(|l| &l.network.network_interface == name))
        .unwrap_or_else(|| BRIDGE_PREFIX.to_string())
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
