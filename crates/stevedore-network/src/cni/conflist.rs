//! The CNI configuration list file format.
//!
//! Only the fields needed to describe a network are typed; everything
//! else a plugin entry carries is kept verbatim in `extra`, so files
//! written by other tools survive a load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use stevedore_common::constants::CNI_VERSION;
use stevedore_common::error::{Result, StevedoreError};

use crate::types::{BRIDGE_DRIVER, Network, Subnet};

/// Plugin providing container name resolution.
pub const DNSNAME_PLUGIN: &str = "dnsname";

/// A parsed `*.conflist` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigList {
    /// CNI specification version.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Network name.
    pub name: String,
    /// Plugin chain, main plugin first.
    pub plugins: Vec<Plugin>,
    /// Labels and options recorded at creation.
    #[serde(default, skip_serializing_if = "Args::is_empty")]
    pub args: Args,
}

/// Metadata stored under the list's `args` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Args {
    /// User labels.
    #[serde(default, rename = "podman_labels", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Driver options.
    #[serde(default, rename = "podman_options", skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl Args {
    fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.options.is_empty()
    }
}

/// One plugin of the chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    /// Plugin binary name.
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Bridge device (`bridge` plugin).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// Parent device (`macvlan`/`ipvlan` plugins).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
    /// Whether the bridge holds the gateway address.
    #[serde(rename = "isGateway", default, skip_serializing_if = "Option::is_none")]
    pub is_gateway: Option<bool>,
    /// Whether outgoing traffic is masqueraded.
    #[serde(rename = "ipMasq", default, skip_serializing_if = "Option::is_none")]
    pub ip_masq: Option<bool>,
    /// Link MTU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    /// Address management.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipam: Option<Ipam>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `host-local` address management.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ipam {
    /// IPAM plugin name.
    #[serde(rename = "type")]
    pub ipam_type: String,
    /// Routes pushed to containers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    /// Address range sets; one inner list per subnet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<Vec<Range>>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A route entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination range.
    pub dst: String,
}

/// An address range entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Range in CIDR notation.
    pub subnet: String,
    /// Gateway address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl ConfigList {
    /// Parses a conflist file.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::MalformedData` if the file is not a
    /// configuration list with at least one plugin.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let list: Self =
            serde_json::from_slice(data).map_err(|e| StevedoreError::malformed("CNI config list", e))?;
        if list.name.is_empty() {
            return Err(StevedoreError::malformed("CNI config list", "missing network name"));
        }
        if list.plugins.is_empty() {
            return Err(StevedoreError::malformed(
                "CNI config list",
                format!("network {} has no plugins", list.name),
            ));
        }
        Ok(list)
    }

    /// Serializes the list for writing to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        Ok(data)
    }

    /// Describes the network this list configures.
    #[must_use]
    pub fn to_network(&self) -> Network {
        let fallback = Plugin::default();
        let main = self.plugins.first().unwrap_or(&fallback);
        let network_interface = main
            .bridge
            .clone()
            .or_else(|| main.master.clone())
            .unwrap_or_default();
        let subnets: Vec<Subnet> = main
            .ipam
            .iter()
            .flat_map(|ipam| ipam.ranges.iter().flatten())
            .map(|range| Subnet {
                subnet: range.subnet.clone(),
                gateway: range.gateway.clone(),
            })
            .collect();
        let ipv6_enabled = subnets.iter().any(|s| s.subnet.contains(':'));
        let internal = main.plugin_type == BRIDGE_DRIVER && main.is_gateway != Some(true);
        let mut options = self.args.options.clone();
        if let Some(mtu) = main.mtu {
            let _ = options.entry("mtu".to_string()).or_insert_with(|| mtu.to_string());
        }

        Network {
            name: self.name.clone(),
            id: network_id(&self.name),
            driver: main.plugin_type.clone(),
            network_interface,
            subnets,
            ipv6_enabled,
            internal,
            dns_enabled: self.plugins.iter().any(|p| p.plugin_type == DNSNAME_PLUGIN),
            labels: self.args.labels.clone(),
            options,
            created: None,
        }
    }

    /// Builds the configuration list for a validated network.
    #[must_use]
    pub fn from_network(network: &Network) -> Self {
        let mtu = network.options.get("mtu").and_then(|m| m.parse().ok());
        let routes = if network.internal {
            Vec::new()
        } else {
            let mut routes = vec![Route {
                dst: "0.0.0.0/0".to_string(),
            }];
            if network.ipv6_enabled {
                routes.push(Route {
                    dst: "::/0".to_string(),
                });
            }
            routes
        };
        let ipam = Ipam {
            ipam_type: "host-local".to_string(),
            routes,
            ranges: network
                .subnets
                .iter()
                .map(|s| {
                    vec![Range {
                        subnet: s.subnet.clone(),
                        gateway: s.gateway.clone(),
                    }]
                })
                .collect(),
            extra: BTreeMap::new(),
        };

        let mut main = Plugin {
            plugin_type: network.driver.clone(),
            mtu,
            ipam: Some(ipam),
            ..Plugin::default()
        };
        let mut plugins = Vec::new();
        if network.driver == BRIDGE_DRIVER {
            main.bridge = Some(network.network_interface.clone());
            main.is_gateway = Some(!network.internal);
            main.ip_masq = Some(!network.internal);
            let _ = main.extra.insert("hairpinMode".to_string(), Value::Bool(true));
            plugins.push(main);
            plugins.push(plugin_with(
                "portmap",
                "capabilities",
                serde_json::json!({"portMappings": true}),
            ));
            plugins.push(plugin_with("firewall", "backend", Value::String(String::new())));
            plugins.push(Plugin {
                plugin_type: "tuning".to_string(),
                ..Plugin::default()
            });
        } else {
            main.master = Some(network.network_interface.clone()).filter(|m| !m.is_empty());
            plugins.push(main);
        }
        if network.dns_enabled {
            plugins.push(plugin_with(
                DNSNAME_PLUGIN,
                "domainName",
                Value::String("dns.podman".to_string()),
            ));
        }

        let mut options = network.options.clone();
        let _ = options.remove("mtu");
        Self {
            cni_version: CNI_VERSION.to_string(),
            name: network.name.clone(),
            plugins,
            args: Args {
                labels: network.labels.clone(),
                options,
            },
        }
    }
}

fn plugin_with(plugin_type: &str, key: &str, value: Value) -> Plugin {
    Plugin {
        plugin_type: plugin_type.to_string(),
        extra: BTreeMap::from([(key.to_string(), value)]),
        ..Plugin::default()
    }
}

/// Identifier of a network: the hex SHA-256 of its name.
#[must_use]
pub fn network_id(name: &str) -> String {
    Sha256::digest(name.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
