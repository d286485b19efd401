//! `stevedore network` — Manage CNI networks.

use std::collections::BTreeMap;

use clap::{Args, Subcommand};
use stevedore_common::config::StevedoreConfig;
use stevedore_network::{ContainerNetwork, InitConfig, Network, Subnet, new_cni_network_interface};

/// Arguments for the `network` command.
#[derive(Args, Debug)]
pub struct NetworkArgs {
    /// Network operation.
    #[command(subcommand)]
    pub command: NetworkCommand,
}

/// Network operations.
#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// List networks.
    Ls,
    /// Print network definitions as JSON.
    Inspect(InspectArgs),
    /// Create a network.
    Create(CreateArgs),
    /// Remove networks.
    Rm(RmArgs),
}

/// Arguments for `network inspect`.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Names or IDs of the networks.
    #[arg(required = true)]
    pub networks: Vec<String>,
}

/// Arguments for `network create`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Name of the network.
    pub name: String,

    /// Driver: `bridge`, `macvlan`, or `ipvlan`.
    #[arg(short, long, default_value = "bridge")]
    pub driver: String,

    /// Bridge name, or parent device for `macvlan`/`ipvlan`.
    #[arg(long)]
    pub interface_name: Option<String>,

    /// Subnet in CIDR notation (repeatable).
    #[arg(long)]
    pub subnet: Vec<String>,

    /// Gateway for the subnet at the same position (repeatable).
    #[arg(long)]
    pub gateway: Vec<String>,

    /// Keep containers off outside networks.
    #[arg(long)]
    pub internal: bool,

    /// Serve container names over DNS.
    #[arg(long)]
    pub dns: bool,

    /// Label as `key=value` (repeatable).
    #[arg(long, value_parser = parse_key_value)]
    pub label: Vec<(String, String)>,

    /// Driver option as `key=value`, e.g. `mtu=1400` (repeatable).
    #[arg(short, long, value_parser = parse_key_value)]
    pub opt: Vec<(String, String)>,
}

/// Arguments for `network rm`.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Names or IDs of the networks.
    #[arg(required = true)]
    pub networks: Vec<String>,
}

/// Executes the `network` command.
///
/// # Errors
///
/// Returns an error if the network interface cannot be built or the
/// operation fails.
pub fn execute(config: &StevedoreConfig, args: NetworkArgs) -> anyhow::Result<()> {
    let net = new_cni_network_interface(InitConfig::from(&config.network))?;
    match args.command {
        NetworkCommand::Ls => ls(net.as_ref()),
        NetworkCommand::Inspect(args) => inspect(net.as_ref(), &args),
        NetworkCommand::Create(args) => create(net.as_ref(), args),
        NetworkCommand::Rm(args) => rm(net.as_ref(), &args),
    }
}

fn ls(net: &dyn ContainerNetwork) -> anyhow::Result<()> {
    println!("{:<14} {:<24} {:<10} {:<20}", "NETWORK ID", "NAME", "DRIVER", "SUBNETS");
    for network in net.networks()? {
        let subnets: Vec<&str> = network.subnets.iter().map(|s| s.subnet.as_str()).collect();
        println!(
            "{:<14} {:<24} {:<10} {:<20}",
            network.id.get(..12).unwrap_or(&network.id),
            network.name,
            network.driver,
            subnets.join(",")
        );
    }
    Ok(())
}

fn inspect(net: &dyn ContainerNetwork, args: &InspectArgs) -> anyhow::Result<()> {
    let networks = args
        .networks
        .iter()
        .map(|name| net.network_inspect(name))
        .collect::<Result<Vec<_>, _>>()?;
    println!("{}", serde_json::to_string_pretty(&networks)?);
    Ok(())
}

fn create(net: &dyn ContainerNetwork, args: CreateArgs) -> anyhow::Result<()> {
    if args.gateway.len() > args.subnet.len() {
        anyhow::bail!("every --gateway needs a matching --subnet");
    }
    let mut gateways = args.gateway.into_iter();
    let subnets = args
        .subnet
        .into_iter()
        .map(|subnet| Subnet {
            subnet,
            gateway: gateways.next(),
        })
        .collect();

    let created = net.network_create(Network {
        name: args.name,
        driver: args.driver,
        network_interface: args.interface_name.unwrap_or_default(),
        subnets,
        internal: args.internal,
        dns_enabled: args.dns,
        labels: args.label.into_iter().collect::<BTreeMap<_, _>>(),
        options: args.opt.into_iter().collect::<BTreeMap<_, _>>(),
        ..Network::default()
    })?;
    println!("{}", created.name);
    Ok(())
}

fn rm(net: &dyn ContainerNetwork, args: &RmArgs) -> anyhow::Result<()> {
    let mut failed = 0usize;
    for name in &args.networks {
        match net.network_remove(name) {
            Ok(()) => println!("{name}"),
            Err(e) => {
                eprintln!("{name}: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} networks could not be removed", args.networks.len());
    }
    Ok(())
}

fn parse_key_value(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, val)| (key.to_string(), val.to_string()))
        .ok_or_else(|| format!("expected key=value, got {value:?}"))
}
