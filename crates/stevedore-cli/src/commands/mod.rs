//! CLI command definitions and dispatch.

pub mod manifest;
pub mod network;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stevedore_common::config::StevedoreConfig;
use stevedore_common::constants;
use stevedore_common::context::Context;

/// Stevedore — manifest lists and container networks.
#[derive(Parser, Debug)]
#[command(name = "stevedore", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, global = true, env = "STEVEDORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Content store root, overriding the configuration.
    #[arg(long, global = true, env = "STEVEDORE_ROOT")]
    pub root: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, modify, and push manifest lists.
    Manifest(manifest::ManifestArgs),
    /// Manage CNI networks.
    Network(network::NetworkArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if configuration loading or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(|| constants::data_dir().join("config.json"));
    let mut config = StevedoreConfig::load(&config_path)?;
    if let Some(root) = cli.root {
        config.store_root = root;
    }

    let ctx = Context::new();
    let handle = ctx.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("interrupted, cancelling");
        handle.cancel();
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    match cli.command {
        Command::Manifest(args) => manifest::execute(&ctx, &config, args),
        Command::Network(args) => network::execute(&config, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_push() {
        let cli = Cli::try_parse_from([
            "stevedore",
            "manifest",
            "push",
            "--retry",
            "5",
            "--retry-delay",
            "3s",
            "--digest",
            "sha256:0000000000000000000000000000000000000000000000000000000000000000",
            "foo",
            "docker://registry.example.com/foo:latest",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Command::Manifest(_)));
    }

    #[test]
    fn parses_network_create() {
        let cli = Cli::try_parse_from([
            "stevedore",
            "network",
            "create",
            "--subnet",
            "10.89.7.0/24",
            "--label",
            "team=infra",
            "backend",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Command::Network(_)));
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Cli::try_parse_from(["stevedore", "build"]).is_err());
    }
}
