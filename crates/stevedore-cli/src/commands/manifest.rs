//! `stevedore manifest` — Create, modify, and push manifest lists.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Subcommand};
use stevedore_common::config::StevedoreConfig;
use stevedore_common::constants::LIST_MANIFEST_KEY;
use stevedore_common::context::Context;
use stevedore_common::types::{Digest, ImageId};
use stevedore_manifests::{
    ManifestList, PushOptions, RetryEvent, RetryObserver, SelectionPolicy, load_from_image,
    locker_for_image,
};
use stevedore_store::Store;
use stevedore_transport::{Algorithm, SystemContext, TransportReference};

use crate::output::format_bytes;

/// Arguments for the `manifest` command.
#[derive(Args, Debug)]
pub struct ManifestArgs {
    /// Manifest list operation.
    #[command(subcommand)]
    pub command: ManifestCommand,
}

/// Manifest list operations.
#[derive(Subcommand, Debug)]
pub enum ManifestCommand {
    /// Create a manifest list, optionally seeded with images.
    Create(CreateArgs),
    /// Add an image or the images of a list to a manifest list.
    Add(AddArgs),
    /// Remove an instance from a manifest list.
    Remove(RemoveArgs),
    /// Print a manifest list.
    Inspect(InspectArgs),
    /// Push a manifest list to a destination.
    Push(PushArgs),
    /// Delete manifest lists from local storage.
    Rm(RmArgs),
    /// List stored manifest lists.
    Ls,
}

/// Platform selection shared by `create` and `add`.
#[derive(Args, Debug, Default)]
pub struct PlatformArgs {
    /// Add every instance when the image is itself a list.
    #[arg(long)]
    pub all: bool,

    /// Architecture to pick from a list instead of the local one.
    #[arg(long)]
    pub arch: Option<String>,

    /// Operating system to pick from a list.
    #[arg(long)]
    pub os: Option<String>,

    /// Architecture variant to pick from a list.
    #[arg(long)]
    pub variant: Option<String>,
}

/// Registry access shared by commands that talk to registries.
#[derive(Args, Debug)]
pub struct RegistryArgs {
    /// Require HTTPS for registries (false allows plain HTTP).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub tls_verify: bool,

    /// Credentials as `user:password`.
    #[arg(long)]
    pub creds: Option<String>,
}

impl Default for RegistryArgs {
    fn default() -> Self {
        Self {
            tls_verify: true,
            creds: None,
        }
    }
}

/// Arguments for `manifest create`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Name of the new list.
    pub name: String,

    /// Images to add, e.g. `docker://quay.io/podman/hello:latest`.
    pub images: Vec<String>,

    /// List media type (`oci` or `v2s2`).
    #[arg(long)]
    pub format: Option<String>,

    #[command(flatten)]
    pub platform: PlatformArgs,

    #[command(flatten)]
    pub registry: RegistryArgs,
}

/// Arguments for `manifest add`.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Name or ID of the list.
    pub list: String,

    /// Image to add.
    pub image: String,

    #[command(flatten)]
    pub platform: PlatformArgs,

    #[command(flatten)]
    pub registry: RegistryArgs,
}

/// Arguments for `manifest remove`.
#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Name or ID of the list.
    pub list: String,

    /// Digest of the instance to remove.
    pub digest: Digest,
}

/// Arguments for `manifest inspect`.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Name or ID of the list.
    pub list: String,
}

/// Arguments for `manifest push`.
#[derive(Args, Debug)]
pub struct PushArgs {
    /// Name or ID of the list.
    pub list: String,

    /// Destination, e.g. `docker://registry.example.com/app:1.0` or
    /// `dir:/tmp/app`.
    pub destination: String,

    /// Push only the instance matching the local platform.
    #[arg(long, conflicts_with = "digests")]
    pub local_only: bool,

    /// Push only these instances (repeatable).
    #[arg(long = "digest", value_name = "DIGEST")]
    pub digests: Vec<Digest>,

    /// Layer compression at the destination.
    #[arg(long)]
    pub compression_format: Option<Algorithm>,

    /// Recompress every layer to `--compression-format`.
    #[arg(long, requires = "compression_format")]
    pub force_compression: bool,

    /// Also publish each instance recompressed with this algorithm.
    #[arg(long = "add-compression", value_name = "ALGORITHM")]
    pub add_compression: Vec<Algorithm>,

    /// List media type at the destination (`oci` or `v2s2`).
    #[arg(long)]
    pub format: Option<String>,

    /// Retries after a transient failure.
    #[arg(long)]
    pub retry: Option<u32>,

    /// Fixed delay between retries, e.g. `500ms`, `3s`, `1m 30s`.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub retry_delay: Option<Duration>,

    /// Write the pushed digest to this file.
    #[arg(long)]
    pub digestfile: Option<PathBuf>,

    /// Delete the local list after a successful push.
    #[arg(long)]
    pub rm: bool,

    #[command(flatten)]
    pub registry: RegistryArgs,
}

/// Arguments for `manifest rm`.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Names or IDs of the lists to delete.
    #[arg(required = true)]
    pub lists: Vec<String>,
}

/// Executes the `manifest` command.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or the operation fails.
pub fn execute(ctx: &Context, config: &StevedoreConfig, args: ManifestArgs) -> anyhow::Result<()> {
    let store = Store::open(&config.store_root)?;
    match args.command {
        ManifestCommand::Create(args) => create(ctx, config, &store, args),
        ManifestCommand::Add(args) => add(ctx, config, &store, &args),
        ManifestCommand::Remove(args) => remove(&store, &args),
        ManifestCommand::Inspect(args) => inspect(&store, &args),
        ManifestCommand::Push(args) => push(ctx, config, &store, &args),
        ManifestCommand::Rm(args) => rm(&store, &args),
        ManifestCommand::Ls => ls(&store),
    }
}

fn create(
    ctx: &Context,
    config: &StevedoreConfig,
    store: &Store,
    args: CreateArgs,
) -> anyhow::Result<()> {
    if store.image(&args.name).is_ok() {
        anyhow::bail!("a list or image named {} already exists", args.name);
    }
    let media_type = args.format.as_deref().map(list_media_type).transpose()?;
    let sys = system_context(config, &args.registry, Some(&args.platform))?;

    let mut list = ManifestList::create();
    for image in &args.images {
        let reference = TransportReference::parse(image)?;
        let _ = list
            .add(ctx, &sys, &reference, args.platform.all)
            .with_context(|| format!("adding {image}"))?;
    }
    let id = list.save_to_image(store, None, &[args.name], media_type)?;
    println!("{id}");
    Ok(())
}

fn add(ctx: &Context, config: &StevedoreConfig, store: &Store, args: &AddArgs) -> anyhow::Result<()> {
    let reference = TransportReference::parse(&args.image)?;
    let sys = system_context(config, &args.registry, Some(&args.platform))?;

    let (id, _) = load_from_image(store, &args.list)?;
    let locker = locker_for_image(store, &id)?;
    let _guard = locker.lock()?;
    let (_, mut list) = load_from_image(store, id.as_str())?;

    let digest = list
        .add(ctx, &sys, &reference, args.platform.all)
        .with_context(|| format!("adding {}", args.image))?;
    let _ = list.save_to_image(store, Some(&id), &[], None)?;
    println!("{digest}");
    Ok(())
}

fn remove(store: &Store, args: &RemoveArgs) -> anyhow::Result<()> {
    let (id, _) = load_from_image(store, &args.list)?;
    let locker = locker_for_image(store, &id)?;
    let _guard = locker.lock()?;
    let (_, mut list) = load_from_image(store, id.as_str())?;

    list.remove(&args.digest)?;
    let _ = list.save_to_image(store, Some(&id), &[], None)?;
    println!("{id}: {}", args.digest);
    Ok(())
}

fn inspect(store: &Store, args: &InspectArgs) -> anyhow::Result<()> {
    let (_, list) = load_from_image(store, &args.list)?;
    let blob = list.serialize(None)?;
    println!("{}", String::from_utf8_lossy(&blob));
    Ok(())
}

fn push(ctx: &Context, config: &StevedoreConfig, store: &Store, args: &PushArgs) -> anyhow::Result<()> {
    let destination = TransportReference::parse(&args.destination)?;
    let (id, _) = load_from_image(store, &args.list)?;
    let locker = locker_for_image(store, &id)?;
    let _guard = locker.lock()?;
    let (_, mut list) = load_from_image(store, id.as_str())?;
    if let Some(format) = &args.format {
        list.set_media_type(Some(list_media_type(format)?))?;
    }

    let selection = if args.local_only {
        SelectionPolicy::LocalPlatformOnly
    } else if args.digests.is_empty() {
        SelectionPolicy::AllImages
    } else {
        SelectionPolicy::SpecificDigests(args.digests.clone())
    };
    let mut dest_ctx = system_context(config, &args.registry, None)?;
    dest_ctx.compression_format = args.compression_format;
    let observer: RetryObserver = Arc::new(|event: &RetryEvent| {
        eprintln!("{}", event.message());
    });
    let options = PushOptions {
        selection,
        source_ctx: system_context(config, &RegistryArgs::default(), None)?,
        dest_ctx,
        add_compression: args.add_compression.clone(),
        force_compression_format: args.force_compression,
        max_retries: args.retry.or(config.retry.max_retries),
        retry_delay: args.retry_delay.or_else(|| config.retry.retry_delay()),
        retry_observer: Some(observer),
    };

    let (_, digest) = list.push(ctx, store, &destination, &options)?;
    if let Some(path) = &args.digestfile {
        std::fs::write(path, digest.as_str())
            .with_context(|| format!("writing digest to {}", path.display()))?;
    }
    if args.rm {
        store.delete_image(&id)?;
        tracing::info!(id = %id, "removed list after push");
    }
    println!("{digest}");
    Ok(())
}

fn rm(store: &Store, args: &RmArgs) -> anyhow::Result<()> {
    let mut failed = 0usize;
    for name in &args.lists {
        match delete_list(store, name) {
            Ok(id) => println!("Deleted: {id}"),
            Err(e) => {
                eprintln!("{name}: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} of {} lists could not be removed", args.lists.len());
    }
    Ok(())
}

/// Deletes a saved list while holding its lock.
fn delete_list(store: &Store, name: &str) -> stevedore_common::error::Result<ImageId> {
    let (id, _) = load_from_image(store, name)?;
    let locker = locker_for_image(store, &id)?;
    let _guard = locker.lock()?;
    store.delete_image(&id)?;
    Ok(id)
}

fn ls(store: &Store) -> anyhow::Result<()> {
    let records: Vec<_> = store
        .images()?
        .into_iter()
        .filter(|r| r.big_data_names.iter().any(|k| k == LIST_MANIFEST_KEY))
        .collect();
    if records.is_empty() {
        println!("No manifest lists found.");
        return Ok(());
    }

    println!(
        "{:<14} {:<30} {:<10} {:<12} {:<20}",
        "LIST ID", "NAMES", "INSTANCES", "SIZE", "CREATED"
    );
    for record in &records {
        let (instances, size) = match load_from_image(store, record.id.as_str()) {
            Ok((_, list)) => (
                list.len().to_string(),
                format_bytes(list.iter().map(|i| i.size()).sum()),
            ),
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "unreadable manifest list");
                ("?".to_string(), "?".to_string())
            }
        };
        println!(
            "{:<14} {:<30} {:<10} {:<12} {:<20}",
            short_id(&record.id),
            record.names.join(","),
            instances,
            size,
            record.created_at
        );
    }
    Ok(())
}

/// Builds the transport context from configuration and flags.
fn system_context(
    config: &StevedoreConfig,
    registry: &RegistryArgs,
    platform: Option<&PlatformArgs>,
) -> anyhow::Result<SystemContext> {
    let mut sys = SystemContext {
        insecure_registries: config.insecure_registries.clone(),
        ..SystemContext::default()
    };
    if let Some(platform) = platform {
        sys.architecture_choice.clone_from(&platform.arch);
        sys.os_choice.clone_from(&platform.os);
        sys.variant_choice.clone_from(&platform.variant);
    }
    if let Some(creds) = &registry.creds {
        let (user, password) = creds
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("--creds must be user:password"))?;
        sys.registry_auth = Some((user.to_string(), password.to_string()));
    }
    sys.insecure_all = !registry.tls_verify;
    Ok(sys)
}

/// Maps a `--format` value to a list media type.
fn list_media_type(format: &str) -> anyhow::Result<&'static str> {
    match format {
        "oci" => Ok(stevedore_transport::manifest::OCI_INDEX),
        "v2s2" | "docker" => Ok(stevedore_transport::manifest::DOCKER_V2_LIST),
        other => anyhow::bail!("unknown list format {other:?} (expected oci or v2s2)"),
    }
}

fn short_id(id: &ImageId) -> &str {
    let s = id.as_str();
    s.get(..12).unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Instant;

    use clap::Parser;

    use crate::commands::{Cli, Command};

    fn push_args(extra: &[&str]) -> Result<PushArgs, clap::Error> {
        let mut argv = vec!["stevedore", "manifest", "push"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["foo", "dir:/tmp/out"]);
        let cli = Cli::try_parse_from(argv)?;
        match cli.command {
            Command::Manifest(ManifestArgs {
                command: ManifestCommand::Push(args),
            }) => Ok(args),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn retry_delay_accepts_human_durations() {
        for (text, expected) in [
            ("500ms", Duration::from_millis(500)),
            ("3s", Duration::from_secs(3)),
            ("1m 30s", Duration::from_secs(90)),
            ("2h", Duration::from_secs(7200)),
        ] {
            let args = push_args(&["--retry-delay", text]).expect("parse");
            assert_eq!(args.retry_delay, Some(expected), "{text}");
        }
        assert!(push_args(&["--retry-delay", "fast"]).is_err());
        assert!(push_args(&["--retry-delay", "99999999999999999999h"]).is_err());
    }

    #[test]
    fn delete_list_waits_for_the_list_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path()).expect("store");
        let id = ManifestList::create()
            .save_to_image(&store, None, &["foo".to_string()], None)
            .expect("save");

        let root = dir.path().to_path_buf();
        let held = id.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let holder = Store::open(&root).expect("store");
            let locker = locker_for_image(&holder, &held).expect("locker");
            let _guard = locker.lock().expect("lock");
            locked_tx.send(()).expect("signal");
            thread::sleep(Duration::from_millis(300));
        });
        locked_rx.recv().expect("lock taken");

        let start = Instant::now();
        assert_eq!(delete_list(&store, "foo").expect("delete"), id);
        assert!(start.elapsed() >= Duration::from_millis(200));
        handle.join().expect("join");
        assert!(load_from_image(&store, "foo").is_err());
    }

    #[test]
    fn list_formats_map_to_media_types() {
        assert_eq!(
            list_media_type("oci").unwrap(),
            stevedore_transport::manifest::OCI_INDEX
        );
        assert_eq!(
            list_media_type("v2s2").unwrap(),
            stevedore_transport::manifest::DOCKER_V2_LIST
        );
        assert!(list_media_type("tar").is_err());
    }

    #[test]
    fn credentials_must_have_a_password() {
        let config = StevedoreConfig::default();
        let registry = RegistryArgs {
            tls_verify: true,
            creds: Some("user".into()),
        };
        assert!(system_context(&config, &registry, None).is_err());
    }
}
