//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

/// Default base directory for Stevedore data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/stevedore";

/// Returns the data directory, preferring `$HOME/.stevedore` for non-root
/// or non-Linux environments, falling back to `/var/lib/stevedore`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        let user_dir = PathBuf::from(home).join(".stevedore");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Returns the default content store root.
pub fn default_store_root() -> PathBuf {
    data_dir().join("storage")
}

/// Returns the default directory holding CNI network configuration lists.
pub fn default_cni_config_dir() -> PathBuf {
    data_dir().join("cni").join("net.d")
}

/// Directories searched for CNI plugin binaries.
pub const DEFAULT_CNI_PLUGIN_DIRS: &[&str] = &[
    "/usr/local/libexec/cni",
    "/usr/libexec/cni",
    "/usr/local/lib/cni",
    "/usr/lib/cni",
    "/opt/cni/bin",
];

/// Name of the network used when a container does not request one.
pub const DEFAULT_NETWORK_NAME: &str = "podman";

/// Subnet of the default bridge network.
pub const DEFAULT_SUBNET: &str = "10.88.0.0/16";

/// CNI specification version written into new configuration lists.
pub const CNI_VERSION: &str = "1.0.0";

/// Number of times a push is retried when no explicit count is given.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay before the first retry; doubled for each later attempt when
/// no explicit delay is configured.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Store key holding the serialized manifest list of a list image.
pub const LIST_MANIFEST_KEY: &str = "manifest";

/// Store key prefix for digest-addressed copies of stored manifests.
pub const DIGEST_MANIFEST_KEY_PREFIX: &str = "manifest-";

/// Store key holding the per-instance source references of a list image.
pub const INSTANCES_DATA_KEY: &str = "instances.json";

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "stevedore";
