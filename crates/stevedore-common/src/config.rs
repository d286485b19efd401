//! Global configuration model for Stevedore.
//!
//! The configuration is a JSON document; every field has a default so an
//! empty object (or a missing file) yields a working setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, StevedoreError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StevedoreConfig {
    /// Base directory for Stevedore state and data.
    pub data_dir: PathBuf,
    /// Root directory of the content store.
    pub store_root: PathBuf,
    /// Registries contacted over plain HTTP instead of HTTPS.
    pub insecure_registries: Vec<String>,
    /// Push retry settings.
    pub retry: RetryConfig,
    /// Container network settings.
    pub network: NetworkConfig,
}

impl Default for StevedoreConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::data_dir().clone(),
            store_root: constants::default_store_root(),
            insecure_registries: Vec::new(),
            retry: RetryConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl StevedoreConfig {
    /// Loads the configuration from `path`, returning defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| StevedoreError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `StevedoreError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.network.default_network.is_empty() {
            return Err(StevedoreError::Config {
                message: "network.default_network must not be empty".into(),
            });
        }
        if self.network.cni_plugin_dirs.is_empty() {
            return Err(StevedoreError::Config {
                message: "network.cni_plugin_dirs must list at least one directory".into(),
            });
        }
        Ok(())
    }
}

/// Retry settings applied to pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries; `None` uses the built-in default.
    pub max_retries: Option<u32>,
    /// Fixed delay between retries in milliseconds; `None` uses
    /// exponential backoff starting at one second.
    pub retry_delay_ms: Option<u64>,
}

impl RetryConfig {
    /// Returns the configured delay as a [`Duration`].
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_ms.map(Duration::from_millis)
    }
}

/// CNI network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Directory holding `*.conflist` files.
    pub cni_config_dir: PathBuf,
    /// Directories searched for plugin binaries.
    pub cni_plugin_dirs: Vec<PathBuf>,
    /// Name of the default network.
    pub default_network: String,
    /// Subnet of the default network.
    pub default_subnet: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cni_config_dir: constants::default_cni_config_dir(),
            cni_plugin_dirs: constants::DEFAULT_CNI_PLUGIN_DIRS
                .iter()
                .map(PathBuf::from)
                .collect(),
            default_network: constants::DEFAULT_NETWORK_NAME.to_string(),
            default_subnet: constants::DEFAULT_SUBNET.to_string(),
        }
    }
}
