//! Plugin configuration
//!
//! Loaded once at startup and handed to the [`PluginHost`](crate::host::PluginHost).
//! Lookup order: `$MAYAUSD_CONFIG`, then `<config dir>/mayausd/config.json`,
//! then built-in defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "MAYAUSD_CONFIG";

/// Runtime settings for the proxy-stage core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MayaUsdConfig {
    /// Maximum number of time codes kept in each proxy shape's bounding-box
    /// cache. `None` keeps every sampled time code.
    pub bounding_box_cache_capacity: Option<usize>,
    /// Refuse (instead of skipping) a pull that re-enters a node already
    /// being evaluated.
    pub reject_reentrant_compute: bool,
    /// Default value of the `shareStage` plug on new proxy shapes
    pub share_stages: bool,
    /// `env_logger` filter used by [`crate::init_logging`]
    pub log_filter: String,
}

impl Default for MayaUsdConfig {
    fn default() -> Self {
        Self {
            bounding_box_cache_capacity: Some(1024),
            reject_reentrant_compute: false,
            share_stages: true,
            log_filter: "info".to_string(),
        }
    }
}

impl MayaUsdConfig {
    /// Default config file location in the user's config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mayausd").join("config.json"))
    }

    /// Load from the environment override or the default location.
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load_from(Path::new(&path));
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse a JSON document; absent keys keep their defaults
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}
