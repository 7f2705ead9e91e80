//! Config module - Manages markerwatch configuration (markerwatch.toml).
//!
//! Configuration file contains:
//! - Watched root path
//! - Index database path
//! - Reconciliation interval

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineError;

/// Main markerwatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config version (for future migrations)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory whose children are tracked
    #[serde(default)]
    pub root_path: Option<PathBuf>,

    /// SQLite index file
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// Seconds between orphan sweeps
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

fn default_version() -> u32 {
    1
}

fn default_reconcile_interval_secs() -> u64 {
    600
}

/// Default index path (~/.local/share/markerwatch/directories.db on Linux).
pub fn default_index_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("markerwatch")
        .join("directories.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            root_path: None,
            index_path: default_index_path(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

/// Get default config directory.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("markerwatch")
}

/// Get default config file path.
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("markerwatch.toml")
}

impl Config {
    /// Create new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config for a specific watched root.
    pub fn with_root_path(root_path: PathBuf) -> Self {
        Self {
            root_path: Some(root_path),
            ..Self::default()
        }
    }

    /// Load config from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Cannot parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load config from default path.
    pub fn load_default() -> Result<Self> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).with_context(|| "Cannot serialize config to TOML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Cannot write config file: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Save config to default path.
    pub fn save_default(&self) -> Result<PathBuf> {
        let path = default_config_path();
        self.save(&path)?;
        Ok(path)
    }

    /// The watched root, or `RootNotConfigured`.
    pub fn root(&self) -> Result<&Path> {
        self.root_path
            .as_deref()
            .ok_or_else(|| EngineError::RootNotConfigured.into())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.root()?;
        if self.reconcile_interval_secs == 0 {
            return Err(EngineError::InvalidInterval(self.reconcile_interval()).into());
        }
        Ok(())
    }
}
