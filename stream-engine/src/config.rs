//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the recording engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root under which `recordings/` and `manifests/` live.
    pub storage_root: PathBuf,
    /// Catalog database file. Defaults to `<storage_root>/nvr.db`.
    pub db_path: PathBuf,
    /// Seconds between retention passes (default: 3600).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Grace period for workers on shutdown (default: 10).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// First reconnect delay after a source failure (default: 1).
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_secs: u64,
    /// Reconnect delay ceiling (default: 30).
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    /// Read errors tolerated inside the burst window before the worker
    /// drops the connection (default: 20).
    #[serde(default = "default_error_burst_max")]
    pub error_burst_max: u32,
    /// Burst window in seconds (default: 10).
    #[serde(default = "default_error_burst_window")]
    pub error_burst_window_secs: u64,
    /// Fallback maximum segment age in days for streams without their own
    /// policy. Zero disables the age rule (default: 30).
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Fallback per-stream storage quota in megabytes. Zero means unlimited.
    #[serde(default)]
    pub max_storage_mb: u64,
    /// Emergency floor: once the filesystem holding the storage root climbs
    /// past this usage percentage, the cleaner frees oldest segments
    /// regardless of per-stream policy. Zero disables (default: 90).
    #[serde(default = "default_disk_reserve")]
    pub disk_reserve_percent: u8,
}

fn default_cleanup_interval() -> u64 {
    3600
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_backoff_initial() -> u64 {
    1
}
fn default_backoff_max() -> u64 {
    30
}
fn default_error_burst_max() -> u32 {
    20
}
fn default_error_burst_window() -> u64 {
    10
}
fn default_retention_days() -> u32 {
    30
}
fn default_disk_reserve() -> u8 {
    90
}

impl EngineConfig {
    /// Config rooted at `storage_root` with defaults for everything else.
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        let db_path = storage_root.join("nvr.db");
        Self {
            storage_root,
            db_path,
            cleanup_interval_secs: default_cleanup_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            backoff_initial_secs: default_backoff_initial(),
            backoff_max_secs: default_backoff_max(),
            error_burst_max: default_error_burst_max(),
            error_burst_window_secs: default_error_burst_window(),
            retention_days: default_retention_days(),
            max_storage_mb: 0,
            disk_reserve_percent: default_disk_reserve(),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
