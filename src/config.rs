//! Configuration types for the session coordination layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, SyncError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub timer: TimerConfig,
    pub presence: PresenceConfig,
    pub health: HealthConfig,
    pub timeouts: TimeoutConfig,
    pub recovery: RecoveryConfig,
    pub storage: StorageConfig,
    pub broadcast: BroadcastConfig,
}

/// Active timer behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Display tick period while a timer runs.
    pub tick_interval_ms: u64,
    /// Longest accepted timer label, in characters.
    pub max_label_len: usize,
    /// IANA timezone recorded with new timers.
    pub timezone: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_label_len: 200,
            timezone: "UTC".to_owned(),
        }
    }
}

/// Presence roster timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_interval_secs: u64,
    /// Entries whose last activity is older than this are evicted.
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            stale_after_secs: 30,
            sweep_interval_secs: 10,
        }
    }
}

/// Liveness probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3000,
        }
    }
}

/// Budgets for the query and mutation I/O classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub query_ms: u64,
    pub mutation_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            query_ms: 8000,
            mutation_ms: 15000,
        }
    }
}

/// Dormancy recovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Hidden periods shorter than this never trigger recovery.
    pub min_dormancy_ms: u64,
    /// Visibility events are coalesced over this window.
    pub debounce_ms: u64,
    /// Attempts at the auth refresh before confidence drops to unknown.
    pub auth_retry_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_dormancy_ms: 2000,
            debounce_ms: 50,
            auth_retry_attempts: 2,
        }
    }
}

/// Local snapshot storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub snapshot_key: String,
    /// Directory for file-backed snapshots. `None` uses the data directory.
    pub dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_key: "trackline.active_timer".to_owned(),
            dir: None,
        }
    }
}

impl StorageConfig {
    /// Resolved snapshot directory.
    pub fn effective_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(crate::trackline_dirs::storage_dir)
    }
}

/// Same-process broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub channel: String,
    pub capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel: "trackline-timer".to_owned(),
            capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| SyncError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config_dir>/config.toml`.
    pub fn default_config_path() -> PathBuf {
        crate::trackline_dirs::config_file()
    }
}
