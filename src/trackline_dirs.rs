//! Filesystem locations used by trackline.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data | `~/Library/Application Support/trackline/` | `~/.local/share/trackline/` |
//! | Config | `~/Library/Application Support/trackline/` | `~/.config/trackline/` |
//!
//! Overrides for tests and custom deployments:
//! - `TRACKLINE_DATA_DIR` overrides [`data_dir`]
//! - `TRACKLINE_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root.
///
/// Resolves to `dirs::data_dir()/trackline/` unless `TRACKLINE_DATA_DIR` is set.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TRACKLINE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("trackline"))
        .unwrap_or_else(|| PathBuf::from("/tmp/trackline-data"))
}

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/trackline/` unless `TRACKLINE_CONFIG_DIR`
/// is set.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TRACKLINE_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("trackline"))
        .unwrap_or_else(|| PathBuf::from("/tmp/trackline-config"))
}

/// Main config file (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// File-backed timer snapshots (`data_dir()/storage/`).
#[must_use]
pub fn storage_dir() -> PathBuf {
    data_dir().join("storage")
}
