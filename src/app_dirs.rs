//! Centralized directory paths for the updater.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data | `~/Library/Application Support/updraft/` | `~/.local/share/updraft/` |
//! | Config | `~/Library/Application Support/updraft/` | `~/.config/updraft/` |
//! | Cache | `~/Library/Caches/updraft/` | `~/.cache/updraft/` |
//!
//! # Environment Overrides
//!
//! - `UPDRAFT_DATA_DIR` overrides [`data_dir`]
//! - `UPDRAFT_CONFIG_DIR` overrides [`config_dir`]
//! - `UPDRAFT_CACHE_DIR` overrides [`cache_dir`]

use std::path::PathBuf;

/// Application data root: database, backups, logs.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| PathBuf::from("/tmp/updraft-data"))
}

/// Directory holding `config.toml`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| PathBuf::from("/tmp/updraft-config"))
}

/// Expendable cache: downloaded packages and quarantine directories.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDRAFT_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("updraft"))
        .unwrap_or_else(|| PathBuf::from("/tmp/updraft-cache"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Binary and database backups (`data_dir()/backup/`).
#[must_use]
pub fn backup_dir() -> PathBuf {
    data_dir().join("backup")
}

/// External migration records (`data_dir()/migrations/`).
#[must_use]
pub fn migrations_dir() -> PathBuf {
    data_dir().join("migrations")
}

/// Default database path (`data_dir()/updraft.db`).
#[must_use]
pub fn database_file() -> PathBuf {
    data_dir().join("updraft.db")
}

/// Download staging (`cache_dir()/downloads/`).
#[must_use]
pub fn downloads_dir() -> PathBuf {
    cache_dir().join("downloads")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
