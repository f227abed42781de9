//! Configuration types for the updater.

use crate::app_dirs;
use crate::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level updater configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Release feed settings.
    pub feed: FeedConfig,
    /// Filesystem layout.
    pub paths: PathsConfig,
    /// Restart countdown settings.
    pub restart: RestartConfig,
    /// Backup retention.
    pub backup: BackupConfig,
    /// Update policy.
    pub update: UpdatePolicyConfig,
}

/// Release feed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// URL of the "latest release" JSON document.
    pub endpoint: String,
    /// User-Agent sent with feed and download requests.
    pub user_agent: String,
    /// Asset name prefix; only assets starting with it are considered.
    pub asset_prefix: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.github.com/repos/updraft-rs/updraft/releases/latest".to_owned(),
            user_agent: format!("updraft/{} (self-update)", env!("CARGO_PKG_VERSION")),
            asset_prefix: String::new(),
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Live install directory. `None` means the directory of the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,
    /// Download staging directory.
    pub cache_dir: PathBuf,
    /// Binary and database backups.
    pub backup_dir: PathBuf,
    /// External migration JSON files.
    pub migrations_dir: PathBuf,
    /// SQLite database holding application data and the schema ledger.
    pub database: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            install_dir: None,
            cache_dir: app_dirs::downloads_dir(),
            backup_dir: app_dirs::backup_dir(),
            migrations_dir: app_dirs::migrations_dir(),
            database: app_dirs::database_file(),
        }
    }
}

impl PathsConfig {
    /// Resolve the install directory, falling back to the executable's parent.
    ///
    /// # Errors
    ///
    /// Returns an error if no install dir is configured and the current
    /// executable path cannot be determined.
    pub fn resolve_install_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.install_dir {
            return Ok(dir.clone());
        }
        let exe = std::env::current_exe()
            .map_err(|e| UpdateError::Io(format!("cannot determine current executable: {e}")))?;
        exe.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| UpdateError::Io(format!("{} has no parent dir", exe.display())))
    }
}

/// Restart countdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Delay used when a request asks for zero or negative seconds.
    pub default_delay_secs: u64,
    /// Upper bound on any requested delay.
    pub max_delay_secs: u64,
    /// Cancellation is refused once this many seconds or fewer remain.
    pub grace_secs: u64,
    /// Length of one countdown tick in milliseconds.
    pub tick_millis: u64,
    /// Delay after installing a critical release.
    pub critical_delay_secs: u64,
    /// Delay after installing a regular release.
    pub normal_delay_secs: u64,
    /// Pause between spawning the replacement process and exiting.
    pub handoff_grace_millis: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            default_delay_secs: 10,
            max_delay_secs: 300,
            grace_secs: 5,
            tick_millis: 1_000,
            critical_delay_secs: 5,
            normal_delay_secs: 30,
            handoff_grace_millis: 2_000,
        }
    }
}

/// Backup retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Artifacts kept per kind; older ones are pruned.
    pub keep: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { keep: 5 }
    }
}

/// Update policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePolicyConfig {
    /// Initial value of the persisted auto-update switch.
    pub auto_update: bool,
    /// Seconds between background feed checks.
    pub check_interval_secs: u64,
}

impl Default for UpdatePolicyConfig {
    fn default() -> Self {
        Self {
            auto_update: false,
            check_interval_secs: 3_600,
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        app_dirs::config_file()
    }

    /// Point every path at a single root; used by tests and portable installs.
    #[must_use]
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Self::default();
        config.paths = PathsConfig {
            install_dir: Some(root.join("app")),
            cache_dir: root.join("cache"),
            backup_dir: root.join("backup"),
            migrations_dir: root.join("migrations"),
            database: root.join("updraft.db"),
        };
        config
    }
}
