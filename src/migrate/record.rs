//! Migration records and the external record directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::schema::{BOOTSTRAP_DOWN_SQL, BOOTSTRAP_UP_SQL, BOOTSTRAP_VERSION};
use crate::error::{Result, UpdateError};
use crate::version::compare_versions;

/// One versioned pair of forward/backward schema scripts.
///
/// Identity is `version`. Records are append-only: once shipped, a version's
/// scripts never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Dotted version string, unique across all records.
    pub version: String,
    /// Short identifier, used in file names.
    pub name: String,
    /// Human-readable description stored in the ledger.
    #[serde(default)]
    pub description: String,
    /// Forward script.
    #[serde(default)]
    pub up_sql: String,
    /// Backward script. Empty means the migration cannot be reverted.
    #[serde(default)]
    pub down_sql: String,
    /// Author of the record.
    #[serde(default)]
    pub author: String,
    /// Creation timestamp (RFC 3339), informational.
    #[serde(default)]
    pub created_at: String,
    /// Critical migrations are flagged in status output.
    #[serde(default)]
    pub is_critical: bool,
}

impl MigrationRecord {
    /// The built-in record that creates the schema ledger.
    pub fn bootstrap() -> Self {
        Self {
            version: BOOTSTRAP_VERSION.to_owned(),
            name: "init_migration_system".to_owned(),
            description: "Create the schema history ledger".to_owned(),
            up_sql: BOOTSTRAP_UP_SQL.to_owned(),
            down_sql: BOOTSTRAP_DOWN_SQL.to_owned(),
            author: "updraft".to_owned(),
            created_at: "2024-01-01T00:00:00Z".to_owned(),
            is_critical: true,
        }
    }

    /// Hex SHA-256 of `up_sql`, stored in the ledger's `checksum` column.
    pub fn checksum(&self) -> String {
        let digest = Sha256::digest(self.up_sql.as_bytes());
        format!("{digest:x}")
    }

    /// Returns `true` if a non-blank down script exists.
    pub fn is_reversible(&self) -> bool {
        !self.down_sql.trim().is_empty()
    }

    /// A record must carry at least one script.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Migration`] if both scripts are blank or the
    /// version is empty.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(UpdateError::Migration {
                version: self.version.clone(),
                message: "migration version is empty".to_owned(),
            });
        }
        if self.up_sql.trim().is_empty() && self.down_sql.trim().is_empty() {
            return Err(UpdateError::Migration {
                version: self.version.clone(),
                message: "migration has neither up nor down SQL".to_owned(),
            });
        }
        Ok(())
    }

    /// File name used by [`write_template`]: `1_2_0_add_users.json`.
    pub fn file_name(&self) -> String {
        format!("{}_{}.json", self.version.replace('.', "_"), self.name)
    }
}

/// Sort records ascending by version and drop later duplicates.
pub fn sort_records(records: &mut Vec<MigrationRecord>) {
    records.sort_by(|a, b| compare_versions(&a.version, &b.version));
    records.dedup_by(|later, earlier| {
        let duplicate = compare_versions(&later.version, &earlier.version).is_eq();
        if duplicate {
            tracing::warn!(
                version = %later.version,
                kept = %earlier.name,
                dropped = %later.name,
                "duplicate migration version, keeping the first"
            );
        }
        duplicate
    });
}

/// Load every `*.json` record in `dir`.
///
/// A missing directory yields no records. Files that cannot be read or
/// parsed are logged and skipped so one bad file does not block the rest.
///
/// # Errors
///
/// Returns an error only if the directory exists but cannot be listed.
pub fn load_dir(dir: &Path) -> Result<Vec<MigrationRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        match load_file(&path) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping migration file");
            }
        }
    }
    Ok(records)
}

fn load_file(path: &Path) -> Result<MigrationRecord> {
    let text = std::fs::read_to_string(path)?;
    let record: MigrationRecord = serde_json::from_str(&text)
        .map_err(|e| UpdateError::Config(format!("{}: {e}", path.display())))?;
    record.validate()?;
    Ok(record)
}

/// Write an empty template for a new migration into `dir`.
///
/// # Errors
///
/// Returns an error if the file already exists or cannot be written.
pub fn write_template(dir: &Path, version: &str, name: &str, description: &str) -> Result<PathBuf> {
    let record = MigrationRecord {
        version: version.to_owned(),
        name: name.to_owned(),
        description: description.to_owned(),
        up_sql: "-- forward SQL".to_owned(),
        down_sql: "-- backward SQL".to_owned(),
        author: std::env::var("USER").unwrap_or_default(),
        created_at: chrono::Utc::now().to_rfc3339(),
        is_critical: false,
    };

    std::fs::create_dir_all(dir)?;
    let path = dir.join(record.file_name());
    if path.exists() {
        return Err(UpdateError::Conflict(format!(
            "migration file {} already exists",
            path.display()
        )));
    }
    let json = serde_json::to_string_pretty(&record)
        .map_err(|e| UpdateError::Io(format!("serialize migration: {e}")))?;
    std::fs::write(&path, json)?;
    tracing::info!(path = %path.display(), version, "migration template written");
    Ok(path)
}
