//! Ordered, transactional schema migrations.
//!
//! Each record is applied in its own transaction: up script plus ledger row
//! commit together or not at all. A failure stops the batch, so the ledger
//! is always consistent up to the last committed record and later records
//! are never attempted.
//!
//! Down scripts are best-effort. Records without one are skipped during
//! rollback and their schema changes stay in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{OptionalExtension, Transaction, params};
use serde::Serialize;

use super::record::{self, MigrationRecord};
use super::schema::{
    BOOTSTRAP_VERSION, DELETE_LEDGER_ROW, INSERT_BACKUP_ROW, INSERT_LEDGER_ROW, LEDGER_TABLE,
    SCHEMA_FLOOR, SELECT_LEDGER,
};
use crate::backup::{BackupArtifact, BackupVault};
use crate::db::Database;
use crate::error::{Result, UpdateError};
use crate::version::{compare_versions, is_newer};

/// One committed ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaHistoryEntry {
    pub version: String,
    pub name: String,
    pub description: String,
    pub applied_at: String,
    pub checksum: String,
}

/// Summary of a pending migration.
#[derive(Debug, Clone, Serialize)]
pub struct PendingMigration {
    pub version: String,
    pub name: String,
    pub description: String,
    pub is_critical: bool,
}

/// Migration status as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub current_version: String,
    pub pending_count: usize,
    pub total_count: usize,
    pub needs_migration: bool,
    pub pending_details: Vec<PendingMigration>,
}

/// Emitted before each record in a batch is applied.
#[derive(Debug, Clone)]
pub struct MigrationStep {
    /// 1-based position in the batch.
    pub index: usize,
    /// Batch size.
    pub total: usize,
    pub version: String,
    pub name: String,
}

/// Applies and reverts [`MigrationRecord`]s against a [`Database`].
///
/// The engine is the only writer of `schema_migrations` rows. Records from
/// the migrations directory are re-read on every call, so files dropped in
/// while the process runs are picked up by the next status or apply.
pub struct MigrationEngine {
    db: Arc<Database>,
    builtin: Vec<MigrationRecord>,
    migrations_dir: Option<PathBuf>,
    backups: Option<Arc<BackupVault>>,
}

impl MigrationEngine {
    /// Engine knowing only the built-in bootstrap record.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            builtin: vec![MigrationRecord::bootstrap()],
            migrations_dir: None,
            backups: None,
        }
    }

    /// Add in-process records alongside the bootstrap record.
    #[must_use]
    pub fn with_records(mut self, records: impl IntoIterator<Item = MigrationRecord>) -> Self {
        self.builtin.extend(records);
        record::sort_records(&mut self.builtin);
        self
    }

    /// Read external records from `dir` on every call, and write new
    /// templates there.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` exists but cannot be listed.
    pub fn with_migrations_dir(mut self, dir: &Path) -> Result<Self> {
        let loaded = record::load_dir(dir)?;
        tracing::info!(dir = %dir.display(), count = loaded.len(), "found migration files");
        self.migrations_dir = Some(dir.to_path_buf());
        Ok(self)
    }

    /// Attach a vault for pre-migration and pre-rollback snapshots.
    #[must_use]
    pub fn with_backups(mut self, vault: Arc<BackupVault>) -> Self {
        self.backups = Some(vault);
        self
    }

    /// All known records, ascending: built-in ones plus whatever the
    /// migrations directory holds right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the migrations directory cannot be listed.
    pub fn records(&self) -> Result<Vec<MigrationRecord>> {
        let mut records = self.builtin.clone();
        if let Some(dir) = &self.migrations_dir {
            records.extend(record::load_dir(dir)?);
            record::sort_records(&mut records);
        }
        Ok(records)
    }

    /// Committed ledger rows, ascending by version. Empty before bootstrap.
    ///
    /// # Errors
    ///
    /// Returns a database error if the ledger cannot be read.
    pub fn applied(&self) -> Result<Vec<SchemaHistoryEntry>> {
        if !self.db.table_exists(LEDGER_TABLE)? {
            return Ok(Vec::new());
        }
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(SELECT_LEDGER)?;
        let rows = stmt.query_map([], |row| {
            Ok(SchemaHistoryEntry {
                version: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                applied_at: row.get(3)?,
                checksum: row.get(4)?,
            })
        })?;
        let mut entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        entries.sort_by(|a, b| compare_versions(&a.version, &b.version));
        Ok(entries)
    }

    /// Highest applied version, or `0.0.0` if nothing is applied.
    ///
    /// Computed with [`compare_versions`] rather than SQL `MAX`, which would
    /// order `1.10.0` before `1.9.0`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the ledger cannot be read.
    pub fn current_version(&self) -> Result<String> {
        Ok(self
            .applied()?
            .into_iter()
            .map(|e| e.version)
            .max_by(|a, b| compare_versions(a, b))
            .unwrap_or_else(|| SCHEMA_FLOOR.to_owned()))
    }

    /// Records newer than the current version, ascending.
    ///
    /// # Errors
    ///
    /// Returns a database error if the ledger cannot be read.
    pub fn pending(&self) -> Result<Vec<MigrationRecord>> {
        let current = self.current_version()?;
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| is_newer(&r.version, &current))
            .collect())
    }

    /// Apply every pending record in ascending order.
    ///
    /// `on_step` is called before each record. Returns the versions applied.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Migration`] naming the first record that
    /// failed. Records before it stay committed; records after it are not
    /// attempted.
    pub fn apply_pending<F>(&self, mut on_step: F) -> Result<Vec<String>>
    where
        F: FnMut(&MigrationStep),
    {
        let pending = self.pending()?;
        let total = pending.len();
        if total == 0 {
            tracing::debug!("schema is up to date");
            return Ok(Vec::new());
        }

        tracing::info!(count = total, "applying pending migrations");
        let mut applied = Vec::with_capacity(total);
        for (i, record) in pending.iter().enumerate() {
            on_step(&MigrationStep {
                index: i + 1,
                total,
                version: record.version.clone(),
                name: record.name.clone(),
            });
            if self.apply_record(record)? {
                applied.push(record.version.clone());
            }
        }
        Ok(applied)
    }

    /// Apply one known record by version, optionally snapshotting first.
    ///
    /// Returns `false` if the record was already applied.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Conflict`] for an unknown version and
    /// [`UpdateError::Migration`] if the record is invalid or its SQL fails.
    pub fn apply_version(&self, version: &str, auto_backup: bool) -> Result<bool> {
        let record = self
            .records()?
            .into_iter()
            .find(|r| compare_versions(&r.version, version).is_eq())
            .ok_or_else(|| UpdateError::Conflict(format!("unknown migration version {version}")))?;

        if self.is_applied(&record.version)? {
            tracing::info!(version = %record.version, "migration already applied, skipping");
            return Ok(false);
        }
        if auto_backup {
            self.snapshot(&format!("pre-{}", record.version));
        }
        self.apply_record(&record)
    }

    /// Revert applied records in `(target, current]`, newest first.
    ///
    /// Returns the versions whose ledger rows were removed. Records without
    /// a down script are skipped and keep their ledger row.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Conflict`] if `target` is not below the current
    /// version or is below the bootstrap version, and
    /// [`UpdateError::Migration`] for the first down script that fails.
    /// Lower versions are then left in place.
    pub fn rollback_to(&self, target: &str) -> Result<Vec<String>> {
        let current = self.current_version()?;
        if !is_newer(&current, target) {
            return Err(UpdateError::Conflict(format!(
                "rollback target {target} must be below current schema version {current}"
            )));
        }
        if is_newer(BOOTSTRAP_VERSION, target) {
            return Err(UpdateError::Conflict(format!(
                "rollback target {target} is below the bootstrap version {BOOTSTRAP_VERSION}"
            )));
        }

        let mut to_revert: Vec<SchemaHistoryEntry> = self
            .applied()?
            .into_iter()
            .filter(|e| is_newer(&e.version, target) && !is_newer(&e.version, &current))
            .collect();
        to_revert.sort_by(|a, b| compare_versions(&b.version, &a.version));

        self.snapshot(&format!("pre-rollback-{target}"));

        let records = self.records()?;
        let mut reverted = Vec::new();
        for entry in to_revert {
            let Some(record) = records
                .iter()
                .find(|r| compare_versions(&r.version, &entry.version).is_eq())
            else {
                tracing::warn!(version = %entry.version, "no record for applied version, skipping");
                continue;
            };
            if !record.is_reversible() {
                tracing::warn!(version = %record.version, "migration has no down script, skipping");
                continue;
            }
            self.revert_record(record, &entry.version)?;
            reverted.push(entry.version);
        }
        tracing::info!(target, reverted = reverted.len(), "rollback finished");
        Ok(reverted)
    }

    /// Status summary for operators.
    ///
    /// # Errors
    ///
    /// Returns a database error if the ledger cannot be read.
    pub fn status(&self) -> Result<MigrationStatus> {
        let current_version = self.current_version()?;
        let records = self.records()?;
        let pending: Vec<MigrationRecord> = records
            .iter()
            .filter(|r| is_newer(&r.version, &current_version))
            .cloned()
            .collect();
        Ok(MigrationStatus {
            current_version,
            pending_count: pending.len(),
            total_count: records.len(),
            needs_migration: !pending.is_empty(),
            pending_details: pending
                .into_iter()
                .map(|r| PendingMigration {
                    version: r.version,
                    name: r.name,
                    description: r.description,
                    is_critical: r.is_critical,
                })
                .collect(),
        })
    }

    /// Write a new migration template into the migrations directory.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] if no migrations directory is set, or
    /// the error from writing the file.
    pub fn create_migration_file(
        &self,
        version: &str,
        name: &str,
        description: &str,
    ) -> Result<PathBuf> {
        let dir = self
            .migrations_dir
            .as_deref()
            .ok_or_else(|| UpdateError::Config("no migrations directory configured".into()))?;
        record::write_template(dir, version, name, description)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn is_applied(&self, version: &str) -> Result<bool> {
        Ok(self
            .applied()?
            .iter()
            .any(|e| compare_versions(&e.version, version).is_eq()))
    }

    /// Returns `false` if the ledger already had the row.
    fn apply_record(&self, record: &MigrationRecord) -> Result<bool> {
        record.validate()?;
        let fail = |message: String| UpdateError::Migration {
            version: record.version.clone(),
            message,
        };

        tracing::info!(version = %record.version, name = %record.name, "applying migration");
        let applied = self
            .db
            .transaction(|tx| {
                if ledger_has(tx, &record.version)? {
                    return Ok(false);
                }
                tx.execute_batch(&record.up_sql)
                    .map_err(|e| fail(e.to_string()))?;
                tx.execute(
                    INSERT_LEDGER_ROW,
                    params![
                        record.version,
                        record.name,
                        record.description,
                        chrono::Utc::now().to_rfc3339(),
                        record.checksum(),
                    ],
                )
                .map_err(|e| fail(format!("ledger insert: {e}")))?;
                Ok(true)
            })
            .map_err(|e| match e {
                UpdateError::Database(message) => fail(message),
                other => other,
            })?;

        if applied {
            tracing::info!(version = %record.version, "migration committed");
        } else {
            tracing::info!(version = %record.version, "migration already in ledger, skipped");
        }
        Ok(applied)
    }

    fn revert_record(&self, record: &MigrationRecord, ledger_version: &str) -> Result<()> {
        let fail = |message: String| UpdateError::Migration {
            version: record.version.clone(),
            message,
        };

        tracing::info!(version = %record.version, name = %record.name, "reverting migration");
        self.db
            .transaction(|tx| {
                tx.execute_batch(&record.down_sql)
                    .map_err(|e| fail(e.to_string()))?;
                tx.execute(DELETE_LEDGER_ROW, params![ledger_version])
                    .map_err(|e| fail(format!("ledger delete: {e}")))?;
                Ok(())
            })
            .map_err(|e| match e {
                UpdateError::Database(message) => fail(message),
                other => other,
            })
    }

    /// Best-effort schema snapshot; failure is logged and ignored.
    fn snapshot(&self, label: &str) -> Option<BackupArtifact> {
        let vault = self.backups.as_ref()?;
        match vault.backup_database(label) {
            Ok(artifact) => {
                self.record_backup(label, &artifact.path);
                Some(artifact)
            }
            Err(e) => {
                tracing::warn!(label, error = %e, "database snapshot failed, continuing");
                None
            }
        }
    }

    fn record_backup(&self, label: &str, path: &Path) {
        let result = self.db.table_exists("migration_backups").and_then(|exists| {
            if exists {
                let conn = self.db.lock()?;
                conn.execute(INSERT_BACKUP_ROW, params![label, path.display().to_string()])?;
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to index database snapshot");
        }
    }
}

fn ledger_has(tx: &Transaction<'_>, version: &str) -> Result<bool> {
    let table: Option<String> = tx
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![LEDGER_TABLE],
            |row| row.get(0),
        )
        .optional()?;
    if table.is_none() {
        return Ok(false);
    }
    let mut stmt = tx.prepare("SELECT version FROM schema_migrations")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions
        .iter()
        .any(|v| compare_versions(v, version).is_eq()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
