//! SQLite database handle shared by the migration engine, backup vault,
//! and restart coordinator.
//!
//! Thread-safe via an internal `Mutex<Connection>`. Writes are serialized;
//! WAL mode lets external readers proceed while a migration runs.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::error::{Result, UpdateError};

/// Key/value settings table plus the history tables the updater owns.
///
/// The schema ledger is *not* created here: the bootstrap migration owns it.
const SUPPORT_SQL: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS system_config (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS update_history (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id   TEXT NOT NULL,
    from_version TEXT NOT NULL,
    to_version   TEXT NOT NULL,
    status       TEXT NOT NULL,
    message      TEXT NOT NULL DEFAULT '',
    finished_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS restart_history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    planned_at TEXT NOT NULL,
    fired_at   TEXT NOT NULL,
    reason     TEXT NOT NULL,
    version    TEXT NOT NULL,
    platform   TEXT NOT NULL
);
"#;

/// Handle to the application database.
pub struct Database {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the database cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SUPPORT_SQL)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database (tests and dry runs).
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SUPPORT_SQL)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    /// Path of the backing file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| UpdateError::Database(format!("database lock poisoned: {e}")))
    }

    /// Execute one or more `;`-separated statements outside a transaction.
    ///
    /// # Errors
    ///
    /// Returns the SQLite error if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. The closure's
    /// error is returned unchanged so callers keep their own error kind.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a database error if begin/commit fails.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Read a `system_config` value.
    ///
    /// # Errors
    ///
    /// Returns a database error if the query fails.
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM system_config WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Upsert a `system_config` value.
    ///
    /// # Errors
    ///
    /// Returns a database error if the write fails.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO system_config (key, value, updated_at) VALUES (?1, ?2, datetime('now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    /// Write a consistent copy of the database to `dest` using `VACUUM INTO`.
    ///
    /// # Errors
    ///
    /// Returns an error if `dest` already exists or `VACUUM INTO` fails.
    pub fn backup_to(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(UpdateError::Io(format!(
                "backup target {} already exists",
                dest.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // VACUUM INTO does not support parameter binding; the path is
        // generated internally, so escaping quotes is enough.
        let escaped = dest.display().to_string().replace('\'', "''");
        let conn = self.lock()?;
        conn.execute_batch(&format!("VACUUM INTO '{escaped}'"))?;
        Ok(())
    }

    /// Returns `true` if a table with this name exists.
    ///
    /// # Errors
    ///
    /// Returns a database error if `sqlite_master` cannot be queried.
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
