//! SQLite DDL for the schema history ledger.
//!
//! The ledger is created by the bootstrap migration itself, so these
//! statements are the `up_sql` of version `1.0.0` rather than something
//! applied on open.

/// Version of the built-in bootstrap migration.
pub const BOOTSTRAP_VERSION: &str = "1.0.0";

/// Schema version reported while the ledger is empty or missing.
pub const SCHEMA_FLOOR: &str = "0.0.0";

/// Name of the ledger table.
pub const LEDGER_TABLE: &str = "schema_migrations";

/// Creates the ledger and the migration backup index.
pub(crate) const BOOTSTRAP_UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version     TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    applied_at  TEXT NOT NULL DEFAULT (datetime('now')),
    checksum    TEXT NOT NULL DEFAULT ''
);

-- One row per schema snapshot taken around a migration.
CREATE TABLE IF NOT EXISTS migration_backups (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    version     TEXT NOT NULL,
    backup_path TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Drops the ledger. Rollback targets below [`BOOTSTRAP_VERSION`] are
/// rejected, so the engine never runs this itself.
pub(crate) const BOOTSTRAP_DOWN_SQL: &str = r#"
DROP TABLE IF EXISTS migration_backups;
DROP TABLE IF EXISTS schema_migrations;
"#;

pub(crate) const INSERT_LEDGER_ROW: &str = "INSERT INTO schema_migrations \
     (version, name, description, applied_at, checksum) VALUES (?1, ?2, ?3, ?4, ?5)";

pub(crate) const DELETE_LEDGER_ROW: &str = "DELETE FROM schema_migrations WHERE version = ?1";

pub(crate) const SELECT_LEDGER: &str =
    "SELECT version, name, description, applied_at, checksum FROM schema_migrations";

pub(crate) const INSERT_BACKUP_ROW: &str =
    "INSERT INTO migration_backups (version, backup_path) VALUES (?1, ?2)";

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use rusqlite::Connection;

    #[test]
    fn bootstrap_sql_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(BOOTSTRAP_UP_SQL).expect("first");
        conn.execute_batch(BOOTSTRAP_UP_SQL).expect("second");

        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [LEDGER_TABLE],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(count, 1);
    }

    #[test]
    fn ledger_defaults_applied_at() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(BOOTSTRAP_UP_SQL).expect("create");
        conn.execute(
            "INSERT INTO schema_migrations (version, name) VALUES ('1.0.0', 'init')",
            [],
        )
        .expect("insert");
        let applied_at: String = conn
            .query_row("SELECT applied_at FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .expect("query");
        assert!(!applied_at.is_empty());
    }

    #[test]
    fn bootstrap_down_drops_ledger() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(BOOTSTRAP_UP_SQL).expect("create");
        conn.execute_batch(BOOTSTRAP_DOWN_SQL).expect("drop");
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(count, 0);
    }
}
