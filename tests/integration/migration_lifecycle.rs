//! Migration files on disk through apply, rollback and template creation.

use updraft::backup::BackupKind;
use updraft::{UpdateError, UpdateOrchestrator, UpdaterConfig};

use crate::helpers::migration;

fn write_record(dir: &std::path::Path, file: &str, record: &updraft::MigrationRecord) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(file), serde_json::to_string_pretty(record).unwrap()).unwrap();
}

#[test]
fn file_migrations_apply_roll_back_and_persist() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = UpdaterConfig::rooted_at(dir.path());
    let migrations_dir = config.paths.migrations_dir.clone();

    let notes = migration(
        "1.1.0",
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);",
        "DROP TABLE notes;",
    );
    let index = migration(
        "1.10.0",
        "CREATE INDEX idx_notes_body ON notes(body);",
        "DROP INDEX idx_notes_body;",
    );
    write_record(&migrations_dir, "1_10_0_index.json", &index);
    write_record(&migrations_dir, "1_1_0_notes.json", &notes);
    std::fs::write(migrations_dir.join("broken.json"), "{ not json").unwrap();

    let updater = UpdateOrchestrator::open(config.clone()).unwrap();
    let engine = updater.migrations();

    let status = engine.status().unwrap();
    assert_eq!(status.current_version, "0.0.0");
    assert_eq!(status.pending_count, 3);
    assert_eq!(status.total_count, 3);
    assert!(status.needs_migration);

    let applied = engine.apply_pending(|_| {}).unwrap();
    assert_eq!(applied, vec!["1.0.0", "1.1.0", "1.10.0"]);
    assert!(engine.apply_pending(|_| {}).unwrap().is_empty());
    assert!(!engine.status().unwrap().needs_migration);

    let ledger = engine.applied().unwrap();
    assert_eq!(ledger.len(), 3);
    assert_eq!(ledger[2].version, "1.10.0");
    assert_eq!(ledger[2].checksum, index.checksum());
    assert_eq!(ledger[1].description, "schema 1.1.0");

    let err = engine.rollback_to("1.10.0").unwrap_err();
    assert!(matches!(err, UpdateError::Conflict(_)));

    let reverted = engine.rollback_to("1.1.0").unwrap();
    assert_eq!(reverted, vec!["1.10.0"]);
    assert_eq!(engine.current_version().unwrap(), "1.1.0");
    assert_eq!(updater.vault().list(BackupKind::SchemaSnapshot).unwrap().len(), 1);

    let template = engine
        .create_migration_file("1.11.0", "add_tags", "Tag support")
        .unwrap();
    assert!(template.ends_with("1_11_0_add_tags.json"));
    drop(updater);

    // A fresh process sees the committed ledger and the new template.
    let reopened = UpdateOrchestrator::open(config).unwrap();
    let status = reopened.migrations().status().unwrap();
    assert_eq!(status.current_version, "1.1.0");
    let pending: Vec<&str> = status
        .pending_details
        .iter()
        .map(|p| p.version.as_str())
        .collect();
    assert_eq!(pending, vec!["1.10.0", "1.11.0"]);
}

#[test]
fn apply_single_version_with_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = UpdaterConfig::rooted_at(dir.path());
    write_record(
        &config.paths.migrations_dir,
        "1_1_0_notes.json",
        &migration("1.1.0", "CREATE TABLE notes (id INTEGER);", "DROP TABLE notes;"),
    );

    let updater = UpdateOrchestrator::open(config).unwrap();
    let engine = updater.migrations();

    assert!(engine.apply_version("1.0.0", false).unwrap());
    assert!(engine.apply_version("1.1.0", true).unwrap());
    assert!(!engine.apply_version("1.1.0", true).unwrap());
    assert!(matches!(
        engine.apply_version("9.9.9", false),
        Err(UpdateError::Conflict(_))
    ));

    let snapshots = updater.vault().list(BackupKind::SchemaSnapshot).unwrap();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].source_version.contains("1.1.0"));
}
