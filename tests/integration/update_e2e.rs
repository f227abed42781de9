//! End-to-end update sessions against a mock release feed.

use std::sync::Arc;

use updraft::backup::BackupKind;
use updraft::restart::RestartOutcome;
use updraft::update::UpdatePhase;
use updraft::{UpdateError, UpdateRequest};
use wiremock::MockServer;

use crate::helpers::{
    RecordingLauncher, RUNNING_VERSION, migration, mount_release, orchestrator, package_zip, seed_install,
    sha256,
};

fn new_build() -> Vec<u8> {
    package_zip(&[
        ("server", b"new build".as_slice()),
        ("assets/index.html", b"<html></html>".as_slice()),
        ("config.toml", b"port = 1\n".as_slice()),
    ])
}

#[tokio::test]
async fn no_update_available_runs_no_phases() {
    let dir = tempfile::TempDir::new().unwrap();
    let server = MockServer::start().await;
    let package = new_build();
    mount_release(&server, RUNNING_VERSION, &package, &sha256(&package), 0).await;
    let updater = orchestrator(dir.path(), &server, Vec::new(), Arc::default());

    let check = updater.check_for_update().await.unwrap();
    assert!(!check.has_update);
    assert_eq!(check.latest_version, RUNNING_VERSION);

    updater.start_update(UpdateRequest::default()).unwrap();
    let session = updater.wait().await.unwrap();
    assert_eq!(session.phase, UpdatePhase::Idle);
    assert!(updater.migrations().applied().unwrap().is_empty());
    assert!(updater.store().update_history(10).unwrap().is_empty());
}

#[tokio::test]
async fn digest_mismatch_fails_before_migration_and_install() {
    let dir = tempfile::TempDir::new().unwrap();
    let app = seed_install(dir.path());
    let server = MockServer::start().await;
    let package = new_build();
    mount_release(&server, "2.0.0", &package, &"0".repeat(64), 1).await;

    let records = vec![migration("1.1.0", "CREATE TABLE widgets (id INTEGER);", "DROP TABLE widgets;")];
    let updater = orchestrator(dir.path(), &server, records, Arc::default());

    updater.start_update(UpdateRequest::default()).unwrap();
    let session = updater.wait().await.unwrap();

    assert_eq!(session.phase, UpdatePhase::Failed);
    assert_eq!(session.error_code.as_deref(), Some("INTEGRITY_ERROR"));
    assert_eq!(session.target_version, "2.0.0");
    assert_eq!(updater.progress().status, UpdatePhase::Failed);

    // Nothing past verification ran.
    assert!(updater.migrations().applied().unwrap().is_empty());
    assert_eq!(std::fs::read(app.join("server")).unwrap(), b"old build");
    assert!(!app.join("assets").exists());
    assert!(!dir.path().join("cache").join("updraft-v2.0.0-linux-amd64.zip").exists());

    let history = updater.store().update_history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "failed");
    assert_eq!(history[0].to_version, "2.0.0");
}

#[tokio::test]
async fn failed_migration_keeps_earlier_versions_and_skips_install() {
    let dir = tempfile::TempDir::new().unwrap();
    let app = seed_install(dir.path());
    let server = MockServer::start().await;
    let package = new_build();
    mount_release(&server, "2.0.0", &package, &sha256(&package), 1).await;

    let records = vec![
        migration("1.3.0", "CREATE TABLE gadgets (id INTEGER);", ""),
        migration("1.1.0", "CREATE TABLE widgets (id INTEGER);", "DROP TABLE widgets;"),
        migration("1.2.0", "ALTER TABLE no_such_table ADD COLUMN x INTEGER;", ""),
    ];
    let updater = orchestrator(dir.path(), &server, records, Arc::default());

    updater.start_update(UpdateRequest::default()).unwrap();
    let session = updater.wait().await.unwrap();

    assert_eq!(session.phase, UpdatePhase::Failed);
    assert_eq!(session.error_code.as_deref(), Some("MIGRATION_ERROR"));
    assert!(session.last_error.as_deref().unwrap().contains("1.2.0"));

    let applied: Vec<String> = updater
        .migrations()
        .applied()
        .unwrap()
        .into_iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(applied, vec!["1.0.0", "1.1.0"]);
    assert_eq!(updater.migrations().current_version().unwrap(), "1.1.0");

    assert_eq!(std::fs::read(app.join("server")).unwrap(), b"old build");
    // The pre-migration snapshot was still taken.
    assert_eq!(updater.vault().list(BackupKind::SchemaSnapshot).unwrap().len(), 1);
}

#[tokio::test]
async fn successful_update_installs_and_restarts() {
    let dir = tempfile::TempDir::new().unwrap();
    let app = seed_install(dir.path());
    let server = MockServer::start().await;
    let package = new_build();
    mount_release(&server, "2.0.0", &package, &sha256(&package), 1).await;

    let launcher = Arc::new(RecordingLauncher::default());
    let records = vec![migration("1.1.0", "CREATE TABLE widgets (id INTEGER);", "DROP TABLE widgets;")];
    let updater = orchestrator(dir.path(), &server, records, Arc::clone(&launcher));

    let mut stream = updater.take_progress_stream().unwrap();
    let collector = tokio::spawn(async move {
        let mut phases = Vec::new();
        while let Some(progress) = stream.recv().await {
            if phases.last() != Some(&progress.status) {
                phases.push(progress.status);
            }
            if progress.status.is_terminal() {
                break;
            }
        }
        phases
    });

    updater
        .start_update(UpdateRequest {
            backup: true,
            auto_restart: true,
            force: false,
        })
        .unwrap();
    let session = updater.wait().await.unwrap();
    assert_eq!(session.phase, UpdatePhase::Completed, "{:?}", session.last_error);
    assert!((updater.progress().percent - 100.0).abs() < f64::EPSILON);

    let phases = collector.await.unwrap();
    let order = [
        UpdatePhase::Downloading,
        UpdatePhase::Backup,
        UpdatePhase::Migrating,
        UpdatePhase::Installing,
        UpdatePhase::Restarting,
        UpdatePhase::Completed,
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|p| phases.iter().position(|seen| seen == p).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{phases:?}");

    // New files installed, retained config untouched.
    assert_eq!(std::fs::read(app.join("server")).unwrap(), b"new build");
    assert!(app.join("assets").join("index.html").is_file());
    assert_eq!(std::fs::read(app.join("config.toml")).unwrap(), b"port = 8080\n");
    assert!(!dir.path().join("cache").join("extract-2.0.0").exists());

    assert_eq!(updater.migrations().current_version().unwrap(), "1.1.0");
    assert_eq!(updater.vault().list(BackupKind::BinaryArchive).unwrap().len(), 1);
    assert_eq!(updater.store().update_history(1).unwrap()[0].status, "completed");

    assert_eq!(updater.restart().wait().await, Some(RestartOutcome::Fired));
    assert_eq!(launcher.spawn_count(), 1);
    assert_eq!(launcher.exit_count(), 1);
    assert_eq!(updater.restart().restart_history(10).unwrap()[0].reason, "update to 2.0.0");
}

#[tokio::test]
async fn concurrent_request_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    seed_install(dir.path());
    let server = MockServer::start().await;
    let package = new_build();
    mount_release(&server, "2.0.0", &package, &sha256(&package), 1).await;
    let updater = orchestrator(dir.path(), &server, Vec::new(), Arc::default());

    updater.start_update(UpdateRequest::default()).unwrap();
    let err = updater.start_update(UpdateRequest::default()).unwrap_err();
    assert!(matches!(err, UpdateError::Conflict(_)));

    assert_eq!(updater.wait().await.unwrap().phase, UpdatePhase::Completed);
}

#[tokio::test]
async fn current_schema_takes_no_database_snapshot() {
    let dir = tempfile::TempDir::new().unwrap();
    let app = seed_install(dir.path());
    let server = MockServer::start().await;
    let package = new_build();
    mount_release(&server, "2.0.0", &package, &sha256(&package), 1).await;
    let updater = orchestrator(dir.path(), &server, Vec::new(), Arc::default());
    updater.migrations().apply_pending(|_| {}).unwrap();

    updater.start_update(UpdateRequest::default()).unwrap();
    let session = updater.wait().await.unwrap();

    assert_eq!(session.phase, UpdatePhase::Completed, "{:?}", session.last_error);
    assert_eq!(std::fs::read(app.join("server")).unwrap(), b"new build");
    assert!(updater.vault().list(BackupKind::SchemaSnapshot).unwrap().is_empty());
}
