//! Shared helpers for integration tests.

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use updraft::restart::ProcessLauncher;
use updraft::{
    BackupVault, Database, MigrationEngine, MigrationRecord, RestartCoordinator, UpdateOrchestrator,
    UpdaterConfig,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

pub(crate) const PLATFORM: &str = "linux-amd64";
pub(crate) const RUNNING_VERSION: &str = "1.0.0";

/// Zip archive with stored (uncompressed) entries.
pub(crate) fn package_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in files {
            zip.start_file(*name, options).expect("start entry");
            zip.write_all(content).expect("write entry");
        }
        zip.finish().expect("finish zip");
    }
    buf.into_inner()
}

pub(crate) fn sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub(crate) fn migration(version: &str, up_sql: &str, down_sql: &str) -> MigrationRecord {
    MigrationRecord {
        version: version.to_owned(),
        name: format!("step_{}", version.replace('.', "_")),
        description: format!("schema {version}"),
        up_sql: up_sql.to_owned(),
        down_sql: down_sql.to_owned(),
        author: "tests".to_owned(),
        created_at: "2026-01-01T00:00:00Z".to_owned(),
        is_critical: false,
    }
}

/// Serve a GitHub-style release at `/releases/latest` and its package at
/// `/dl/package.zip`. The package mock expects exactly `downloads` requests.
pub(crate) async fn mount_release(
    server: &MockServer,
    version: &str,
    package: &[u8],
    checksum: &str,
    downloads: u64,
) {
    let asset = format!("updraft-v{version}-{PLATFORM}.zip");
    let body = serde_json::json!({
        "tag_name": format!("v{version}"),
        "body": format!("Release {version}\n\nsha256:{checksum}\n"),
        "published_at": "2026-09-01T08:00:00Z",
        "assets": [{
            "name": asset,
            "browser_download_url": format!("{}/dl/package.zip", server.uri()),
            "size": package.len()
        }]
    });
    Mock::given(method("GET"))
        .and(path("/releases/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dl/package.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(package.to_vec()))
        .expect(downloads)
        .mount(server)
        .await;
}

/// Launcher that records instead of spawning and never exits.
#[derive(Default)]
pub(crate) struct RecordingLauncher {
    pub spawned: Mutex<Vec<(PathBuf, Vec<OsString>)>>,
    pub exits: AtomicUsize,
    /// Restart records visible at the moment of handoff.
    pub history_at_spawn: Mutex<Vec<usize>>,
    pub observer: Option<Arc<RestartCoordinator>>,
}

impl RecordingLauncher {
    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn exit_count(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn spawn_replacement(&self, exe: &Path, args: &[OsString]) -> updraft::Result<u32> {
        if let Some(observer) = &self.observer {
            let seen = observer.restart_history(100)?.len();
            self.history_at_spawn.lock().unwrap().push(seen);
        }
        self.spawned
            .lock()
            .unwrap()
            .push((exe.to_path_buf(), args.to_vec()));
        Ok(1)
    }

    fn exit(&self, _code: i32) {
        self.exits.fetch_add(1, Ordering::SeqCst);
    }
}

/// Restart settings that make countdowns finish in milliseconds.
pub(crate) fn fast_restart(config: &mut UpdaterConfig) {
    config.restart.tick_millis = 5;
    config.restart.handoff_grace_millis = 0;
    config.restart.normal_delay_secs = 4;
    config.restart.critical_delay_secs = 2;
    config.restart.grace_secs = 1;
}

/// Orchestrator rooted at `root`, reading the feed from `server`, with
/// extra migration records and a recording launcher.
pub(crate) fn orchestrator(
    root: &Path,
    server: &MockServer,
    records: Vec<MigrationRecord>,
    launcher: Arc<RecordingLauncher>,
) -> UpdateOrchestrator {
    let mut config = UpdaterConfig::rooted_at(root);
    config.feed.endpoint = format!("{}/releases/latest", server.uri());
    fast_restart(&mut config);

    let db = Arc::new(Database::open(&config.paths.database).expect("open database"));
    let vault = Arc::new(
        BackupVault::new(&config.paths.backup_dir, config.backup.keep).with_database(Arc::clone(&db)),
    );
    let migrations = MigrationEngine::new(Arc::clone(&db))
        .with_backups(Arc::clone(&vault))
        .with_records(records);
    let restart = RestartCoordinator::new(config.restart.clone())
        .with_database(Arc::clone(&db))
        .with_launcher(launcher)
        .with_command(root.join("app").join("server"), vec![OsString::from("--serve")]);

    UpdateOrchestrator::from_parts(config, db, vault, migrations, restart)
        .with_platform(PLATFORM)
        .with_current_version(RUNNING_VERSION)
}

/// Install directory pre-populated with the running build.
pub(crate) fn seed_install(root: &Path) -> PathBuf {
    let app = root.join("app");
    std::fs::create_dir_all(&app).unwrap();
    std::fs::write(app.join("server"), b"old build").unwrap();
    std::fs::write(app.join("config.toml"), b"port = 8080\n").unwrap();
    app
}
