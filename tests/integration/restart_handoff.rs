//! Restart countdown through to process handoff.

use std::ffi::OsString;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use updraft::config::RestartConfig;
use updraft::restart::{RestartOutcome, ShutdownHook};
use updraft::{Database, RestartCoordinator, ScheduleRequest, UpdateError, UpdaterConfig};

use crate::helpers::{RecordingLauncher, fast_restart};

/// Counts shutdowns and notes how many replacements existed at that point.
struct CountingShutdown {
    calls: AtomicUsize,
    spawned_before: Mutex<Vec<usize>>,
    launcher: Arc<RecordingLauncher>,
}

#[async_trait]
impl ShutdownHook for CountingShutdown {
    async fn shutdown(&self) -> updraft::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.spawned_before
            .lock()
            .unwrap()
            .push(self.launcher.spawn_count());
        Ok(())
    }
}

fn restart_config() -> RestartConfig {
    let mut config = UpdaterConfig::default();
    fast_restart(&mut config);
    config.restart
}

#[tokio::test]
async fn record_and_shutdown_precede_handoff() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let observer = Arc::new(RestartCoordinator::new(restart_config()).with_database(Arc::clone(&db)));
    let launcher = Arc::new(RecordingLauncher {
        observer: Some(observer),
        ..RecordingLauncher::default()
    });
    let hook = Arc::new(CountingShutdown {
        calls: AtomicUsize::new(0),
        spawned_before: Mutex::new(Vec::new()),
        launcher: Arc::clone(&launcher),
    });

    let restart = RestartCoordinator::new(restart_config())
        .with_database(Arc::clone(&db))
        .with_launcher(launcher.clone())
        .with_shutdown(hook.clone())
        .with_command("/srv/app/server", vec![OsString::from("--port"), OsString::from("8080")]);

    restart
        .schedule(ScheduleRequest {
            delay_seconds: 3,
            reason: "nightly".into(),
            force: false,
        })
        .unwrap();
    assert_eq!(restart.wait().await, Some(RestartOutcome::Fired));

    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert_eq!(hook.spawned_before.lock().unwrap().as_slice(), &[0]);
    assert_eq!(launcher.history_at_spawn.lock().unwrap().as_slice(), &[1]);

    let spawned = launcher.spawned.lock().unwrap();
    assert_eq!(spawned[0].0, std::path::PathBuf::from("/srv/app/server"));
    assert_eq!(spawned[0].1, vec![OsString::from("--port"), OsString::from("8080")]);
    assert_eq!(launcher.exit_count(), 1);

    let history = restart.restart_history(5).unwrap();
    assert_eq!(history[0].reason, "nightly");
    assert!(!history[0].platform.is_empty());
}

#[tokio::test]
async fn cancelled_then_rescheduled_fires_once() {
    let launcher = Arc::new(RecordingLauncher::default());
    let restart = RestartCoordinator::new(restart_config()).with_launcher(launcher.clone());

    let status = restart
        .schedule(ScheduleRequest {
            delay_seconds: 400,
            reason: "first".into(),
            force: false,
        })
        .unwrap();
    assert_eq!(status.remaining_secs, 300);
    restart.cancel().unwrap();
    assert_eq!(restart.wait().await, Some(RestartOutcome::Cancelled));
    assert_eq!(launcher.spawn_count(), 0);

    restart
        .schedule(ScheduleRequest {
            delay_seconds: 1,
            reason: "second".into(),
            force: false,
        })
        .unwrap();
    // One second left is inside the grace window.
    assert!(matches!(restart.cancel(), Err(UpdateError::Conflict(_))));
    assert_eq!(restart.wait().await, Some(RestartOutcome::Fired));
    assert_eq!(launcher.spawn_count(), 1);
}
