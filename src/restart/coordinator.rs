//! Cancellable restart countdown.
//!
//! At most one restart is scheduled at a time. A countdown ticks once per
//! [`RestartConfig::tick_millis`] and publishes a [`RestartStatus`] on a
//! watch channel. When it reaches zero the restart is recorded, the
//! shutdown hook runs, the replacement process is spawned and this process
//! exits.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RestartConfig;
use crate::db::Database;
use crate::error::{Result, UpdateError};
use crate::restart::launcher::{NoopShutdown, ProcessLauncher, ShutdownHook, platform_launcher};
use crate::version::{current_version, platform_string};

/// A request to restart after a delay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleRequest {
    /// Requested delay. Zero or negative selects the configured default.
    pub delay_seconds: i64,
    pub reason: String,
    /// Replace an already scheduled restart instead of failing.
    #[serde(default)]
    pub force: bool,
}

/// Countdown state as seen by pollers and subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartStatus {
    pub is_counting_down: bool,
    pub remaining_secs: u64,
    pub restart_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub can_cancel: bool,
    pub message: String,
}

/// A restart that actually fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartRecord {
    pub id: i64,
    pub planned_at: String,
    pub fired_at: String,
    pub reason: String,
    pub version: String,
    pub platform: String,
}

/// How a countdown task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Cancelled before expiry.
    Cancelled,
    /// Replaced by a forced schedule.
    Superseded,
    /// Replacement spawned and exit requested.
    Fired,
    /// Replacement could not be spawned.
    Failed(String),
}

/// Clamp a requested delay into `1..=max_delay_secs`.
pub fn clamp_delay(requested: i64, config: &RestartConfig) -> u64 {
    let requested = match u64::try_from(requested) {
        Ok(0) | Err(_) => config.default_delay_secs,
        Ok(secs) => secs,
    };
    requested.clamp(1, config.max_delay_secs.max(1))
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Ticket {
    id: u64,
    planned_at: DateTime<Utc>,
    restart_at: DateTime<Utc>,
    reason: String,
    remaining: u64,
    cancel: CancellationToken,
}

type Slot = Arc<Mutex<Option<Ticket>>>;

fn lock_slot(slot: &Slot) -> Result<MutexGuard<'_, Option<Ticket>>> {
    slot.lock()
        .map_err(|e| UpdateError::Restart(format!("restart state lock poisoned: {e}")))
}

fn status_of(ticket: &Ticket, grace_secs: u64) -> RestartStatus {
    RestartStatus {
        is_counting_down: true,
        remaining_secs: ticket.remaining,
        restart_at: Some(ticket.restart_at),
        reason: ticket.reason.clone(),
        can_cancel: ticket.remaining > grace_secs,
        message: format!("restarting in {}s", ticket.remaining),
    }
}

/// Everything needed to hand off to a new process.
#[derive(Clone)]
struct Handoff {
    config: RestartConfig,
    db: Option<Arc<Database>>,
    launcher: Arc<dyn ProcessLauncher>,
    shutdown: Arc<dyn ShutdownHook>,
    command: Option<(PathBuf, Vec<OsString>)>,
    status: Arc<watch::Sender<RestartStatus>>,
}

impl Handoff {
    fn resolve_command(&self) -> Result<(PathBuf, Vec<OsString>)> {
        if let Some(command) = &self.command {
            return Ok(command.clone());
        }
        let exe = std::env::current_exe()
            .map_err(|e| UpdateError::Restart(format!("cannot determine current executable: {e}")))?;
        Ok((exe, std::env::args_os().skip(1).collect()))
    }

    fn record(&self, planned_at: DateTime<Utc>, reason: &str) {
        let Some(db) = &self.db else { return };
        let result = db.lock().and_then(|conn| {
            conn.execute(
                "INSERT INTO restart_history (planned_at, fired_at, reason, version, platform) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    planned_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    reason,
                    current_version(),
                    platform_string()
                ],
            )?;
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to record restart");
        }
    }

    async fn fire(&self, planned_at: DateTime<Utc>, reason: &str) -> Result<()> {
        self.status.send_replace(RestartStatus {
            reason: reason.to_owned(),
            message: "restarting now".to_owned(),
            ..RestartStatus::default()
        });
        tracing::info!(reason, "restart firing");

        self.record(planned_at, reason);
        if let Err(e) = self.shutdown.shutdown().await {
            tracing::warn!(error = %e, "shutdown hook failed, restarting anyway");
        }

        let spawned = self
            .resolve_command()
            .and_then(|(exe, args)| self.launcher.spawn_replacement(&exe, &args));
        match spawned {
            Ok(pid) => {
                tracing::info!(pid, "handing off to replacement process");
                tokio::time::sleep(Duration::from_millis(self.config.handoff_grace_millis)).await;
                self.launcher.exit(0);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "restart failed");
                self.status.send_replace(RestartStatus {
                    reason: reason.to_owned(),
                    message: format!("restart failed: {e}"),
                    ..RestartStatus::default()
                });
                Err(e)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Countdown task
// ---------------------------------------------------------------------------

struct Countdown {
    id: u64,
    slot: Slot,
    handoff: Handoff,
    cancel: CancellationToken,
}

impl Countdown {
    fn interrupted(&self) -> RestartOutcome {
        match lock_slot(&self.slot).map(|g| g.as_ref().map(|t| t.id)) {
            Ok(Some(id)) if id != self.id => RestartOutcome::Superseded,
            _ => RestartOutcome::Cancelled,
        }
    }

    async fn run(self) -> RestartOutcome {
        let tick = Duration::from_millis(self.handoff.config.tick_millis.max(1));
        let grace = self.handoff.config.grace_secs;

        loop {
            let current = match lock_slot(&self.slot) {
                Ok(guard) => guard
                    .as_ref()
                    .filter(|t| t.id == self.id && !self.cancel.is_cancelled())
                    .map(|t| status_of(t, grace)),
                Err(e) => return RestartOutcome::Failed(e.to_string()),
            };
            let Some(status) = current else {
                return self.interrupted();
            };
            self.handoff.status.send_replace(status.clone());
            if status.remaining_secs == 0 {
                break;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.interrupted(),
                () = tokio::time::sleep(tick) => {}
            }

            if let Ok(mut guard) = lock_slot(&self.slot)
                && let Some(ticket) = guard.as_mut()
                && ticket.id == self.id
            {
                ticket.remaining = ticket.remaining.saturating_sub(1);
            }
        }

        // Expiry: take the ticket under the lock so a racing cancel either
        // wins outright or finds nothing to cancel.
        let ticket = match lock_slot(&self.slot) {
            Ok(mut guard) => {
                if self.cancel.is_cancelled() {
                    drop(guard);
                    return self.interrupted();
                }
                match guard.take() {
                    Some(ticket) if ticket.id == self.id => ticket,
                    other => {
                        *guard = other;
                        return RestartOutcome::Superseded;
                    }
                }
            }
            Err(e) => return RestartOutcome::Failed(e.to_string()),
        };

        match self.handoff.fire(ticket.planned_at, &ticket.reason).await {
            Ok(()) => RestartOutcome::Fired,
            Err(e) => RestartOutcome::Failed(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owner of the single scheduled restart.
pub struct RestartCoordinator {
    handoff: Handoff,
    slot: Slot,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<RestartOutcome>>>,
}

impl RestartCoordinator {
    /// Coordinator using the platform launcher and a no-op shutdown hook.
    pub fn new(config: RestartConfig) -> Self {
        let (status, _) = watch::channel(RestartStatus::default());
        Self {
            handoff: Handoff {
                config,
                db: None,
                launcher: Arc::from(platform_launcher()),
                shutdown: Arc::new(NoopShutdown),
                command: None,
                status: Arc::new(status),
            },
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            task: Mutex::new(None),
        }
    }

    /// Record fired restarts in `restart_history`.
    #[must_use]
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.handoff.db = Some(db);
        self
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.handoff.launcher = launcher;
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.handoff.shutdown = hook;
        self
    }

    /// Override the command started on restart. Defaults to the current
    /// executable with the current arguments.
    #[must_use]
    pub fn with_command(mut self, exe: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        self.handoff.command = Some((exe.into(), args));
        self
    }

    pub fn config(&self) -> &RestartConfig {
        &self.handoff.config
    }

    /// Start a countdown.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Conflict`] if a restart is already scheduled and
    /// `force` is not set, or [`UpdateError::Restart`] outside a runtime.
    pub fn schedule(&self, request: ScheduleRequest) -> Result<RestartStatus> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| UpdateError::Restart(format!("no async runtime: {e}")))?;
        let delay = clamp_delay(request.delay_seconds, &self.handoff.config);

        let mut slot = lock_slot(&self.slot)?;
        if let Some(active) = slot.as_ref() {
            if !request.force {
                return Err(UpdateError::Conflict(format!(
                    "restart already scheduled in {}s ({})",
                    active.remaining, active.reason
                )));
            }
            tracing::info!(previous = %active.reason, "replacing scheduled restart");
            active.cancel.cancel();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let planned_at = Utc::now();
        let delay_i64 = i64::try_from(delay).unwrap_or(i64::MAX);
        let ticket = Ticket {
            id,
            planned_at,
            restart_at: planned_at + chrono::Duration::seconds(delay_i64),
            reason: request.reason,
            remaining: delay,
            cancel: CancellationToken::new(),
        };
        let status = status_of(&ticket, self.handoff.config.grace_secs);
        let countdown = Countdown {
            id,
            slot: Arc::clone(&self.slot),
            handoff: self.handoff.clone(),
            cancel: ticket.cancel.clone(),
        };
        *slot = Some(ticket);
        drop(slot);

        self.handoff.status.send_replace(status.clone());
        tracing::info!(delay_secs = delay, reason = %status.reason, "restart scheduled");

        let handle = runtime.spawn(countdown.run());
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(status)
    }

    /// Cancel the scheduled restart.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Conflict`] if nothing is scheduled or the
    /// countdown is within the grace window.
    pub fn cancel(&self) -> Result<RestartStatus> {
        let mut slot = lock_slot(&self.slot)?;
        let Some(active) = slot.as_ref() else {
            return Err(UpdateError::Conflict("no restart is scheduled".into()));
        };
        if active.remaining <= self.handoff.config.grace_secs {
            return Err(UpdateError::Conflict(format!(
                "restart in {}s can no longer be cancelled",
                active.remaining
            )));
        }
        if let Some(ticket) = slot.take() {
            ticket.cancel.cancel();
            tracing::info!(reason = %ticket.reason, remaining = ticket.remaining, "restart cancelled");
        }
        drop(slot);

        let status = RestartStatus {
            message: "restart cancelled".into(),
            ..RestartStatus::default()
        };
        self.handoff.status.send_replace(status.clone());
        Ok(status)
    }

    /// Restart immediately, dropping any pending countdown.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Restart`] if the replacement cannot be spawned.
    pub async fn restart_now(&self, reason: &str) -> Result<()> {
        if let Some(ticket) = lock_slot(&self.slot)?.take() {
            ticket.cancel.cancel();
        }
        self.handoff.fire(Utc::now(), reason).await
    }

    /// Schedule the restart that follows an installed update.
    ///
    /// Critical releases use the short delay and replace any pending
    /// countdown; regular ones use the normal delay and respect it.
    ///
    /// # Errors
    ///
    /// See [`RestartCoordinator::schedule`].
    pub fn schedule_after_update(&self, version: &str, critical: bool) -> Result<RestartStatus> {
        let config = &self.handoff.config;
        let (delay, reason) = if critical {
            (config.critical_delay_secs, format!("critical update to {version}"))
        } else {
            (config.normal_delay_secs, format!("update to {version}"))
        };
        self.schedule(ScheduleRequest {
            delay_seconds: i64::try_from(delay).unwrap_or(i64::MAX),
            reason,
            force: critical,
        })
    }

    /// Current countdown state.
    pub fn status(&self) -> RestartStatus {
        self.handoff.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<RestartStatus> {
        self.handoff.status.subscribe()
    }

    /// Wait for the most recently scheduled countdown to end.
    ///
    /// Returns `None` if nothing was scheduled since the last wait.
    pub async fn wait(&self) -> Option<RestartOutcome> {
        let handle = self.task.lock().ok().and_then(|mut t| t.take())?;
        Some(match handle.await {
            Ok(outcome) => outcome,
            Err(e) => RestartOutcome::Failed(e.to_string()),
        })
    }

    /// Most recent fired restarts, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error if the history cannot be read.
    pub fn restart_history(&self, limit: usize) -> Result<Vec<RestartRecord>> {
        let Some(db) = &self.handoff.db else {
            return Ok(Vec::new());
        };
        let conn = db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, planned_at, fired_at, reason, version, platform \
             FROM restart_history ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(RestartRecord {
                id: row.get(0)?,
                planned_at: row.get(1)?,
                fired_at: row.get(2)?,
                reason: row.get(3)?,
                version: row.get(4)?,
                platform: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

impl Drop for RestartCoordinator {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingLauncher {
        spawned: Mutex<Vec<PathBuf>>,
        exits: AtomicUsize,
        fail: bool,
    }

    impl ProcessLauncher for RecordingLauncher {
        fn spawn_replacement(&self, exe: &Path, _args: &[OsString]) -> Result<u32> {
            if self.fail {
                return Err(UpdateError::Restart("spawn refused".into()));
            }
            self.spawned.lock().unwrap().push(exe.to_path_buf());
            Ok(4242)
        }

        fn exit(&self, _code: i32) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> RestartConfig {
        RestartConfig {
            grace_secs: 2,
            tick_millis: 10,
            handoff_grace_millis: 0,
            ..RestartConfig::default()
        }
    }

    fn coordinator(launcher: &Arc<RecordingLauncher>) -> RestartCoordinator {
        RestartCoordinator::new(fast_config())
            .with_launcher(Arc::clone(launcher) as Arc<dyn ProcessLauncher>)
            .with_command("/opt/app/server", vec![OsString::from("--serve")])
    }

    fn request(delay: i64, reason: &str, force: bool) -> ScheduleRequest {
        ScheduleRequest {
            delay_seconds: delay,
            reason: reason.into(),
            force,
        }
    }

    #[test]
    fn delay_is_clamped() {
        let config = RestartConfig::default();
        assert_eq!(clamp_delay(0, &config), 10);
        assert_eq!(clamp_delay(-5, &config), 10);
        assert_eq!(clamp_delay(400, &config), 300);
        assert_eq!(clamp_delay(42, &config), 42);
    }

    #[tokio::test]
    async fn countdown_fires_and_records() {
        let launcher = Arc::new(RecordingLauncher::default());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let restart = coordinator(&launcher).with_database(Arc::clone(&db));

        let status = restart.schedule(request(3, "manual", false)).unwrap();
        assert!(status.is_counting_down);
        assert_eq!(status.remaining_secs, 3);

        assert_eq!(restart.wait().await, Some(RestartOutcome::Fired));
        assert_eq!(
            launcher.spawned.lock().unwrap().as_slice(),
            &[PathBuf::from("/opt/app/server")]
        );
        assert_eq!(launcher.exits.load(Ordering::SeqCst), 1);

        let history = restart.restart_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "manual");
        assert!(!restart.status().is_counting_down);
    }

    #[tokio::test]
    async fn oversized_delay_clamps_to_max() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        let status = restart.schedule(request(400, "long", false)).unwrap();
        assert_eq!(status.remaining_secs, 300);
        assert!(status.can_cancel);
        restart.cancel().unwrap();
        assert_eq!(restart.wait().await, Some(RestartOutcome::Cancelled));
    }

    #[tokio::test]
    async fn second_schedule_conflicts_without_force() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        restart.schedule(request(100, "first", false)).unwrap();

        let err = restart.schedule(request(3, "second", false)).unwrap_err();
        assert!(matches!(err, UpdateError::Conflict(_)));
        assert_eq!(restart.status().reason, "first");
        restart.cancel().unwrap();
    }

    #[tokio::test]
    async fn forced_schedule_supersedes() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        restart.schedule(request(100, "first", false)).unwrap();
        let status = restart.schedule(request(2, "second", true)).unwrap();
        assert_eq!(status.reason, "second");

        assert_eq!(restart.wait().await, Some(RestartOutcome::Fired));
        assert_eq!(launcher.spawned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_countdown_never_spawns() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        restart.schedule(request(50, "maintenance", false)).unwrap();

        let status = restart.cancel().unwrap();
        assert!(!status.is_counting_down);
        assert_eq!(restart.wait().await, Some(RestartOutcome::Cancelled));
        assert!(launcher.spawned.lock().unwrap().is_empty());
        assert_eq!(launcher.exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_inside_grace_window_is_refused() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        let status = restart.schedule(request(2, "soon", false)).unwrap();
        assert!(!status.can_cancel);

        let err = restart.cancel().unwrap_err();
        assert!(matches!(err, UpdateError::Conflict(_)));
        assert_eq!(restart.wait().await, Some(RestartOutcome::Fired));
    }

    #[tokio::test]
    async fn cancel_without_schedule_conflicts() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        assert!(matches!(restart.cancel(), Err(UpdateError::Conflict(_))));
    }

    #[tokio::test]
    async fn spawn_failure_reports_and_stays_alive() {
        let launcher = Arc::new(RecordingLauncher {
            fail: true,
            ..RecordingLauncher::default()
        });
        let restart = coordinator(&launcher);
        restart.schedule(request(1, "doomed", false)).unwrap();

        let outcome = restart.wait().await;
        assert!(matches!(outcome, Some(RestartOutcome::Failed(_))));
        assert_eq!(launcher.exits.load(Ordering::SeqCst), 0);
        assert!(restart.status().message.contains("restart failed"));
    }

    #[tokio::test]
    async fn restart_now_drops_pending_countdown() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        restart.schedule(request(100, "later", false)).unwrap();

        restart.restart_now("operator").await.unwrap();
        assert_eq!(launcher.spawned.lock().unwrap().len(), 1);
        assert_eq!(restart.wait().await, Some(RestartOutcome::Cancelled));
    }

    #[tokio::test]
    async fn critical_update_restart_forces() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        restart.schedule(request(100, "pending", false)).unwrap();

        let err = restart.schedule_after_update("2.0.0", false).unwrap_err();
        assert!(matches!(err, UpdateError::Conflict(_)));

        let status = restart.schedule_after_update("2.0.1", true).unwrap();
        assert_eq!(status.remaining_secs, 5);
        assert!(status.reason.contains("2.0.1"));
        assert_eq!(restart.wait().await, Some(RestartOutcome::Fired));
    }

    #[tokio::test]
    async fn subscribers_see_countdown() {
        let launcher = Arc::new(RecordingLauncher::default());
        let restart = coordinator(&launcher);
        let mut rx = restart.subscribe();
        restart.schedule(request(3, "watch", false)).unwrap();

        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_counting_down);
        assert_eq!(restart.wait().await, Some(RestartOutcome::Fired));
    }
}
