//! Update session orchestration.
//!
//! [`UpdateOrchestrator`] is the context object every update operation goes
//! through. It owns the single in-flight [`UpdateSession`] and drives one
//! supervised background task per session:
//!
//! check -> download + verify -> binary backup (optional) -> database
//! snapshot -> migrate -> install -> restart scheduling (optional)
//!
//! Any phase error marks the session failed, stores the message and stops.
//! Nothing is retried and completed phases are not undone; the operator
//! rolls back explicitly through [`MigrationEngine::rollback_to`] or
//! [`BackupVault::restore_binary`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::fetcher::ArtifactFetcher;
use super::installer::{InstallMethod, InstallReport, InstallStager};
use super::progress::{PROGRESS_CHANNEL_CAPACITY, ProgressReporter, UpdatePhase, UpdateProgress};
use super::release::{ReleaseDescriptor, ReleaseSource, UpdateCheck};
use super::state::{SessionOutcome, UpdateStore};
use crate::backup::BackupVault;
use crate::config::UpdaterConfig;
use crate::db::Database;
use crate::error::{Result, UpdateError};
use crate::migrate::MigrationEngine;
use crate::restart::RestartCoordinator;
use crate::version::current_version;

// Session-wide percentages at each phase boundary.
const PCT_DOWNLOAD_START: f64 = 5.0;
const PCT_DOWNLOAD_SPAN: f64 = 45.0;
const PCT_VERIFIED: f64 = 50.0;
const PCT_BACKUP: f64 = 55.0;
const PCT_MIGRATE_START: f64 = 60.0;
const PCT_MIGRATE_SPAN: f64 = 25.0;
const PCT_INSTALL: f64 = 90.0;
const PCT_RESTART: f64 = 95.0;

/// Options for one update session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
    /// Proceed even if the feed version is not newer.
    pub force: bool,
    /// Archive the install directory before replacing it.
    pub backup: bool,
    /// Schedule a restart once the install completes.
    pub auto_restart: bool,
}

/// The single update session.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateSession {
    pub id: String,
    pub phase: UpdatePhase,
    pub started_at: DateTime<Utc>,
    pub source_version: String,
    /// Empty until the feed has been read.
    pub target_version: String,
    pub last_error: Option<String>,
    /// Error code of `last_error`.
    pub error_code: Option<String>,
    pub progress: UpdateProgress,
}

impl UpdateSession {
    fn new(source_version: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            phase: UpdatePhase::Preparing,
            started_at: Utc::now(),
            source_version: source_version.to_owned(),
            target_version: String::new(),
            last_error: None,
            error_code: None,
            progress: UpdateProgress::default(),
        }
    }

    /// `true` until the session reaches a terminal or idle phase.
    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal() && self.phase != UpdatePhase::Idle
    }
}

type SessionSlot = Arc<Mutex<Option<UpdateSession>>>;

fn lock_session(slot: &SessionSlot) -> Result<MutexGuard<'_, Option<UpdateSession>>> {
    slot.lock()
        .map_err(|e| UpdateError::Io(format!("update session lock poisoned: {e}")))
}

/// Top-level update state machine.
pub struct UpdateOrchestrator {
    pipeline: Pipeline,
    progress_rx: Mutex<Option<mpsc::Receiver<UpdateProgress>>>,
    task: Mutex<Option<JoinHandle<UpdateSession>>>,
}

impl UpdateOrchestrator {
    /// Open the database and wire every component from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the migrations
    /// directory cannot be listed.
    pub fn open(config: UpdaterConfig) -> Result<Self> {
        let db = Arc::new(Database::open(&config.paths.database)?);
        let vault = Arc::new(
            BackupVault::new(&config.paths.backup_dir, config.backup.keep)
                .with_database(Arc::clone(&db)),
        );
        let migrations = MigrationEngine::new(Arc::clone(&db))
            .with_backups(Arc::clone(&vault))
            .with_migrations_dir(&config.paths.migrations_dir)?;
        let restart = RestartCoordinator::new(config.restart.clone()).with_database(Arc::clone(&db));
        Ok(Self::from_parts(config, db, vault, migrations, restart))
    }

    /// Assemble an orchestrator from already built components.
    pub fn from_parts(
        config: UpdaterConfig,
        db: Arc<Database>,
        vault: Arc<BackupVault>,
        migrations: MigrationEngine,
        restart: RestartCoordinator,
    ) -> Self {
        let source = ReleaseSource::new(&config.feed);
        let fetcher = ArtifactFetcher::new(source.client().clone(), &config.paths.cache_dir);
        let stager = InstallStager::new(&config.paths.cache_dir);
        let store = UpdateStore::new(Arc::clone(&db), config.update.auto_update);
        let (progress, rx) = ProgressReporter::channel(PROGRESS_CHANNEL_CAPACITY);

        Self {
            pipeline: Pipeline {
                config: Arc::new(config),
                current_version: current_version(),
                source: Arc::new(source),
                fetcher: Arc::new(fetcher),
                stager: Arc::new(stager),
                vault,
                migrations: Arc::new(migrations),
                restart: Arc::new(restart),
                store,
                progress,
                session: Arc::new(Mutex::new(None)),
            },
            progress_rx: Mutex::new(Some(rx)),
            task: Mutex::new(None),
        }
    }

    /// Treat the running build as `version` instead of [`current_version`].
    #[must_use]
    pub fn with_current_version(mut self, version: impl Into<String>) -> Self {
        self.pipeline.current_version = version.into();
        self
    }

    /// Select release assets for another platform string.
    #[must_use]
    pub fn with_platform(mut self, platform: &str) -> Self {
        let source = ReleaseSource::new(&self.pipeline.config.feed).with_platform(platform);
        self.pipeline.source = Arc::new(source);
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.pipeline.config
    }

    pub fn current_version(&self) -> &str {
        &self.pipeline.current_version
    }

    pub fn migrations(&self) -> &Arc<MigrationEngine> {
        &self.pipeline.migrations
    }

    pub fn vault(&self) -> &Arc<BackupVault> {
        &self.pipeline.vault
    }

    pub fn restart(&self) -> &Arc<RestartCoordinator> {
        &self.pipeline.restart
    }

    pub fn store(&self) -> &UpdateStore {
        &self.pipeline.store
    }

    /// Read the feed and compare it with the running build.
    ///
    /// The feed itself never fails (see [`ReleaseSource::fetch_latest`]); the
    /// result is persisted as the last check.
    ///
    /// # Errors
    ///
    /// Returns a database error if the auto-update preference cannot be read.
    pub async fn check_for_update(&self) -> Result<UpdateCheck> {
        self.pipeline.check().await
    }

    /// Start an update session in the background.
    ///
    /// Returns the new session immediately; follow it with
    /// [`Self::progress`], [`Self::take_progress_stream`] or [`Self::wait`].
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Conflict`] if a session is already active, or
    /// [`UpdateError::Io`] outside a tokio runtime.
    pub fn start_update(&self, request: UpdateRequest) -> Result<UpdateSession> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| UpdateError::Io(format!("no async runtime: {e}")))?;

        let session = {
            let mut slot = lock_session(&self.pipeline.session)?;
            if let Some(active) = slot.as_ref()
                && active.is_active()
            {
                return Err(UpdateError::Conflict(format!(
                    "update session {} already in progress ({})",
                    active.id, active.phase
                )));
            }
            let session = UpdateSession::new(&self.pipeline.current_version);
            *slot = Some(session.clone());
            session
        };
        tracing::info!(
            session = %session.id,
            force = request.force,
            backup = request.backup,
            auto_restart = request.auto_restart,
            "update session started"
        );
        self.pipeline
            .report(UpdateProgress::new(UpdatePhase::Preparing, "checking for updates", 0.0));

        let handle = runtime.spawn(self.pipeline.clone().run(request));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        Ok(session)
    }

    /// Latest progress. Never misses the current state.
    pub fn progress(&self) -> UpdateProgress {
        self.pipeline.progress.snapshot()
    }

    /// Current or most recent session.
    pub fn session(&self) -> Option<UpdateSession> {
        lock_session(&self.pipeline.session).ok().and_then(|s| s.clone())
    }

    /// Receiver for streamed progress. Only the first caller gets it.
    ///
    /// Subscribers may miss updates when they fall behind; poll
    /// [`Self::progress`] for the authoritative state.
    pub fn take_progress_stream(&self) -> Option<mpsc::Receiver<UpdateProgress>> {
        self.progress_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Wait for the running session to end and return its final state.
    ///
    /// Returns `None` if no session was started since the last wait.
    pub async fn wait(&self) -> Option<UpdateSession> {
        let handle = self.task.lock().ok().and_then(|mut t| t.take())?;
        match handle.await {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::error!(error = %e, "update task ended abnormally");
                self.session()
            }
        }
    }
}

impl Drop for UpdateOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Shared handles moved into the session task.
#[derive(Clone)]
struct Pipeline {
    config: Arc<UpdaterConfig>,
    current_version: String,
    source: Arc<ReleaseSource>,
    fetcher: Arc<ArtifactFetcher>,
    stager: Arc<InstallStager>,
    vault: Arc<BackupVault>,
    migrations: Arc<MigrationEngine>,
    restart: Arc<RestartCoordinator>,
    store: UpdateStore,
    progress: ProgressReporter,
    session: SessionSlot,
}

impl Pipeline {
    /// Publish progress and mirror it into the session.
    fn report(&self, progress: UpdateProgress) {
        if let Ok(mut slot) = lock_session(&self.session)
            && let Some(session) = slot.as_mut()
        {
            session.phase = progress.status;
            session.progress = progress.clone();
        }
        self.progress.publish(progress);
    }

    fn set_target(&self, version: &str) {
        if let Ok(mut slot) = lock_session(&self.session)
            && let Some(session) = slot.as_mut()
        {
            session.target_version = version.to_owned();
        }
    }

    fn current_session(&self) -> Option<UpdateSession> {
        lock_session(&self.session).ok().and_then(|s| s.clone())
    }

    async fn check(&self) -> Result<UpdateCheck> {
        let descriptor = self.source.fetch_latest().await;
        self.evaluate(descriptor)
    }

    fn evaluate(&self, descriptor: ReleaseDescriptor) -> Result<UpdateCheck> {
        let auto = self.store.auto_update_enabled()?;
        let check = UpdateCheck::evaluate(descriptor, &self.current_version, auto);
        if let Err(e) = self.store.record_check(&check) {
            tracing::warn!(error = %e, "failed to persist update check");
        }
        tracing::info!(
            current = %check.current_version,
            latest = %check.latest_version,
            has_update = check.has_update,
            critical = check.is_critical,
            "update check complete"
        );
        Ok(check)
    }

    async fn run(self, request: UpdateRequest) -> UpdateSession {
        let outcome = self.execute(request).await;
        let session = self.current_session();
        let session_id = session.as_ref().map(|s| s.id.clone()).unwrap_or_default();
        let target = session
            .as_ref()
            .map(|s| s.target_version.clone())
            .unwrap_or_default();

        match outcome {
            Ok(Some(message)) => {
                self.report(UpdateProgress::new(UpdatePhase::Completed, message.clone(), 100.0));
                self.record(&session_id, &target, SessionOutcome::Completed, &message);
            }
            Ok(None) => {
                self.report(UpdateProgress::new(UpdatePhase::Idle, "already up to date", 100.0));
            }
            Err(e) => {
                tracing::error!(session = %session_id, code = e.code(), error = %e, "update failed");
                let percent = self.progress.snapshot().percent;
                if let Ok(mut slot) = lock_session(&self.session)
                    && let Some(session) = slot.as_mut()
                {
                    session.last_error = Some(e.to_string());
                    session.error_code = Some(e.code().to_owned());
                }
                self.report(UpdateProgress::new(UpdatePhase::Failed, e.to_string(), percent));
                self.record(&session_id, &target, SessionOutcome::Failed, &e.to_string());
            }
        }
        self.current_session()
            .unwrap_or_else(|| UpdateSession::new(&self.current_version))
    }

    fn record(&self, session_id: &str, target: &str, outcome: SessionOutcome, message: &str) {
        if let Err(e) =
            self.store
                .record_session(session_id, &self.current_version, target, outcome, message)
        {
            tracing::warn!(error = %e, "failed to record update history");
        }
    }

    /// Runs every phase. `Ok(None)` means there was nothing to install.
    async fn execute(&self, request: UpdateRequest) -> Result<Option<String>> {
        let descriptor = self.source.fetch_latest().await;
        let check = self.evaluate(descriptor.clone())?;
        if !check.has_update {
            if !request.force {
                return Ok(None);
            }
            tracing::info!(version = %descriptor.version, "forcing update without a newer release");
        }
        self.set_target(&descriptor.version);

        let package = self.download(&descriptor).await?;
        self.backup(&descriptor, request.backup).await?;
        self.migrate().await?;
        let report = self.install(&package, &descriptor).await?;

        let mut message = format!("updated to {}", descriptor.version);
        if let InstallMethod::Copy { files } = &report.method {
            message.push_str(&format!(" ({files} files)"));
        }
        if request.auto_restart {
            self.report(UpdateProgress::new(UpdatePhase::Restarting, "scheduling restart", PCT_RESTART));
            let critical = check.is_critical || descriptor.is_critical_for(&self.current_version);
            match self.restart.schedule_after_update(&descriptor.version, critical) {
                Ok(status) => {
                    message.push_str(&format!(", restarting in {}s", status.remaining_secs));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "restart not scheduled");
                    message.push_str(&format!(", restart not scheduled: {}", e.message()));
                }
            }
        }
        Ok(Some(message))
    }

    async fn download(&self, descriptor: &ReleaseDescriptor) -> Result<PathBuf> {
        self.report(UpdateProgress::new(
            UpdatePhase::Downloading,
            format!("downloading {}", descriptor.version),
            PCT_DOWNLOAD_START,
        ));
        let pipeline = self.clone();
        self.fetcher
            .download(descriptor, move |mut progress| {
                progress.percent = match progress.status {
                    UpdatePhase::Downloading => {
                        PCT_DOWNLOAD_START + progress.percent * PCT_DOWNLOAD_SPAN / 100.0
                    }
                    _ => PCT_VERIFIED,
                };
                pipeline.report(progress);
            })
            .await
    }

    async fn backup(&self, descriptor: &ReleaseDescriptor, binary: bool) -> Result<()> {
        if binary {
            self.report(UpdateProgress::new(
                UpdatePhase::Backup,
                "backing up current install",
                PCT_BACKUP,
            ));
            let install_dir = self.resolve_install_dir()?;
            let vault = Arc::clone(&self.vault);
            let version = self.current_version.clone();
            let artifact = blocking(move || vault.backup_binary(&install_dir, &version))
                .await
                .map_err(|e| e.with_phase("backup"))?;
            tracing::info!(path = %artifact.path.display(), "install backed up");
        }

        let engine = Arc::clone(&self.migrations);
        let needs_migration = blocking(move || engine.pending().map(|p| !p.is_empty()))
            .await
            .unwrap_or(true);
        if !needs_migration {
            tracing::debug!("schema is current, no database snapshot needed");
            return Ok(());
        }

        let vault = Arc::clone(&self.vault);
        let label = format!("pre-update-{}", descriptor.version);
        match blocking(move || vault.backup_database(&label)).await {
            Ok(artifact) => tracing::info!(path = %artifact.path.display(), "database snapshot taken"),
            Err(e) => tracing::warn!(error = %e, "database snapshot failed, migrating anyway"),
        }
        Ok(())
    }

    async fn migrate(&self) -> Result<()> {
        self.report(UpdateProgress::new(
            UpdatePhase::Migrating,
            "checking schema",
            PCT_MIGRATE_START,
        ));
        let engine = Arc::clone(&self.migrations);
        let pipeline = self.clone();
        let applied = blocking(move || {
            engine.apply_pending(|step| {
                let done = step.index.saturating_sub(1) as f64 / step.total.max(1) as f64;
                pipeline.report(UpdateProgress::new(
                    UpdatePhase::Migrating,
                    format!(
                        "applying migration {} {} ({}/{})",
                        step.version, step.name, step.index, step.total
                    ),
                    PCT_MIGRATE_START + done * PCT_MIGRATE_SPAN,
                ));
            })
        })
        .await?;
        tracing::info!(count = applied.len(), "migrations applied");
        Ok(())
    }

    async fn install(&self, package: &Path, descriptor: &ReleaseDescriptor) -> Result<InstallReport> {
        self.report(UpdateProgress::new(
            UpdatePhase::Installing,
            format!("installing {}", descriptor.version),
            PCT_INSTALL,
        ));
        let install_dir = self.resolve_install_dir()?;
        let stager = Arc::clone(&self.stager);
        let package = package.to_path_buf();
        let version = descriptor.version.clone();
        let report = blocking(move || {
            let result = stager.install(&package, &install_dir, &version);
            stager.cleanup(&version);
            result
        })
        .await
        .map_err(|e| e.with_phase("install"))?;
        Ok(report)
    }

    fn resolve_install_dir(&self) -> Result<PathBuf> {
        self.config.paths.resolve_install_dir()
    }
}

/// Run blocking filesystem or database work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| UpdateError::Io(format!("blocking task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn orchestrator(root: &std::path::Path, endpoint: &str) -> UpdateOrchestrator {
        let mut config = UpdaterConfig::rooted_at(root);
        config.feed.endpoint = endpoint.to_owned();
        UpdateOrchestrator::open(config).unwrap()
    }

    #[tokio::test]
    async fn dead_feed_means_no_update() {
        let dir = tempfile::TempDir::new().unwrap();
        let updater = orchestrator(dir.path(), "http://127.0.0.1:9/latest").with_current_version("1.4.0");

        let check = updater.check_for_update().await.unwrap();
        assert!(!check.has_update);
        assert!(check.descriptor.is_none());
        assert!(updater.store().last_check().unwrap().is_some());
    }

    #[tokio::test]
    async fn session_without_update_returns_to_idle() {
        let dir = tempfile::TempDir::new().unwrap();
        let updater = orchestrator(dir.path(), "http://127.0.0.1:9/latest");

        let session = updater.start_update(UpdateRequest::default()).unwrap();
        assert!(session.is_active());

        let done = updater.wait().await.unwrap();
        assert_eq!(done.phase, UpdatePhase::Idle);
        assert!(done.last_error.is_none());
        assert!(updater.store().update_history(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_session_is_rejected_while_active() {
        let dir = tempfile::TempDir::new().unwrap();
        let updater = orchestrator(dir.path(), "http://127.0.0.1:9/latest");

        updater.start_update(UpdateRequest::default()).unwrap();
        let err = updater.start_update(UpdateRequest::default()).unwrap_err();
        assert!(matches!(err, UpdateError::Conflict(_)));

        updater.wait().await.unwrap();
        updater.start_update(UpdateRequest::default()).unwrap();
        updater.wait().await.unwrap();
    }

    #[tokio::test]
    async fn forced_update_without_package_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let updater = orchestrator(dir.path(), "http://127.0.0.1:9/latest");

        updater
            .start_update(UpdateRequest {
                force: true,
                ..UpdateRequest::default()
            })
            .unwrap();
        let done = updater.wait().await.unwrap();
        assert_eq!(done.phase, UpdatePhase::Failed);
        assert_eq!(done.error_code.as_deref(), Some("NETWORK_ERROR"));
        assert_eq!(updater.progress().status, UpdatePhase::Failed);

        let history = updater.store().update_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "failed");
    }

    #[test]
    fn poisoned_session_lock_is_not_retryable() {
        let slot: SessionSlot = Arc::new(Mutex::new(None));
        let poisoner = Arc::clone(&slot);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the session slot");
        })
        .join();

        let err = lock_session(&slot).unwrap_err();
        assert!(matches!(err, UpdateError::Io(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn progress_stream_is_taken_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let updater = orchestrator(dir.path(), "http://127.0.0.1:9/latest");
        assert!(updater.take_progress_stream().is_some());
        assert!(updater.take_progress_stream().is_none());
    }
}
