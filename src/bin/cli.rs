//! Operator CLI for updraft.
//!
//! Every command prints the `{success, data|error}` envelope as JSON on
//! stdout; logs go to stderr and a daily file under the logs directory.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use updraft::api::ApiError;
use updraft::backup::BackupKind;
use updraft::error::error_codes;
use updraft::restart::{RestartOutcome, RestartStatus};
use updraft::update::{UpdateCheck, UpdateHistoryEntry, UpdatePhase, UpdateSession};
use updraft::{
    ApiResponse, BackupArtifact, Database, RestartCoordinator, ScheduleRequest, UpdateOrchestrator,
    UpdateProgress, UpdateRequest, UpdaterConfig, app_dirs,
};

/// Updraft: self-update and schema migration for long-running servers.
#[derive(Parser)]
#[command(name = "updraft", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Do not write a log file.
    #[arg(long)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare the release feed with the running build.
    Check,

    /// Download, verify, migrate and install the latest release.
    Update {
        /// Archive the install directory first.
        #[arg(long)]
        backup: bool,
        /// Schedule a restart after installing.
        #[arg(long)]
        auto_restart: bool,
        /// Install even if the release is not newer.
        #[arg(long)]
        force: bool,
    },

    /// Show the last check, schema, restart state and update history.
    Status,

    /// Turn unattended updates on or off.
    AutoUpdate {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Schema migrations.
    #[command(subcommand)]
    Migrate(MigrateCommand),

    /// Binary and database backups.
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Process restarts.
    #[command(subcommand)]
    Restart(RestartCommand),
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Current schema version and pending migrations.
    Status,
    /// Apply every pending migration.
    Up,
    /// Apply a single migration by version.
    Apply {
        version: String,
        /// Snapshot the database first.
        #[arg(long)]
        backup: bool,
    },
    /// Revert migrations above `version`.
    Rollback { version: String },
    /// Write a new migration template.
    New {
        version: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Snapshot the database.
    Create { label: Option<String> },
    /// List backups, newest first.
    List,
    /// Extract a binary backup over the install directory.
    Restore {
        /// File name or path of the archive.
        archive: String,
    },
}

#[derive(Subcommand)]
enum RestartCommand {
    /// Restart after a countdown. Ctrl+C cancels while allowed.
    Schedule {
        #[arg(long, default_value_t = 0)]
        delay: i64,
        #[arg(long, default_value = "operator request")]
        reason: String,
        #[arg(long)]
        force: bool,
        /// Executable to start. Defaults to this one.
        #[arg(long)]
        exec: Option<PathBuf>,
        /// Arguments for the started executable.
        #[arg(last = true)]
        args: Vec<OsString>,
    },
}

#[derive(Serialize)]
struct StatusReport {
    current_version: String,
    auto_update_enabled: bool,
    last_check: Option<UpdateCheck>,
    progress: UpdateProgress,
    schema: updraft::MigrationStatus,
    restart: RestartStatus,
    history: Vec<UpdateHistoryEntry>,
}

#[derive(Serialize)]
struct BackupListing {
    dir: PathBuf,
    binary: Vec<BackupArtifact>,
    database: Vec<BackupArtifact>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(!cli.no_log_file);

    let config = match &cli.config {
        Some(path) => UpdaterConfig::from_file(path)?,
        None => {
            let path = UpdaterConfig::default_config_path();
            if path.is_file() {
                UpdaterConfig::from_file(&path)?
            } else {
                UpdaterConfig::default()
            }
        }
    };

    let updater = match UpdateOrchestrator::open(config) {
        Ok(updater) => updater,
        Err(e) => return emit::<()>(Err(e)),
    };
    run(&updater, cli.command).await
}

/// Stderr plus an optional daily log file. The guard must outlive `main`.
fn init_tracing(log_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("updraft=info"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let logs = app_dirs::logs_dir();
    if log_file && std::fs::create_dir_all(&logs).is_ok() {
        let appender = tracing_appender::rolling::daily(&logs, "updraft.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr)
            .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        None
    }
}

fn emit<T: Serialize>(result: updraft::Result<T>) -> anyhow::Result<ExitCode> {
    let code = if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    };
    println!("{}", serde_json::to_string_pretty(&ApiResponse::from(result))?);
    Ok(code)
}

async fn run(updater: &UpdateOrchestrator, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Check => emit(updater.check_for_update().await),
        Command::Update {
            backup,
            auto_restart,
            force,
        } => run_update(updater, UpdateRequest { force, backup, auto_restart }).await,
        Command::Status => emit(status(updater)),
        Command::AutoUpdate { enabled } => emit(
            updater
                .store()
                .set_auto_update(enabled)
                .and_then(|()| updater.store().auto_update_enabled()),
        ),
        Command::Migrate(cmd) => {
            let engine = updater.migrations();
            match cmd {
                MigrateCommand::Status => emit(engine.status()),
                MigrateCommand::Up => emit(engine.apply_pending(|step| {
                    info!(version = %step.version, name = %step.name, "{}/{}", step.index, step.total);
                })),
                MigrateCommand::Apply { version, backup } => emit(engine.apply_version(&version, backup)),
                MigrateCommand::Rollback { version } => emit(engine.rollback_to(&version)),
                MigrateCommand::New {
                    version,
                    name,
                    description,
                } => emit(engine.create_migration_file(&version, &name, &description)),
            }
        }
        Command::Backup(cmd) => {
            let vault = updater.vault();
            match cmd {
                BackupCommand::Create { label } => {
                    emit(vault.backup_database(label.as_deref().unwrap_or("manual")))
                }
                BackupCommand::List => emit(vault.list(BackupKind::BinaryArchive).and_then(|binary| {
                    Ok(BackupListing {
                        dir: vault.dir().to_path_buf(),
                        binary,
                        database: vault.list(BackupKind::SchemaSnapshot)?,
                    })
                })),
                BackupCommand::Restore { archive } => emit(restore(updater, &archive)),
            }
        }
        Command::Restart(RestartCommand::Schedule {
            delay,
            reason,
            force,
            exec,
            args,
        }) => {
            let request = ScheduleRequest {
                delay_seconds: delay,
                reason,
                force,
            };
            schedule_restart(updater.config(), request, exec, args).await
        }
    }
}

fn status(updater: &UpdateOrchestrator) -> updraft::Result<StatusReport> {
    let store = updater.store();
    Ok(StatusReport {
        current_version: updater.current_version().to_owned(),
        auto_update_enabled: store.auto_update_enabled()?,
        last_check: store.last_check()?,
        progress: updater.progress(),
        schema: updater.migrations().status()?,
        restart: updater.restart().status(),
        history: store.update_history(20)?,
    })
}

fn restore(updater: &UpdateOrchestrator, archive: &str) -> updraft::Result<usize> {
    let wanted = PathBuf::from(archive);
    let artifact = updater
        .vault()
        .list(BackupKind::BinaryArchive)?
        .into_iter()
        .find(|a| a.path == wanted || a.path.file_name() == wanted.file_name())
        .ok_or_else(|| updraft::UpdateError::Conflict(format!("no binary backup named {archive}")))?;
    let target = updater.config().paths.resolve_install_dir()?;
    updater.vault().restore_binary(&artifact, &target)
}

async fn run_update(updater: &UpdateOrchestrator, request: UpdateRequest) -> anyhow::Result<ExitCode> {
    if let Err(e) = updater.start_update(request) {
        return emit::<()>(Err(e));
    }
    let Some(session) = updater.wait().await else {
        return emit::<()>(Err(updraft::UpdateError::Io("update task vanished".into())));
    };
    let failed = session.phase == UpdatePhase::Failed;
    print_session(&session, failed)?;
    if failed {
        return Ok(ExitCode::FAILURE);
    }

    if request.auto_restart && updater.restart().status().is_counting_down {
        info!("waiting for scheduled restart, Ctrl+C to cancel");
        follow_restart(updater.restart()).await;
    }
    Ok(ExitCode::SUCCESS)
}

fn print_session(session: &UpdateSession, failed: bool) -> anyhow::Result<()> {
    let response = ApiResponse {
        success: !failed,
        data: Some(session),
        error: session.last_error.as_ref().map(|message| ApiError {
            code: session.error_code.clone().unwrap_or_default(),
            message: message.clone(),
            retryable: matches!(
                session.error_code.as_deref(),
                Some(error_codes::NETWORK_ERROR | error_codes::CONFLICT_ERROR)
            ),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Countdown on a coordinator of its own, so `--exec` can pick the process
/// that replaces this one.
async fn schedule_restart(
    config: &UpdaterConfig,
    request: ScheduleRequest,
    exec: Option<PathBuf>,
    args: Vec<OsString>,
) -> anyhow::Result<ExitCode> {
    let db = match Database::open(&config.paths.database) {
        Ok(db) => Arc::new(db),
        Err(e) => return emit::<()>(Err(e)),
    };
    let mut restart = RestartCoordinator::new(config.restart.clone()).with_database(db);
    if let Some(exe) = exec {
        restart = restart.with_command(exe, args);
    }
    let restart = Arc::new(restart);

    let scheduled = restart.schedule(request);
    let accepted = scheduled.is_ok();
    let code = emit(scheduled)?;
    if !accepted {
        return Ok(code);
    }
    follow_restart(&restart).await;
    Ok(ExitCode::SUCCESS)
}

/// Log the countdown until it ends; Ctrl+C asks for cancellation.
async fn follow_restart(restart: &Arc<RestartCoordinator>) {
    let mut updates = restart.subscribe();
    let watcher = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let status = updates.borrow_and_update().clone();
            if status.is_counting_down {
                info!(remaining = status.remaining_secs, can_cancel = status.can_cancel, "restart countdown");
            }
        }
    });

    let canceller = Arc::clone(restart);
    let ctrl_c = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match canceller.cancel() {
                Ok(_) => break,
                Err(e) => tracing::warn!(error = %e, "cannot cancel restart"),
            }
        }
    });

    match restart.wait().await {
        Some(RestartOutcome::Failed(message)) => tracing::error!(%message, "restart failed"),
        Some(outcome) => info!(?outcome, "restart countdown ended"),
        None => {}
    }
    ctrl_c.abort();
    watcher.abort();
}
