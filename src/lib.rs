//! Updraft: self-update and schema migration for long-running servers.
//!
//! An unattended process checks a release feed, downloads and verifies a new
//! build, migrates its SQLite schema, installs the package and restarts
//! itself after a cancellable countdown:
//!
//! ReleaseSource → ArtifactFetcher → BackupVault → MigrationEngine →
//! InstallStager → RestartCoordinator
//!
//! # Architecture
//!
//! - **Versions**: numeric dotted comparison in [`version`]
//! - **Feed**: GitHub-style release document via `reqwest` ([`update::release`])
//! - **Packages**: streamed download, SHA-256 and zip validation ([`update::fetcher`])
//! - **Backups**: zip archives of the install and `VACUUM INTO` snapshots ([`backup`])
//! - **Schema**: one transaction per migration, ledger in `schema_migrations` ([`migrate`])
//! - **Install**: quarantine extraction with path-escape checks ([`update::installer`])
//! - **Restart**: watch-channel countdown and detached process handoff ([`restart`])
//! - **Orchestration**: single-flight sessions with streamed progress ([`update::orchestrator`])

pub mod api;
pub mod app_dirs;
pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod restart;
pub mod update;
pub mod version;

pub use api::ApiResponse;
pub use backup::{BackupArtifact, BackupKind, BackupVault};
pub use config::UpdaterConfig;
pub use db::Database;
pub use error::{Result, UpdateError};
pub use migrate::{MigrationEngine, MigrationRecord, MigrationStatus};
pub use restart::{RestartCoordinator, RestartStatus, ScheduleRequest};
pub use update::{UpdateCheck, UpdateOrchestrator, UpdateProgress, UpdateRequest};
