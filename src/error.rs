//! Error types for the updater.
//!
//! Each variant carries a stable error code (SCREAMING_SNAKE_CASE) that is
//! included in the Display output and accessible via [`UpdateError::code()`].
//! The route layer forwards these codes to clients unchanged.

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// Release feed or package download failed.
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";

    /// Size, checksum or archive structure mismatch.
    pub const INTEGRITY_ERROR: &str = "INTEGRITY_ERROR";

    /// Archive entry escapes the extraction root.
    pub const SECURITY_ERROR: &str = "SECURITY_ERROR";

    /// SQL failure while applying or reverting a migration.
    pub const MIGRATION_ERROR: &str = "MIGRATION_ERROR";

    /// Request rejected because of conflicting state.
    pub const CONFLICT_ERROR: &str = "CONFLICT_ERROR";

    /// Filesystem failure.
    pub const IO_ERROR: &str = "IO_ERROR";

    /// Invalid or unreadable configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// Database access failure outside a migration.
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";

    /// Process handoff failure.
    pub const RESTART_ERROR: &str = "RESTART_ERROR";
}

/// Top-level error type for the update and migration system.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Release feed or package download failure. Recoverable; no retry loop.
    #[error("[{}] {}", error_codes::NETWORK_ERROR, .0)]
    Network(String),

    /// Downloaded package failed size, checksum or archive validation.
    #[error("[{}] {}", error_codes::INTEGRITY_ERROR, .0)]
    Integrity(String),

    /// Archive entry resolved outside the quarantine directory.
    #[error("[{}] {}", error_codes::SECURITY_ERROR, .0)]
    Security(String),

    /// Migration SQL failed inside its transaction.
    #[error("[{}] migration {version} failed: {message}", error_codes::MIGRATION_ERROR)]
    Migration {
        /// Version of the migration that failed.
        version: String,
        /// Underlying failure.
        message: String,
    },

    /// Update already in progress, restart already scheduled, bad rollback target.
    #[error("[{}] {}", error_codes::CONFLICT_ERROR, .0)]
    Conflict(String),

    /// Filesystem error.
    #[error("[{}] {}", error_codes::IO_ERROR, .0)]
    Io(String),

    /// Configuration error.
    #[error("[{}] {}", error_codes::CONFIG_INVALID, .0)]
    Config(String),

    /// Database error outside a migration transaction.
    #[error("[{}] {}", error_codes::DATABASE_ERROR, .0)]
    Database(String),

    /// Restart scheduling or process handoff error.
    #[error("[{}] {}", error_codes::RESTART_ERROR, .0)]
    Restart(String),
}

impl UpdateError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => error_codes::NETWORK_ERROR,
            Self::Integrity(_) => error_codes::INTEGRITY_ERROR,
            Self::Security(_) => error_codes::SECURITY_ERROR,
            Self::Migration { .. } => error_codes::MIGRATION_ERROR,
            Self::Conflict(_) => error_codes::CONFLICT_ERROR,
            Self::Io(_) => error_codes::IO_ERROR,
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::Database(_) => error_codes::DATABASE_ERROR,
            Self::Restart(_) => error_codes::RESTART_ERROR,
        }
    }

    /// Returns the inner message without the code prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Network(m)
            | Self::Integrity(m)
            | Self::Security(m)
            | Self::Conflict(m)
            | Self::Io(m)
            | Self::Config(m)
            | Self::Database(m)
            | Self::Restart(m) => m,
            Self::Migration { message, .. } => message,
        }
    }

    /// Prefix the message with the phase it happened in, keeping the kind.
    #[must_use]
    pub fn with_phase(self, phase: &str) -> Self {
        match self {
            Self::Network(m) => Self::Network(format!("{phase}: {m}")),
            Self::Integrity(m) => Self::Integrity(format!("{phase}: {m}")),
            Self::Security(m) => Self::Security(format!("{phase}: {m}")),
            Self::Conflict(m) => Self::Conflict(format!("{phase}: {m}")),
            Self::Io(m) => Self::Io(format!("{phase}: {m}")),
            Self::Config(m) => Self::Config(format!("{phase}: {m}")),
            Self::Database(m) => Self::Database(format!("{phase}: {m}")),
            Self::Restart(m) => Self::Restart(format!("{phase}: {m}")),
            Self::Migration { version, message } => Self::Migration {
                version,
                message: format!("{phase}: {message}"),
            },
        }
    }

    /// Returns `true` if the failed attempt can simply be requested again.
    ///
    /// Network failures and conflicts are transient. Everything else needs an
    /// operator to look at the package, the filesystem or the schema first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Conflict(_))
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<rusqlite::Error> for UpdateError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdateError>;
