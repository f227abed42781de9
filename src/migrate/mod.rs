//! Versioned schema migrations for the application database.
//!
//! Records are loaded from the built-in bootstrap plus `*.json` files in the
//! migrations directory, ordered by [`crate::version::compare_versions`], and
//! applied one transaction per record by [`MigrationEngine`].

pub mod engine;
pub mod record;
pub mod schema;

pub use engine::{
    MigrationEngine, MigrationStatus, MigrationStep, PendingMigration, SchemaHistoryEntry,
};
pub use record::MigrationRecord;
