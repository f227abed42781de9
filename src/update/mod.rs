//! Self-update pipeline.
//!
//! Reads the release feed, downloads and verifies the package, and installs
//! it through a quarantine directory. [`UpdateOrchestrator`] sequences the
//! phases together with schema migrations, backups and the restart
//! countdown.

pub mod fetcher;
pub mod installer;
pub mod integrity;
pub mod orchestrator;
pub mod progress;
pub mod release;
pub mod state;

pub use fetcher::ArtifactFetcher;
pub use installer::{InstallMethod, InstallReport, InstallStager};
pub use orchestrator::{UpdateOrchestrator, UpdateRequest, UpdateSession};
pub use progress::{ProgressReporter, UpdatePhase, UpdateProgress};
pub use release::{ReleaseDescriptor, ReleaseSource, UpdateCheck};
pub use state::{SessionOutcome, UpdateHistoryEntry, UpdateStore};
