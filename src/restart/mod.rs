//! Scheduled process restarts.

pub mod coordinator;
pub mod launcher;

pub use coordinator::{
    RestartCoordinator, RestartOutcome, RestartRecord, RestartStatus, ScheduleRequest, clamp_delay,
};
pub use launcher::{NoopShutdown, ProcessLauncher, ShutdownHook, platform_launcher};
