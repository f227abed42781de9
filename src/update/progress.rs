//! Update progress reporting.
//!
//! Two delivery paths: a bounded channel for stream subscribers, where a
//! full buffer drops the new update instead of blocking the pipeline, and an
//! always-overwritten snapshot for pollers, which therefore never miss the
//! current state.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

/// Default capacity of the progress channel.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 100;

/// Phase of an update session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    #[default]
    Idle,
    Preparing,
    Downloading,
    Verifying,
    Backup,
    Migrating,
    Installing,
    Restarting,
    Completed,
    Failed,
}

impl UpdatePhase {
    /// `true` once the session has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Backup => "backup",
            Self::Migrating => "migrating",
            Self::Installing => "installing",
            Self::Restarting => "restarting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateProgress {
    pub status: UpdatePhase,
    pub message: String,
    /// 0.0 to 100.0 within the whole session.
    pub percent: f64,
    /// Package size in bytes, when known.
    pub total_size: u64,
    /// Bytes downloaded so far.
    pub downloaded: u64,
    /// Bytes per second.
    pub speed: u64,
    /// Estimated seconds remaining for the download.
    pub eta_secs: u64,
}

impl UpdateProgress {
    pub fn new(status: UpdatePhase, message: impl Into<String>, percent: f64) -> Self {
        Self {
            status,
            message: message.into(),
            percent,
            ..Self::default()
        }
    }
}

/// Producer side, cheap to clone into background tasks.
#[derive(Clone)]
pub struct ProgressReporter {
    snapshot: Arc<Mutex<UpdateProgress>>,
    tx: mpsc::Sender<UpdateProgress>,
}

impl ProgressReporter {
    /// Reporter plus the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<UpdateProgress>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                snapshot: Arc::new(Mutex::new(UpdateProgress::default())),
                tx,
            },
            rx,
        )
    }

    /// Overwrite the snapshot and offer the update to subscribers.
    ///
    /// Never blocks: if the channel is full or closed the update is dropped
    /// for subscribers only.
    pub fn publish(&self, progress: UpdateProgress) {
        if let Ok(mut guard) = self.snapshot.lock() {
            if guard.status != progress.status {
                tracing::info!(
                    phase = %progress.status,
                    percent = progress.percent,
                    message = %progress.message,
                    "update phase"
                );
            }
            *guard = progress.clone();
        }
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(progress) {
            tracing::trace!(phase = %dropped.status, "progress channel full, dropping update");
        }
    }

    /// Shorthand for a phase boundary report.
    pub fn phase(&self, status: UpdatePhase, message: impl Into<String>, percent: f64) {
        self.publish(UpdateProgress::new(status, message, percent));
    }

    /// Latest published progress.
    pub fn snapshot(&self) -> UpdateProgress {
        self.snapshot
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}
