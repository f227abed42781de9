//! Update state persistence.
//!
//! Tracks the auto-update preference, the last feed check and the history of
//! update sessions. Everything lives in the application database:
//! preferences in `system_config`, sessions in `update_history`.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::release::UpdateCheck;
use crate::db::Database;
use crate::error::{Result, UpdateError};

const AUTO_UPDATE_KEY: &str = "auto_update_enabled";
const LAST_CHECK_KEY: &str = "last_update_check";

/// How an update session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Failed,
}

impl SessionOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One finished update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateHistoryEntry {
    pub id: i64,
    pub session_id: String,
    pub from_version: String,
    pub to_version: String,
    pub status: String,
    pub message: String,
    pub finished_at: String,
}

/// Database-backed update state.
#[derive(Clone)]
pub struct UpdateStore {
    db: Arc<Database>,
    auto_update_default: bool,
}

impl UpdateStore {
    /// `auto_update_default` applies until the preference is first written.
    pub fn new(db: Arc<Database>, auto_update_default: bool) -> Self {
        Self {
            db,
            auto_update_default,
        }
    }

    /// Returns `true` if updates may be applied without an operator.
    ///
    /// # Errors
    ///
    /// Returns a database error if the preference cannot be read.
    pub fn auto_update_enabled(&self) -> Result<bool> {
        Ok(match self.db.get_config(AUTO_UPDATE_KEY)?.as_deref() {
            Some(value) => value == "true",
            None => self.auto_update_default,
        })
    }

    /// Persist the auto-update preference.
    ///
    /// # Errors
    ///
    /// Returns a database error if the preference cannot be written.
    pub fn set_auto_update(&self, enabled: bool) -> Result<()> {
        self.db
            .set_config(AUTO_UPDATE_KEY, if enabled { "true" } else { "false" })?;
        tracing::info!(enabled, "auto-update preference changed");
        Ok(())
    }

    /// Remember the outcome of a feed check.
    ///
    /// # Errors
    ///
    /// Returns an error if the check cannot be serialized or stored.
    pub fn record_check(&self, check: &UpdateCheck) -> Result<()> {
        let json = serde_json::to_string(check)
            .map_err(|e| UpdateError::Database(format!("cannot serialize update check: {e}")))?;
        self.db.set_config(LAST_CHECK_KEY, &json)
    }

    /// The most recent feed check, if any. A corrupt value reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the value cannot be read.
    pub fn last_check(&self) -> Result<Option<UpdateCheck>> {
        let Some(json) = self.db.get_config(LAST_CHECK_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(check) => Ok(Some(check)),
            Err(e) => {
                tracing::warn!(error = %e, "stored update check is unreadable, ignoring");
                Ok(None)
            }
        }
    }

    /// Returns `true` if no check happened within `interval_secs`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the last check cannot be read.
    pub fn check_is_stale(&self, interval_secs: u64) -> Result<bool> {
        let Some(check) = self.last_check()? else {
            return Ok(true);
        };
        let elapsed = Utc::now()
            .signed_duration_since(check.checked_at)
            .num_seconds();
        Ok(u64::try_from(elapsed).map_or(true, |secs| secs >= interval_secs))
    }

    /// Append a finished session to `update_history`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the row cannot be written.
    pub fn record_session(
        &self,
        session_id: &str,
        from_version: &str,
        to_version: &str,
        outcome: SessionOutcome,
        message: &str,
    ) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO update_history (session_id, from_version, to_version, status, message, finished_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                from_version,
                to_version,
                outcome.as_str(),
                message,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Most recent sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns a database error if the history cannot be read.
    pub fn update_history(&self, limit: usize) -> Result<Vec<UpdateHistoryEntry>> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, from_version, to_version, status, message, finished_at \
             FROM update_history ORDER BY id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(UpdateHistoryEntry {
                id: row.get(0)?,
                session_id: row.get(1)?,
                from_version: row.get(2)?,
                to_version: row.get(3)?,
                status: row.get(4)?,
                message: row.get(5)?,
                finished_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}
