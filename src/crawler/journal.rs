//! Durable run log
//!
//! Each entry is written to the run's log table as it happens and mirrored
//! to `tracing` at the same level, so stdout and the dashboard tell the same
//! story. The newest entry doubles as the run's heartbeat for stale-run
//! detection.

use crate::state::{LogLevel, RunStatus};
use crate::storage::{RunCounters, Storage};
use crate::{IngestError, Result};
use std::sync::{Arc, Mutex};

/// Appends log entries for one run
pub struct RunJournal<S: Storage> {
    run_id: String,
    storage: Arc<Mutex<S>>,
}

impl<S: Storage> Clone for RunJournal<S> {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id.clone(),
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: Storage> RunJournal<S> {
    pub fn new(run_id: impl Into<String>, storage: Arc<Mutex<S>>) -> Self {
        Self {
            run_id: run_id.into(),
            storage,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn info(&self, message: impl AsRef<str>) -> Result<()> {
        self.record(LogLevel::Info, message.as_ref())
    }

    pub fn warn(&self, message: impl AsRef<str>) -> Result<()> {
        self.record(LogLevel::Warn, message.as_ref())
    }

    pub fn error(&self, message: impl AsRef<str>) -> Result<()> {
        self.record(LogLevel::Error, message.as_ref())
    }

    /// Writes one entry; a storage failure here is fatal to the run
    pub fn record(&self, level: LogLevel, message: &str) -> Result<()> {
        match level {
            LogLevel::Info => tracing::info!(run_id = %self.run_id, "{}", message),
            LogLevel::Warn => tracing::warn!(run_id = %self.run_id, "{}", message),
            LogLevel::Error => tracing::error!(run_id = %self.run_id, "{}", message),
        }

        let mut storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
        storage.append_log(&self.run_id, level, message)?;
        Ok(())
    }

    /// Moves the run out of RUNNING and logs the transition with `reason`
    ///
    /// # Returns
    ///
    /// `true` if this call performed the transition, `false` if another
    /// writer already ended the run (nothing is logged in that case)
    pub fn transition(&self, status: RunStatus, counters: &RunCounters, reason: &str) -> Result<bool> {
        if !RunStatus::Running.can_transition_to(status) {
            return Err(IngestError::InvalidTransition {
                from: RunStatus::Running,
                to: status,
            });
        }

        let changed = {
            let mut storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
            storage.update_run_status(&self.run_id, status, counters)?
        };

        if !changed {
            tracing::warn!(run_id = %self.run_id, "Run already ended; {} not applied", status);
            return Ok(false);
        }

        let level = match status {
            RunStatus::Failed => LogLevel::Error,
            _ => LogLevel::Info,
        };
        self.record(level, &format!("{} -> {}: {}", RunStatus::Running, status, reason))?;
        Ok(true)
    }
}
