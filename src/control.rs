//! Control surface for operators
//!
//! The dashboard (or the CLI) uses [`ControlChannel`] to request a skip and
//! to read run progress and logs. The skip flag is the only run field with a
//! writer other than the coordinator; setting it is a single conditional
//! update on a RUNNING row.

use crate::state::{LogLevel, RunStatus};
use crate::storage::{LogRecord, RunRecord, Storage, StorageError};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors reported back to the operator
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is not running (status {status})")]
    NotRunning { run_id: String, status: RunStatus },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Read/write surface over the run tables
pub struct ControlChannel<S: Storage> {
    storage: Arc<Mutex<S>>,
}

impl<S: Storage> ControlChannel<S> {
    pub fn new(storage: Arc<Mutex<S>>) -> Self {
        Self { storage }
    }

    /// Asks a RUNNING run to stop at its next page boundary
    ///
    /// # Arguments
    ///
    /// * `run_id` - The run to skip
    /// * `requested_by` - Who asked, recorded in the run log
    /// * `reason` - Free-form reason, recorded in the run log
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The flag is set; the run will end SKIPPED within one page
    /// * `Err(ControlError::RunNotFound)` - No such run
    /// * `Err(ControlError::NotRunning)` - The run already ended; nothing changed
    pub fn request_skip(&self, run_id: &str, requested_by: &str, reason: &str) -> ControlResult<()> {
        let mut storage = self.storage.lock().map_err(|_| ControlError::LockPoisoned)?;

        let run = storage
            .get_run(run_id)?
            .ok_or_else(|| ControlError::RunNotFound(run_id.to_string()))?;

        if run.status != RunStatus::Running || !storage.request_skip(run_id)? {
            let status = storage
                .get_run(run_id)?
                .map(|r| r.status)
                .unwrap_or(run.status);
            return Err(ControlError::NotRunning {
                run_id: run_id.to_string(),
                status,
            });
        }

        let message = format!("Skip requested by {}: {}", requested_by, reason);
        tracing::info!(run_id = %run_id, "{}", message);
        storage.append_log(run_id, LogLevel::Warn, &message)?;
        Ok(())
    }

    /// Most recent runs, newest first
    pub fn recent_runs(&self, limit: u32) -> ControlResult<Vec<RunRecord>> {
        let storage = self.storage.lock().map_err(|_| ControlError::LockPoisoned)?;
        Ok(storage.list_recent_runs(limit)?)
    }

    /// Log entries of one run, newest first
    pub fn logs(&self, run_id: &str, limit: u32) -> ControlResult<Vec<LogRecord>> {
        let storage = self.storage.lock().map_err(|_| ControlError::LockPoisoned)?;
        if storage.get_run(run_id)?.is_none() {
            return Err(ControlError::RunNotFound(run_id.to_string()));
        }
        Ok(storage.list_logs(run_id, limit)?)
    }

    /// The run currently holding the RUNNING slot, if any
    pub fn active_run(&self) -> ControlResult<Option<RunRecord>> {
        let storage = self.storage.lock().map_err(|_| ControlError::LockPoisoned)?;
        Ok(storage.running_runs()?.into_iter().next())
    }
}
