//! Stale run detection
//!
//! A run left RUNNING by a crashed or killed process would block every later
//! run. Before each scheduled trigger, runs that started longer ago than the
//! threshold and have written no log entry since the cutoff are forced to
//! FAILED.

use crate::crawler::journal::RunJournal;
use crate::state::RunStatus;
use crate::storage::Storage;
use crate::{IngestError, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Transition reason recorded on every reaped run
const REAP_REASON: &str = "reaped: no progress before threshold";

/// Fails every RUNNING run that made no progress within `threshold` of `now`
///
/// # Arguments
///
/// * `storage` - Shared storage handle
/// * `threshold` - How long a run may go without a log entry
/// * `now` - Reference time, injectable for tests
///
/// # Returns
///
/// The ids of the runs this call moved to FAILED
pub fn reap_stale_runs<S: Storage>(
    storage: &Arc<Mutex<S>>,
    threshold: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let cutoff = now - threshold;
    let running = {
        let storage = storage.lock().map_err(|_| IngestError::LockPoisoned)?;
        storage.running_runs()?
    };

    let mut reaped = Vec::new();
    for run in running {
        if run.started_at >= cutoff {
            continue;
        }

        let last_activity = {
            let storage = storage.lock().map_err(|_| IngestError::LockPoisoned)?;
            storage.latest_log_time(&run.run_id)?
        };
        if last_activity.is_some_and(|at| at >= cutoff) {
            continue;
        }

        tracing::warn!(
            "Run {} silent for over {} minutes (last activity {})",
            run.run_id,
            threshold.num_minutes(),
            last_activity.unwrap_or(run.started_at).to_rfc3339()
        );
        let journal = RunJournal::new(run.run_id.clone(), Arc::clone(storage));
        if journal.transition(RunStatus::Failed, &run.counters, REAP_REASON)? {
            reaped.push(run.run_id);
        }
    }

    if !reaped.is_empty() {
        tracing::warn!("Reaped {} stale run(s)", reaped.len());
    }
    Ok(reaped)
}
