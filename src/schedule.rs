//! Scheduling triggers
//!
//! Each trigger reaps stale runs and then tries to start a run. A trigger
//! that finds another run RUNNING, or that fires while the scheduler switch
//! is off, is a logged no-op rather than an error.
//!
//! [`Scheduler::run_until`] drives the two cadences from one task, so runs
//! from this process never overlap. Cadences are re-read from the settings
//! row after every trigger.

use crate::control::ControlChannel;
use crate::crawler::{reap_stale_runs, RunCoordinator};
use crate::state::RunMode;
use crate::storage::{RunRecord, Storage};
use crate::{IngestError, Result, ScraperSettings};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Result of one trigger
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    /// A run was started and reached a terminal state
    Finished(RunRecord),
    /// Another run held the RUNNING slot
    AlreadyRunning { run_id: String },
    /// The scheduler switch is off
    Disabled,
}

/// Fires NEW_SCAN and BACKFILL runs on their configured cadences
pub struct Scheduler<S: Storage> {
    coordinator: RunCoordinator<S>,
}

impl<S: Storage> Scheduler<S> {
    pub fn new(coordinator: RunCoordinator<S>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &RunCoordinator<S> {
        &self.coordinator
    }

    /// Scheduled trigger: honours the scheduler switch
    pub async fn trigger(&self, mode: RunMode) -> Result<TriggerOutcome> {
        // An unreadable settings row still gets a run, which then fails with
        // the validation error in its log.
        let enabled = match self.settings() {
            Ok(settings) => settings.scheduler_enabled,
            Err(e) => {
                tracing::warn!("Could not read scraper settings: {}", e);
                true
            }
        };

        if !enabled {
            tracing::info!("Scheduler disabled; {} trigger ignored", mode);
            return Ok(TriggerOutcome::Disabled);
        }

        self.run_now(mode).await
    }

    /// Manual trigger: reaps stale runs, then starts `mode` regardless of the
    /// scheduler switch
    pub async fn run_now(&self, mode: RunMode) -> Result<TriggerOutcome> {
        let threshold = self.coordinator.config().reaper.threshold();
        reap_stale_runs(self.coordinator.storage(), threshold, Utc::now())?;

        match self.coordinator.start(mode).await {
            Ok(run) => Ok(TriggerOutcome::Finished(run)),
            Err(IngestError::AlreadyRunning { run_id }) => {
                tracing::info!("{} trigger skipped: run {} is still RUNNING", mode, run_id);
                Ok(TriggerOutcome::AlreadyRunning { run_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Runs both cadences until `shutdown` resolves
    ///
    /// Both cadences fire once at startup, NEW_SCAN first. If `shutdown`
    /// resolves while a run is in progress, that run is asked to skip and is
    /// awaited, so it ends SKIPPED at its next page boundary.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let settings = self.settings()?;
        let mut new_scan = cadence(settings.new_scan_interval(), Instant::now());
        let mut backfill = cadence(settings.backfill_interval(), Instant::now());
        tracing::info!(
            "Scheduler started: NEW_SCAN every {} min, BACKFILL every {} min",
            settings.new_scan_interval_min,
            settings.backfill_interval_min
        );

        loop {
            let mode = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Scheduler shutting down");
                    return Ok(());
                }
                _ = new_scan.tick() => RunMode::NewScan,
                _ = backfill.tick() => RunMode::Backfill,
            };

            let trigger = self.trigger(mode);
            tokio::pin!(trigger);

            let outcome = tokio::select! {
                outcome = &mut trigger => outcome,
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested; skipping the active run");
                    self.skip_active_run()?;
                    report(mode, trigger.await);
                    return Ok(());
                }
            };
            report(mode, outcome);

            match self.settings() {
                Ok(settings) => {
                    refresh(&mut new_scan, settings.new_scan_interval());
                    refresh(&mut backfill, settings.backfill_interval());
                }
                Err(e) => tracing::warn!("Keeping current cadences: {}", e),
            }
        }
    }

    fn skip_active_run(&self) -> Result<()> {
        let control = ControlChannel::new(std::sync::Arc::clone(self.coordinator.storage()));
        if let Some(run) = control.active_run()? {
            control.request_skip(&run.run_id, "scheduler", "process shutdown")?;
        }
        Ok(())
    }

    fn settings(&self) -> Result<ScraperSettings> {
        let storage = self
            .coordinator
            .storage()
            .lock()
            .map_err(|_| IngestError::LockPoisoned)?;
        Ok(storage.read_config()?)
    }
}

fn cadence(period: Duration, start: Instant) -> Interval {
    let mut interval = interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Swaps in a new period, next tick one full period from now
fn refresh(interval: &mut Interval, period: Duration) {
    if interval.period() != period {
        tracing::info!("Cadence changed to {:?}", period);
        *interval = cadence(period, Instant::now() + period);
    }
}

fn report(mode: RunMode, outcome: Result<TriggerOutcome>) {
    match outcome {
        Ok(TriggerOutcome::Finished(run)) => tracing::info!(
            "{} run {} finished {} ({} pages, {} new products, {} errors)",
            mode,
            run.run_id,
            run.status,
            run.counters.pages_processed,
            run.counters.products_created,
            run.counters.error_count
        ),
        Ok(TriggerOutcome::AlreadyRunning { .. }) | Ok(TriggerOutcome::Disabled) => {}
        Err(e) => tracing::error!("{} trigger failed: {}", mode, e),
    }
}
