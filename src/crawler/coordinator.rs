//! Run coordinator - owns the lifecycle of a single crawl run
//!
//! A run is created RUNNING, drives the page crawler for its mode and ends in
//! exactly one terminal state:
//! - COMPLETED when the loop stops on its own (page limit, product cap, no
//!   new items, end of listing)
//! - SKIPPED when an operator skip was observed at a page boundary
//! - FAILED on any fatal error (storage, settings, client construction)
//!
//! Page- and item-level failures never end a run; they only raise its error
//! counter.

use crate::config::AppConfig;
use crate::crawler::journal::RunJournal;
use crate::crawler::pager::{PageCrawler, StopReason};
use crate::crawler::{FetchClient, RateLimiter};
use crate::state::{RunMode, RunStatus};
use crate::storage::{RunCounters, RunRecord, Storage, StorageError};
use crate::{IngestError, Result};
use std::sync::{Arc, Mutex};

/// Starts runs against one storage handle and one shared request clock
pub struct RunCoordinator<S: Storage> {
    storage: Arc<Mutex<S>>,
    config: AppConfig,
    config_hash: String,
    limiter: RateLimiter,
}

impl<S: Storage> RunCoordinator<S> {
    /// Creates a coordinator with its own request clock
    ///
    /// The clock's interval is replaced per run with the value from the
    /// settings row; only the timing of the last request carries over.
    pub fn new(storage: Arc<Mutex<S>>, config: AppConfig, config_hash: impl Into<String>) -> Self {
        let limiter = RateLimiter::new(config.schedule.request_interval());
        Self::with_limiter(storage, config, config_hash, limiter)
    }

    /// Creates a coordinator that paces requests on an existing clock
    pub fn with_limiter(
        storage: Arc<Mutex<S>>,
        config: AppConfig,
        config_hash: impl Into<String>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            storage,
            config,
            config_hash: config_hash.into(),
            limiter,
        }
    }

    pub fn storage(&self) -> &Arc<Mutex<S>> {
        &self.storage
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runs one crawl of `mode` to completion
    ///
    /// # Returns
    ///
    /// * `Ok(RunRecord)` - The run in its terminal state (COMPLETED, SKIPPED
    ///   or FAILED)
    /// * `Err(IngestError::AlreadyRunning)` - Another run holds the RUNNING
    ///   slot; no run was created
    /// * `Err(_)` - Storage failed so badly the run could not be finalized
    pub async fn start(&self, mode: RunMode) -> Result<RunRecord> {
        let run = {
            let mut storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
            storage
                .create_run(mode, &self.config_hash)
                .map_err(|e| match e {
                    StorageError::AlreadyRunning { run_id } => IngestError::AlreadyRunning { run_id },
                    other => IngestError::Storage(other),
                })?
        };

        let journal = RunJournal::new(run.run_id.clone(), Arc::clone(&self.storage));
        let mut counters = RunCounters::default();
        let outcome = match journal.info(format!("{} run started", mode)) {
            Ok(()) => self.execute(&journal, mode, &mut counters).await,
            Err(e) => Err(e),
        };

        let (status, reason) = match &outcome {
            Ok(StopReason::SkipRequested) => (RunStatus::Skipped, StopReason::SkipRequested.to_string()),
            Ok(stop) => (RunStatus::Completed, stop.to_string()),
            Err(e) => (RunStatus::Failed, e.to_string()),
        };

        journal.transition(status, &counters, &reason)?;
        tracing::info!(
            "Run {} ({}) ended {}: {} pages, {} upserted, {} new, {} errors",
            run.run_id,
            mode,
            status,
            counters.pages_processed,
            counters.products_upserted,
            counters.products_created,
            counters.error_count
        );

        let storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
        storage
            .get_run(&run.run_id)?
            .ok_or_else(|| IngestError::Storage(StorageError::RunNotFound(run.run_id.clone())))
    }

    /// Loads settings, builds the fetch client and drives the crawl loop
    async fn execute(
        &self,
        journal: &RunJournal<S>,
        mode: RunMode,
        counters: &mut RunCounters,
    ) -> Result<StopReason> {
        let settings = {
            let storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
            storage.read_config()?
        };

        let limiter = self.limiter.with_interval(settings.request_interval());
        let fetcher = Arc::new(FetchClient::new(&self.config, limiter)?);
        let mut crawler = PageCrawler::new(
            Arc::clone(&self.storage),
            fetcher,
            journal.clone(),
            &self.config.target,
            settings,
        )?;

        let result = crawler.crawl(mode).await;
        *counters = crawler.counters();
        result
    }
}
