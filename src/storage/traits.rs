//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::catalog::{CanonicalProduct, ParsedItem};
use crate::config::ScraperSettings;
use crate::state::{Cursor, LogLevel, RunMode, RunStatus};
use crate::storage::{LogRecord, RunCounters, RunRecord};
use crate::ConfigError;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("A run is already in progress: {run_id}")]
    AlreadyRunning { run_id: String },

    #[error("Scraper settings row is missing")]
    SettingsMissing,

    #[error("Invalid scraper settings: {0}")]
    InvalidSettings(#[from] ConfigError),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// This trait defines every persistence operation the ingest engine needs.
/// The crawler is the single writer of run rows except for the skip flag,
/// which the control surface may set at any time while a run is RUNNING.
pub trait Storage {
    // ===== Run Management =====

    /// Creates a new RUNNING run started at `started_at`
    ///
    /// # Returns
    ///
    /// The created run, or `StorageError::AlreadyRunning` carrying the id of
    /// the run that currently holds the RUNNING slot
    fn create_run_at(
        &mut self,
        mode: RunMode,
        config_hash: &str,
        started_at: DateTime<Utc>,
    ) -> StorageResult<RunRecord>;

    /// Creates a new RUNNING run started now
    fn create_run(&mut self, mode: RunMode, config_hash: &str) -> StorageResult<RunRecord> {
        self.create_run_at(mode, config_hash, Utc::now())
    }

    /// Gets a run by ID
    fn get_run(&self, run_id: &str) -> StorageResult<Option<RunRecord>>;

    /// Gets every run currently marked RUNNING
    fn running_runs(&self) -> StorageResult<Vec<RunRecord>>;

    /// Lists the most recent runs, newest first
    fn list_recent_runs(&self, limit: u32) -> StorageResult<Vec<RunRecord>>;

    /// Stores the counters of a RUNNING run
    ///
    /// Counters never decrease; a lower value than the stored one is ignored.
    fn update_run_counters(&mut self, run_id: &str, counters: &RunCounters) -> StorageResult<()>;

    /// Moves a RUNNING run to a terminal status and stamps its end time
    ///
    /// # Returns
    ///
    /// `true` if the transition happened, `false` if the run was no longer
    /// RUNNING (terminal rows are never overwritten)
    fn update_run_status(
        &mut self,
        run_id: &str,
        status: RunStatus,
        counters: &RunCounters,
    ) -> StorageResult<bool>;

    /// Atomically sets the skip flag of a RUNNING run
    ///
    /// Returns `false` when the run does not exist or is not RUNNING.
    fn request_skip(&mut self, run_id: &str) -> StorageResult<bool>;

    // ===== Run Log =====

    /// Appends a log entry with an explicit timestamp
    fn append_log_at(
        &mut self,
        run_id: &str,
        level: LogLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Appends a log entry stamped now
    fn append_log(&mut self, run_id: &str, level: LogLevel, message: &str) -> StorageResult<()> {
        self.append_log_at(run_id, level, message, Utc::now())
    }

    /// Lists the log entries of a run, newest first
    fn list_logs(&self, run_id: &str, limit: u32) -> StorageResult<Vec<LogRecord>>;

    /// Gets the timestamp of the newest log entry of a run
    fn latest_log_time(&self, run_id: &str) -> StorageResult<Option<DateTime<Utc>>>;

    // ===== Scraper Settings =====

    /// Reads the singleton settings row, validating its bounds
    fn read_config(&self) -> StorageResult<ScraperSettings>;

    /// Replaces the singleton settings row after validating its bounds
    fn write_config(&mut self, settings: &ScraperSettings) -> StorageResult<()>;

    /// Writes `settings` only if no row exists yet
    ///
    /// Returns `true` if the row was created.
    fn seed_config(&mut self, settings: &ScraperSettings) -> StorageResult<bool>;

    // ===== Products =====

    /// Looks a product up by its marketplace item id
    fn find_product_by_external_id(
        &self,
        external_id: &str,
    ) -> StorageResult<Option<CanonicalProduct>>;

    /// Inserts a product or overwrites its source-owned columns
    ///
    /// User-owned columns are never part of this write.
    fn upsert_product(&mut self, item: &ParsedItem) -> StorageResult<()>;

    /// Replaces the community tag set of a product (admin edit)
    fn set_community_tags(
        &mut self,
        external_id: &str,
        tags: &BTreeSet<String>,
    ) -> StorageResult<bool>;

    /// Replaces the curation note of a product (admin edit)
    fn set_curation_note(&mut self, external_id: &str, note: Option<&str>)
        -> StorageResult<bool>;

    /// Counts stored products
    fn count_products(&self) -> StorageResult<u64>;

    // ===== Cursors =====

    /// Reads the cursor of a mode, or a start cursor if none was written yet
    fn read_cursor(&self, mode: RunMode) -> StorageResult<Cursor>;

    /// Persists the cursor of a mode
    fn write_cursor(&mut self, cursor: &Cursor) -> StorageResult<()>;
}
