//! Storage module for persisting runs, logs, cursors and products
//!
//! This module handles all database operations for the ingest engine:
//! - SQLite database initialization and schema management
//! - Run rows, their counters and the skip flag
//! - The append-only run log
//! - Per-mode pagination cursors
//! - Canonical products (source-owned columns only from the crawler)
//! - The singleton scraper settings row

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::{LogLevel, RunMode, RunStatus};
use crate::IngestError;
use chrono::{DateTime, Utc};

use std::path::Path;

/// Initializes or opens a storage database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStorage)` - Successfully initialized storage
/// * `Err(IngestError)` - Failed to initialize storage
pub fn open_storage(path: &Path) -> Result<SqliteStorage, IngestError> {
    Ok(SqliteStorage::new(path)?)
}

/// Represents one crawl attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    /// Absent while the run is RUNNING
    pub ended_at: Option<DateTime<Utc>>,
    pub skip_requested: bool,
    pub counters: RunCounters,
    pub config_hash: String,
}

/// Monotonically non-decreasing progress counters of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub pages_processed: u32,
    pub products_upserted: u32,
    pub products_created: u32,
    pub error_count: u32,
}

/// Represents an entry of the append-only run log
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub id: i64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}
