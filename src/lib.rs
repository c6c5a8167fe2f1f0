//! Market-Ingest: the crawl engine behind a marketplace catalog
//!
//! This crate discovers and re-fetches product listings from a single
//! marketplace, normalizes them into canonical records and merges them into
//! storage without touching user-authored fields. It runs at most one crawl
//! at a time, paces every outbound request, resumes backfills across process
//! restarts and honors an operator-issued skip signal at page boundaries.

pub mod catalog;
pub mod config;
pub mod control;
pub mod crawler;
pub mod robots;
pub mod schedule;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Market-Ingest operations
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("Parse error: {0}")]
    Parse(#[from] crawler::ParseError),

    #[error("Control error: {0}")]
    Control(#[from] control::ControlError),

    #[error("A run is already in progress: {run_id}")]
    AlreadyRunning { run_id: String },

    #[error("Run {run_id} was ended by another writer ({status})")]
    RunEnded {
        run_id: String,
        status: state::RunStatus,
    },

    #[error("Invalid run transition: {from} -> {to}")]
    InvalidTransition {
        from: state::RunStatus,
        to: state::RunStatus,
    },

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Market-Ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::{AppConfig, ScraperSettings};
pub use state::{Cursor, RunMode, RunStatus};
