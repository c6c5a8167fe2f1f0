//! Configuration module for Market-Ingest
//!
//! Static settings (user agent, target, storage path) come from a TOML file.
//! Operator-tunable pacing and limits live in [`ScraperSettings`], which is
//! persisted as a singleton row and bounds-checked every time it is read.
//!
//! # Example
//!
//! ```no_run
//! use market_ingest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("ingest.toml")).unwrap();
//! println!("Crawling {}", config.target.listing_url);
//! ```

mod parser;
mod types;
mod validation;

pub use types::{
    AppConfig, FetchConfig, ReaperConfig, ScraperSettings, StorageConfig, TargetConfig,
    UserAgentConfig,
};

pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::{
    validate_settings, MAX_INTERVAL_MIN, MAX_PAGE_LIMIT, MAX_REQUEST_INTERVAL_MS,
    MIN_REQUEST_INTERVAL_MS,
};
