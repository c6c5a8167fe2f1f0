//! Crawler module for fetching and ingesting marketplace listings
//!
//! This module contains the core crawling logic, including:
//! - Paced, robots-aware HTTP fetching with retry logic
//! - Listing and product page parsing
//! - Pagination for the NEW_SCAN and BACKFILL modes
//! - Run lifecycle coordination and stale run reaping

mod coordinator;
mod detail;
mod fetcher;
mod journal;
mod pager;
mod parser;
mod rate_limiter;
mod reaper;

pub use coordinator::RunCoordinator;
pub use detail::{normalize_age_rating, parse_detail};
pub use fetcher::{build_http_client, FetchClient, FetchError, RawPage};
pub use journal::RunJournal;
pub use pager::{page_url, PageCrawler, StopReason};
pub use parser::{
    item_id_from_url, parse_listing, parse_price_range, DroppedItem, ListingPage, ParseError,
};
pub use rate_limiter::RateLimiter;
pub use reaper::reap_stale_runs;
