use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Market-Ingest
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    /// Seed values for the persisted scraper settings row
    #[serde(default)]
    pub schedule: ScraperSettings,
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler, also the robots.txt product token
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the full User-Agent header value
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// The marketplace being crawled
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// First page of the newest-listings view
    #[serde(rename = "listing-url")]
    pub listing_url: String,

    /// Cookie header sent with every request (e.g. to reveal age-gated listings)
    #[serde(default)]
    pub cookie: Option<String>,

    /// Fetch each item's detail page to enrich the listing data
    #[serde(rename = "fetch-details", default)]
    pub fetch_details: bool,
}

/// HTTP behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Per-request timeout in seconds
    #[serde(rename = "timeout-secs", default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per URL before giving up on transient failures
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(rename = "retry-backoff-ms", default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long a fetched robots.txt stays valid (minutes)
    #[serde(rename = "robots-ttl-min", default = "default_robots_ttl_min")]
    pub robots_ttl_min: u64,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            robots_ttl_min: default_robots_ttl_min(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_robots_ttl_min() -> u64 {
    60
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,
}

/// Stale run detection
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// A RUNNING run with no log activity for this long is considered orphaned
    #[serde(rename = "stale-after-min", default = "default_stale_after_min")]
    pub stale_after_min: u64,
}

impl ReaperConfig {
    pub fn threshold(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_after_min as i64)
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            stale_after_min: default_stale_after_min(),
        }
    }
}

fn default_stale_after_min() -> u64 {
    60
}

/// Operator-tunable scraper settings
///
/// Persisted as a singleton row so the dashboard can edit it; the `[schedule]`
/// table of the config file only seeds the row when it does not exist yet.
/// Every copy is bounds-checked before use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScraperSettings {
    #[serde(rename = "scheduler-enabled", default = "default_true")]
    pub scheduler_enabled: bool,

    #[serde(rename = "new-scan-interval-min", default = "default_new_scan_interval")]
    pub new_scan_interval_min: u32,

    #[serde(rename = "new-scan-page-limit", default = "default_new_scan_page_limit")]
    pub new_scan_page_limit: u32,

    #[serde(rename = "backfill-interval-min", default = "default_backfill_interval")]
    pub backfill_interval_min: u32,

    #[serde(rename = "backfill-pages-per-run", default = "default_backfill_pages")]
    pub backfill_pages_per_run: u32,

    #[serde(rename = "backfill-max-products", default = "default_backfill_max_products")]
    pub backfill_max_products: u32,

    #[serde(rename = "request-interval-ms", default = "default_request_interval_ms")]
    pub request_interval_ms: u64,
}

impl ScraperSettings {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn new_scan_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.new_scan_interval_min) * 60)
    }

    pub fn backfill_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.backfill_interval_min) * 60)
    }
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            new_scan_interval_min: default_new_scan_interval(),
            new_scan_page_limit: default_new_scan_page_limit(),
            backfill_interval_min: default_backfill_interval(),
            backfill_pages_per_run: default_backfill_pages(),
            backfill_max_products: default_backfill_max_products(),
            request_interval_ms: default_request_interval_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_new_scan_interval() -> u32 {
    10
}

fn default_new_scan_page_limit() -> u32 {
    3
}

fn default_backfill_interval() -> u32 {
    5
}

fn default_backfill_pages() -> u32 {
    3
}

fn default_backfill_max_products() -> u32 {
    9
}

fn default_request_interval_ms() -> u64 {
    5000
}
