//! Shared fixtures for the integration tests.
//!
//! A wiremock server stands in for the marketplace: robots.txt, listing
//! pages addressed by the `page` query parameter, and optional detail pages.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use market_ingest::catalog::{CanonicalProduct, ParsedItem};
use market_ingest::config::{parse_config, AppConfig, ScraperSettings};
use market_ingest::crawler::RunCoordinator;
use market_ingest::state::LogLevel;
use market_ingest::storage::{
    LogRecord, RunCounters, RunRecord, SqliteStorage, Storage, StorageError, StorageResult,
};
use market_ingest::{Cursor, RunMode, RunStatus};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Robots product token used by every test config
pub const AGENT: &str = "TestIngest";

/// Pacing used in tests; the lowest value the settings bounds allow
pub const REQUEST_INTERVAL_MS: u64 = 100;

pub fn test_config(server: &MockServer) -> AppConfig {
    config_with_details(server, false)
}

pub fn config_with_details(server: &MockServer, fetch_details: bool) -> AppConfig {
    parse_config(&format!(
        r#"
[user-agent]
crawler-name = "{agent}"
crawler-version = "0.1.0"
contact-url = "https://example.com/about"
contact-email = "ops@example.com"

[target]
listing-url = "{uri}/items"
fetch-details = {fetch_details}

[fetch]
timeout-secs = 5
max-attempts = 3
retry-backoff-ms = 10

[storage]
database-path = ":memory:"
"#,
        agent = AGENT,
        uri = server.uri(),
        fetch_details = fetch_details,
    ))
    .expect("test config should parse")
}

/// Fast pacing with generous limits; tests override what they exercise
pub fn fast_settings() -> ScraperSettings {
    ScraperSettings {
        request_interval_ms: REQUEST_INTERVAL_MS,
        new_scan_page_limit: 3,
        backfill_pages_per_run: 3,
        backfill_max_products: 100,
        ..ScraperSettings::default()
    }
}

pub fn memory_storage(settings: &ScraperSettings) -> Arc<Mutex<SqliteStorage>> {
    let mut storage = SqliteStorage::new_in_memory().expect("in-memory database");
    storage.write_config(settings).expect("settings within bounds");
    Arc::new(Mutex::new(storage))
}

pub fn coordinator<S: Storage>(storage: Arc<Mutex<S>>, config: AppConfig) -> RunCoordinator<S> {
    RunCoordinator::new(storage, config, "test-config-hash")
}

// =============================================================================
// Marketplace fixtures
// =============================================================================

pub fn card(id: u32, title: &str) -> String {
    format!(
        r#"<li class="item-card" data-product-id="{id}" data-product-price="{price}" data-product-brand="Shop {id}">
             <div class="item-card__title"><a href="/items/{id}">{title}</a></div>
           </li>"#,
        id = id,
        price = id * 100,
        title = title,
    )
}

/// A listing page with one card per id, titled `Item <id>`
pub fn listing(ids: &[u32], has_next: bool) -> String {
    let cards: Vec<String> = ids.iter().map(|id| card(*id, &format!("Item {}", id))).collect();
    listing_with_cards(&cards.concat(), has_next)
}

pub fn listing_with_cards(cards: &str, has_next: bool) -> String {
    let pager = if has_next {
        r#"<div class="pager"><span class="next"><a href="?page=next">Next</a></span></div>"#
    } else {
        ""
    };
    format!(
        r#"<html><body><ul class="l-market-grid">{}</ul>{}</body></html>"#,
        cards, pager
    )
}

pub async fn mount_robots(server: &MockServer, body: &str) {
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

pub async fn allow_all_robots(server: &MockServer) {
    mount_robots(server, "User-agent: *\nAllow: /").await;
}

fn without_page_param(request: &Request) -> bool {
    !request.url.query_pairs().any(|(key, _)| key == "page")
}

/// Serves `response` for listing page `page`; page 1 carries no `page` param
pub async fn mount_page(server: &MockServer, page: u32, response: impl Respond + 'static) {
    listing_mock(page, response).mount(server).await;
}

/// Like [`mount_page`] but fails the test unless hit exactly `times` times
pub async fn mount_page_expect(server: &MockServer, page: u32, response: ResponseTemplate, times: u64) {
    listing_mock(page, response).expect(times).mount(server).await;
}

fn listing_mock(page: u32, response: impl Respond + 'static) -> Mock {
    let mock = Mock::given(method("GET")).and(path("/items"));
    let mock = if page == 1 {
        mock.and(without_page_param)
    } else {
        mock.and(query_param("page", page.to_string()))
    };
    mock.respond_with(response)
}

pub fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(body)
}

/// Serves `response` after failing whichever run is RUNNING, the way a
/// reaper in another process would
pub struct FailActiveRun {
    pub storage: Arc<Mutex<SqliteStorage>>,
    pub response: ResponseTemplate,
}

impl Respond for FailActiveRun {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let mut storage = self.storage.lock().unwrap();
        for run in storage.running_runs().unwrap() {
            assert!(storage
                .update_run_status(&run.run_id, RunStatus::Failed, &run.counters)
                .unwrap());
            storage
                .append_log(
                    &run.run_id,
                    LogLevel::Error,
                    "RUNNING -> FAILED: reaped: no progress before threshold",
                )
                .unwrap();
        }
        self.response.clone()
    }
}

// =============================================================================
// Assertions
// =============================================================================

pub fn run_logs<S: Storage>(storage: &Arc<Mutex<S>>, run_id: &str) -> Vec<LogRecord> {
    storage.lock().unwrap().list_logs(run_id, 500).unwrap()
}

/// Asserts the run has exactly one transition entry and returns it
pub fn transition_entry<S: Storage>(storage: &Arc<Mutex<S>>, run_id: &str) -> String {
    let transitions: Vec<String> = run_logs(storage, run_id)
        .into_iter()
        .map(|entry| entry.message)
        .filter(|message| message.starts_with("RUNNING -> "))
        .collect();
    assert_eq!(transitions.len(), 1, "transitions: {:?}", transitions);
    transitions.into_iter().next().unwrap_or_default()
}

// =============================================================================
// FlakyStorage
// =============================================================================

/// SQLite storage whose product writes start failing after a set number of
/// successful upserts
pub struct FlakyStorage {
    inner: SqliteStorage,
    upserts_left: usize,
}

impl FlakyStorage {
    pub fn new(inner: SqliteStorage, upserts_before_failure: usize) -> Self {
        Self {
            inner,
            upserts_left: upserts_before_failure,
        }
    }
}

impl Storage for FlakyStorage {
    fn create_run_at(
        &mut self,
        mode: RunMode,
        config_hash: &str,
        started_at: DateTime<Utc>,
    ) -> StorageResult<RunRecord> {
        self.inner.create_run_at(mode, config_hash, started_at)
    }

    fn get_run(&self, run_id: &str) -> StorageResult<Option<RunRecord>> {
        self.inner.get_run(run_id)
    }

    fn running_runs(&self) -> StorageResult<Vec<RunRecord>> {
        self.inner.running_runs()
    }

    fn list_recent_runs(&self, limit: u32) -> StorageResult<Vec<RunRecord>> {
        self.inner.list_recent_runs(limit)
    }

    fn update_run_counters(&mut self, run_id: &str, counters: &RunCounters) -> StorageResult<()> {
        self.inner.update_run_counters(run_id, counters)
    }

    fn update_run_status(
        &mut self,
        run_id: &str,
        status: RunStatus,
        counters: &RunCounters,
    ) -> StorageResult<bool> {
        self.inner.update_run_status(run_id, status, counters)
    }

    fn request_skip(&mut self, run_id: &str) -> StorageResult<bool> {
        self.inner.request_skip(run_id)
    }

    fn append_log_at(
        &mut self,
        run_id: &str,
        level: LogLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.append_log_at(run_id, level, message, timestamp)
    }

    fn list_logs(&self, run_id: &str, limit: u32) -> StorageResult<Vec<LogRecord>> {
        self.inner.list_logs(run_id, limit)
    }

    fn latest_log_time(&self, run_id: &str) -> StorageResult<Option<DateTime<Utc>>> {
        self.inner.latest_log_time(run_id)
    }

    fn read_config(&self) -> StorageResult<ScraperSettings> {
        self.inner.read_config()
    }

    fn write_config(&mut self, settings: &ScraperSettings) -> StorageResult<()> {
        self.inner.write_config(settings)
    }

    fn seed_config(&mut self, settings: &ScraperSettings) -> StorageResult<bool> {
        self.inner.seed_config(settings)
    }

    fn find_product_by_external_id(
        &self,
        external_id: &str,
    ) -> StorageResult<Option<CanonicalProduct>> {
        self.inner.find_product_by_external_id(external_id)
    }

    fn upsert_product(&mut self, item: &ParsedItem) -> StorageResult<()> {
        if self.upserts_left == 0 {
            return Err(StorageError::Database("disk I/O error".to_string()));
        }
        self.upserts_left -= 1;
        self.inner.upsert_product(item)
    }

    fn set_community_tags(
        &mut self,
        external_id: &str,
        tags: &BTreeSet<String>,
    ) -> StorageResult<bool> {
        self.inner.set_community_tags(external_id, tags)
    }

    fn set_curation_note(&mut self, external_id: &str, note: Option<&str>) -> StorageResult<bool> {
        self.inner.set_curation_note(external_id, note)
    }

    fn count_products(&self) -> StorageResult<u64> {
        self.inner.count_products()
    }

    fn read_cursor(&self, mode: RunMode) -> StorageResult<Cursor> {
        self.inner.read_cursor(mode)
    }

    fn write_cursor(&mut self, cursor: &Cursor) -> StorageResult<()> {
        self.inner.write_cursor(cursor)
    }
}
