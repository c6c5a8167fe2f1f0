//! Pagination driver for the two crawl modes
//!
//! One iteration handles one listing page: check the skip flag, fetch,
//! parse, upsert each item, then record counters and a per-page log entry.
//! Item- and page-level failures are absorbed here and only counted; an
//! `Err` returned from this module is always fatal to the run.
//!
//! The run row is re-read at every page boundary and before every cursor
//! write. Once another writer has moved the run out of RUNNING, the crawl
//! stops with [`IngestError::RunEnded`] and writes nothing further.

use crate::catalog::{ParsedItem, UpsertEngine};
use crate::config::{ScraperSettings, TargetConfig};
use crate::crawler::detail::parse_detail;
use crate::crawler::journal::RunJournal;
use crate::crawler::parser::parse_listing;
use crate::crawler::FetchClient;
use crate::state::{Cursor, RunMode, RunStatus};
use crate::storage::{RunCounters, RunRecord, Storage, StorageError};
use crate::{IngestError, Result};
use std::fmt;
use std::sync::{Arc, Mutex};
use url::Url;

/// Enriched items between progress entries within one page
const HEARTBEAT_EVERY: u32 = 10;

/// Why a crawl loop ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The mode's page budget was used up
    PageLimit,
    /// NEW_SCAN saw a page with no previously unseen items
    NoNewItems,
    /// BACKFILL reached its per-run product cap
    ProductCap,
    /// The last listing page was processed
    EndOfListing,
    /// The operator asked for a skip
    SkipRequested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PageLimit => "page limit reached",
            Self::NoNewItems => "page yielded no new items",
            Self::ProductCap => "product cap reached",
            Self::EndOfListing => "end of listing reached",
            Self::SkipRequested => "skip requested",
        };
        write!(f, "{}", text)
    }
}

/// What one successfully processed page contributed
#[derive(Debug, Clone, Default)]
struct PageResult {
    created: u32,
    has_next_page: bool,
    capped: bool,
    last_item_id: Option<String>,
}

/// Drives pagination for one run
pub struct PageCrawler<S: Storage> {
    storage: Arc<Mutex<S>>,
    fetcher: Arc<FetchClient>,
    journal: RunJournal<S>,
    upserter: UpsertEngine<S>,
    listing_url: Url,
    fetch_details: bool,
    settings: ScraperSettings,
    counters: RunCounters,
}

impl<S: Storage> PageCrawler<S> {
    pub fn new(
        storage: Arc<Mutex<S>>,
        fetcher: Arc<FetchClient>,
        journal: RunJournal<S>,
        target: &TargetConfig,
        settings: ScraperSettings,
    ) -> Result<Self> {
        Ok(Self {
            upserter: UpsertEngine::new(Arc::clone(&storage)),
            storage,
            fetcher,
            journal,
            listing_url: Url::parse(&target.listing_url)?,
            fetch_details: target.fetch_details,
            settings,
            counters: RunCounters::default(),
        })
    }

    /// Counters accumulated so far, also valid after a fatal error
    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    /// Runs the pagination loop for `mode` until a stop condition
    pub async fn crawl(&mut self, mode: RunMode) -> Result<StopReason> {
        match mode {
            RunMode::NewScan => self.new_scan().await,
            RunMode::Backfill => self.backfill().await,
        }
    }

    /// Pages 1..=limit of the newest listings, stopping at the first page
    /// that yields nothing new
    async fn new_scan(&mut self) -> Result<StopReason> {
        let limit = self.settings.new_scan_page_limit;

        for page in 1..=limit {
            if self.skip_requested()? {
                return Ok(StopReason::SkipRequested);
            }

            let Some(result) = self.process_page(page, None).await? else {
                continue;
            };

            if result.created == 0 {
                return Ok(StopReason::NoNewItems);
            }
            if !result.has_next_page {
                return Ok(StopReason::EndOfListing);
            }
        }

        Ok(StopReason::PageLimit)
    }

    /// Resumes from the persisted cursor for at most `pages_per_run` pages
    ///
    /// The cursor moves only past pages whose items were all upserted. After
    /// a page-level failure it stays put for the rest of the run so the next
    /// run retries that page.
    async fn backfill(&mut self) -> Result<StopReason> {
        let mut cursor = self.read_cursor()?;
        let first = cursor.next_page();
        let last = first.saturating_add(self.settings.backfill_pages_per_run.saturating_sub(1));
        let cap = self.settings.backfill_max_products;
        let mut cursor_frozen = false;

        self.journal.info(format!(
            "Backfill resuming at page {} (cursor {})",
            first, cursor.last_page_index
        ))?;

        for page in first..=last {
            if self.skip_requested()? {
                return Ok(StopReason::SkipRequested);
            }

            let Some(result) = self.process_page(page, Some(cap)).await? else {
                if !cursor_frozen {
                    self.journal.warn(format!(
                        "Cursor held at page {} until page {} succeeds",
                        cursor.last_page_index, page
                    ))?;
                }
                cursor_frozen = true;
                continue;
            };

            if !cursor_frozen {
                cursor = if result.has_next_page {
                    cursor.advanced_to(page, result.last_item_id.clone())
                } else {
                    self.journal
                        .info("Reached the last listing page; backfill will restart from page 1")?;
                    Cursor::start(RunMode::Backfill)
                };
                self.write_cursor(&cursor)?;
            }

            if result.capped {
                return Ok(StopReason::ProductCap);
            }
            if !result.has_next_page {
                return Ok(StopReason::EndOfListing);
            }
        }

        Ok(StopReason::PageLimit)
    }

    /// Fetches, parses and upserts one listing page
    ///
    /// Returns `Ok(None)` for a page-level failure (already logged and
    /// counted). `cap` stops upserting once the run's upsert count reaches it;
    /// a capped page still counts as fully processed.
    async fn process_page(&mut self, page: u32, cap: Option<u32>) -> Result<Option<PageResult>> {
        let url = self.page_url(page);

        let raw = match self.fetcher.fetch(&url).await {
            Ok(raw) => raw,
            Err(e) => {
                self.page_failed(page, &e.to_string())?;
                return Ok(None);
            }
        };

        let listing = match parse_listing(&raw) {
            Ok(listing) => listing,
            Err(e) => {
                self.page_failed(page, &e.to_string())?;
                return Ok(None);
            }
        };

        let mut result = PageResult {
            has_next_page: listing.has_next_page,
            ..PageResult::default()
        };
        let mut dropped = listing.dropped.len() as u32;
        let listed = listing.items.len();
        let mut enriched = 0u32;

        for item in &listing.dropped {
            self.counters.error_count += 1;
            self.journal.warn(format!(
                "Page {}: dropped item at position {}: {}",
                page, item.position, item.reason
            ))?;
        }

        for item in listing.items {
            if cap.is_some_and(|cap| self.counters.products_upserted >= cap) {
                break;
            }

            let item = if self.fetch_details {
                let enrichment = self.enrich(item).await;
                enriched += 1;
                // Detail fetches are slow; keep the heartbeat fresh mid-page
                if enriched % HEARTBEAT_EVERY == 0 {
                    self.live_run()?;
                    self.journal.info(format!(
                        "Page {}: {} of {} items enriched",
                        page, enriched, listed
                    ))?;
                }
                match enrichment {
                    Ok(item) => item,
                    Err(reason) => {
                        dropped += 1;
                        self.counters.error_count += 1;
                        self.journal.warn(format!("Page {}: {}", page, reason))?;
                        continue;
                    }
                }
            } else {
                item
            };

            let outcome = self.upserter.upsert(&item)?;
            self.counters.products_upserted += 1;
            if outcome.is_new() {
                self.counters.products_created += 1;
                result.created += 1;
            }
            result.last_item_id = Some(item.external_id);
        }

        result.capped = cap.is_some_and(|cap| self.counters.products_upserted >= cap);
        self.counters.pages_processed += 1;
        self.flush_counters()?;

        self.journal.info(format!(
            "Page {} processed: {} new, {} upserted so far, {} dropped{}",
            page,
            result.created,
            self.counters.products_upserted,
            dropped,
            if result.capped { " (product cap reached)" } else { "" }
        ))?;

        Ok(Some(result))
    }

    /// Replaces the listing entry with its detail page data
    async fn enrich(&self, item: ParsedItem) -> std::result::Result<ParsedItem, String> {
        let url = Url::parse(&item.source.url)
            .map_err(|e| format!("item {} has a bad URL: {}", item.external_id, e))?;

        let raw = self
            .fetcher
            .fetch(&url)
            .await
            .map_err(|e| format!("detail fetch for item {} failed: {}", item.external_id, e))?;

        parse_detail(&raw, &item).map_err(|e| format!("item {} dropped: {}", item.external_id, e))
    }

    fn page_failed(&mut self, page: u32, reason: &str) -> Result<()> {
        self.counters.error_count += 1;
        self.flush_counters()?;
        self.journal
            .error(format!("Page {} skipped after failure: {}", page, reason))
    }

    /// URL of listing page `page`; page 1 is the configured URL unchanged
    fn page_url(&self, page: u32) -> Url {
        page_url(&self.listing_url, page)
    }

    fn skip_requested(&self) -> Result<bool> {
        Ok(self.live_run()?.skip_requested)
    }

    /// The run row, provided it is still RUNNING
    fn live_run(&self) -> Result<RunRecord> {
        let storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
        load_live_run(&*storage, self.journal.run_id())
    }

    fn flush_counters(&self) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
        storage.update_run_counters(self.journal.run_id(), &self.counters)?;
        Ok(())
    }

    fn read_cursor(&self) -> Result<Cursor> {
        let storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
        Ok(storage.read_cursor(RunMode::Backfill)?)
    }

    /// Persists `cursor`, checking under the same lock that the run still
    /// owns it
    fn write_cursor(&self, cursor: &Cursor) -> Result<()> {
        let mut storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;
        load_live_run(&*storage, self.journal.run_id())?;
        storage.write_cursor(cursor)?;
        Ok(())
    }
}

fn load_live_run<S: Storage>(storage: &S, run_id: &str) -> Result<RunRecord> {
    let run = storage
        .get_run(run_id)?
        .ok_or_else(|| StorageError::RunNotFound(run_id.to_string()))?;

    if run.status != RunStatus::Running {
        tracing::warn!("Run {} is {}; abandoning the crawl", run_id, run.status);
        return Err(IngestError::RunEnded {
            run_id: run.run_id,
            status: run.status,
        });
    }
    Ok(run)
}

/// Sets the `page` query parameter, leaving page 1 without one
pub fn page_url(listing_url: &Url, page: u32) -> Url {
    let retained: Vec<(String, String)> = listing_url
        .query_pairs()
        .filter(|(key, _)| key != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = listing_url.clone();
    url.set_query(None);
    if !retained.is_empty() || page > 1 {
        let mut query = url.query_pairs_mut();
        for (key, value) in &retained {
            query.append_pair(key, value);
        }
        if page > 1 {
            query.append_pair("page", &page.to_string());
        }
    }
    url
}
