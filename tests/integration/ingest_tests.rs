//! End-to-end crawl runs against a mocked marketplace.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use market_ingest::config::ScraperSettings;
use market_ingest::storage::{SqliteStorage, Storage};
use market_ingest::{RunMode, RunStatus};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::{
    allow_all_robots, card, config_with_details, coordinator, fast_settings, html, listing,
    listing_with_cards, memory_storage, mount_page, mount_page_expect, mount_robots, run_logs,
    test_config, transition_entry, FailActiveRun, FlakyStorage, REQUEST_INTERVAL_MS,
};

// =============================================================================
// NEW_SCAN
// =============================================================================

#[tokio::test]
async fn test_new_scan_stops_after_page_without_new_items() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2, 3, 4, 5], true))).await;
    mount_page(&server, 2, html(listing(&[1, 2, 3, 4, 5], true))).await;
    mount_page_expect(&server, 3, html(listing(&[6], true)), 0).await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.pages_processed, 2);
    assert_eq!(run.counters.products_created, 5);
    assert_eq!(run.counters.products_upserted, 10);
    assert_eq!(run.counters.error_count, 0);
    assert!(run.ended_at.is_some());
    assert_eq!(
        transition_entry(&storage, &run.run_id),
        "RUNNING -> COMPLETED: page yielded no new items"
    );
    assert_eq!(storage.lock().unwrap().count_products().unwrap(), 5);
}

#[tokio::test]
async fn test_new_scan_respects_page_limit() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2], true))).await;
    mount_page(&server, 2, html(listing(&[3, 4], true))).await;
    mount_page_expect(&server, 3, html(listing(&[5], true)), 0).await;

    let settings = ScraperSettings {
        new_scan_page_limit: 2,
        ..fast_settings()
    };
    let storage = memory_storage(&settings);
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.pages_processed, 2);
    assert_eq!(run.counters.products_created, 4);
    assert_eq!(
        transition_entry(&storage, &run.run_id),
        "RUNNING -> COMPLETED: page limit reached"
    );
}

#[tokio::test]
async fn test_new_scan_stops_at_last_page() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2], false))).await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.pages_processed, 1);
    assert_eq!(
        transition_entry(&storage, &run.run_id),
        "RUNNING -> COMPLETED: end of listing reached"
    );
}

#[tokio::test]
async fn test_transient_failures_cost_one_error_and_run_continues() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page_expect(&server, 1, ResponseTemplate::new(500), 3).await;
    mount_page(&server, 2, html(listing(&[1, 2, 3, 4, 5], true))).await;
    mount_page(&server, 3, html(listing(&[1, 2, 3, 4, 5], true))).await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.error_count, 1);
    assert_eq!(run.counters.pages_processed, 2);
    assert_eq!(run.counters.products_created, 5);

    let logs = run_logs(&storage, &run.run_id);
    assert!(logs
        .iter()
        .any(|entry| entry.message.starts_with("Page 1 skipped after failure")));
}

#[tokio::test]
async fn test_robots_denial_is_page_level() {
    let server = MockServer::start().await;
    mount_robots(&server, "User-agent: *\nDisallow: /items").await;
    mount_page_expect(&server, 1, html(listing(&[1], true)), 0).await;
    mount_page_expect(&server, 2, html(listing(&[2], true)), 0).await;

    let settings = ScraperSettings {
        new_scan_page_limit: 2,
        ..fast_settings()
    };
    let storage = memory_storage(&settings);
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.pages_processed, 0);
    assert_eq!(run.counters.error_count, 2);
    assert_eq!(storage.lock().unwrap().count_products().unwrap(), 0);
}

#[tokio::test]
async fn test_missing_robots_means_allow_all() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    mount_page(&server, 1, html(listing(&[1], false))).await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.counters.products_created, 1);
    assert_eq!(run.counters.error_count, 0);
}

#[tokio::test]
async fn test_dropped_cards_count_as_errors() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    let cards = format!(
        r#"{}<li class="item-card"><div class="item-card__title"><a href="/search">no id</a></div></li>{}"#,
        card(1, "Hat"),
        card(2, "Shoes")
    );
    mount_page(&server, 1, html(listing_with_cards(&cards, false))).await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.products_created, 2);
    assert_eq!(run.counters.error_count, 1);
}

#[tokio::test]
async fn test_requests_are_paced() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1], true))).await;
    mount_page(&server, 2, html(listing(&[2], true))).await;
    mount_page(&server, 3, html(listing(&[3], true))).await;

    let storage = memory_storage(&fast_settings());
    let started = Instant::now();
    let run = coordinator(storage, test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // robots.txt plus three pages: three full gaps between four requests
    assert_eq!(run.counters.pages_processed, 3);
    assert!(
        elapsed >= Duration::from_millis(3 * REQUEST_INTERVAL_MS),
        "four requests finished in {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_recrawl_preserves_user_fields() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2], false))).await;

    let storage = memory_storage(&fast_settings());
    let config = test_config(&server);
    coordinator(storage.clone(), config.clone())
        .start(RunMode::NewScan)
        .await
        .unwrap();

    let tags: BTreeSet<String> = ["cute", "winter"].iter().map(|t| t.to_string()).collect();
    {
        let mut guard = storage.lock().unwrap();
        assert!(guard.set_community_tags("1", &tags).unwrap());
        assert!(guard.set_curation_note("1", Some("staff pick")).unwrap());
    }

    server.reset().await;
    allow_all_robots(&server).await;
    let renamed = format!("{}{}", card(1, "Hat (restocked)"), card(2, "Item 2"));
    mount_page(&server, 1, html(listing_with_cards(&renamed, false))).await;

    let second = coordinator(storage.clone(), config)
        .start(RunMode::NewScan)
        .await
        .unwrap();
    assert_eq!(second.counters.products_created, 0);
    assert_eq!(second.counters.products_upserted, 2);

    let product = storage
        .lock()
        .unwrap()
        .find_product_by_external_id("1")
        .unwrap()
        .unwrap();
    assert_eq!(product.source.title, "Hat (restocked)");
    assert_eq!(product.user.community_tags, tags);
    assert_eq!(product.user.curation_note.as_deref(), Some("staff pick"));
}

#[tokio::test]
async fn test_detail_enrichment_and_item_level_drop() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2], false))).await;

    let detail = r#"<html><head><script type="application/ld+json">
        {"@type": "Product", "name": "Knit hat", "description": "Warm\n対象年齢：R-18",
         "offers": {"@type": "Offer", "price": "1200"}}
        </script></head><body>
        <h1 class="market-item-detail-item-title">Knit hat</h1>
        <a href="/tags/hat">hat</a>
        </body></html>"#;
    Mock::given(method("GET"))
        .and(path("/items/1"))
        .respond_with(html(detail.to_string()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items/2"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), config_with_details(&server, true))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.products_created, 1);
    assert_eq!(run.counters.error_count, 1);

    let guard = storage.lock().unwrap();
    let product = guard.find_product_by_external_id("1").unwrap().unwrap();
    assert_eq!(product.source.title, "Knit hat");
    assert_eq!(product.source.price_low, Some(1200));
    assert_eq!(product.source.official_tags, vec!["hat"]);
    assert_eq!(product.source.age_rating.as_deref(), Some("R-18"));
    assert!(guard.find_product_by_external_id("2").unwrap().is_none());
}

#[tokio::test]
async fn test_slow_enrichment_writes_progress_entries() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    let ids: Vec<u32> = (1..=12).collect();
    mount_page(&server, 1, html(listing(&ids, false))).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/items/\d+$"))
        .respond_with(html(
            r#"<h1 class="market-item-detail-item-title">Detailed</h1>"#.to_string(),
        ))
        .expect(12)
        .mount(&server)
        .await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), config_with_details(&server, true))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.products_created, 12);
    assert!(run_logs(&storage, &run.run_id)
        .iter()
        .any(|entry| entry.message == "Page 1: 10 of 12 items enriched"));
}

// =============================================================================
// BACKFILL
// =============================================================================

#[tokio::test]
async fn test_backfill_product_cap_stops_mid_page() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2, 3, 4, 5], true))).await;
    mount_page(&server, 2, html(listing(&[6, 7, 8, 9, 10], true))).await;
    mount_page_expect(&server, 3, html(listing(&[11], true)), 0).await;

    let settings = ScraperSettings {
        backfill_max_products: 9,
        ..fast_settings()
    };
    let storage = memory_storage(&settings);
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::Backfill)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.products_upserted, 9);
    assert_eq!(run.counters.pages_processed, 2);
    assert_eq!(
        transition_entry(&storage, &run.run_id),
        "RUNNING -> COMPLETED: product cap reached"
    );

    let guard = storage.lock().unwrap();
    assert!(guard.find_product_by_external_id("9").unwrap().is_some());
    assert!(guard.find_product_by_external_id("10").unwrap().is_none());

    let cursor = guard.read_cursor(RunMode::Backfill).unwrap();
    assert_eq!(cursor.last_page_index, 2);
    assert_eq!(cursor.last_seen_item_id.as_deref(), Some("9"));
}

#[tokio::test]
async fn test_backfill_resumes_after_cursor_across_runs() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page_expect(&server, 1, html(listing(&[1], true)), 1).await;
    mount_page_expect(&server, 2, html(listing(&[2], true)), 1).await;
    mount_page_expect(&server, 3, html(listing(&[3], true)), 1).await;

    let settings = ScraperSettings {
        backfill_pages_per_run: 2,
        ..fast_settings()
    };
    let storage = memory_storage(&settings);
    let config = test_config(&server);

    let first = coordinator(storage.clone(), config.clone())
        .start(RunMode::Backfill)
        .await
        .unwrap();
    assert_eq!(first.counters.pages_processed, 2);
    let after_first = storage.lock().unwrap().read_cursor(RunMode::Backfill).unwrap();
    assert_eq!(after_first.last_page_index, 2);

    // A later run, as after a process restart, picks up at page 3
    let mut settings = settings;
    settings.backfill_pages_per_run = 1;
    storage.lock().unwrap().write_config(&settings).unwrap();

    let second = coordinator(storage.clone(), config)
        .start(RunMode::Backfill)
        .await
        .unwrap();
    assert_eq!(second.counters.pages_processed, 1);
    let after_second = storage.lock().unwrap().read_cursor(RunMode::Backfill).unwrap();
    assert!(after_second.last_page_index > after_first.last_page_index);
    assert_eq!(after_second.last_seen_item_id.as_deref(), Some("3"));
}

#[tokio::test]
async fn test_backfill_end_of_listing_resets_cursor() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 2, html(listing(&[7, 8], false))).await;

    let storage = memory_storage(&fast_settings());
    storage
        .lock()
        .unwrap()
        .write_cursor(&market_ingest::Cursor::start(RunMode::Backfill).advanced_to(1, None))
        .unwrap();

    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::Backfill)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.pages_processed, 1);
    assert_eq!(
        transition_entry(&storage, &run.run_id),
        "RUNNING -> COMPLETED: end of listing reached"
    );
    let cursor = storage.lock().unwrap().read_cursor(RunMode::Backfill).unwrap();
    assert_eq!(cursor.last_page_index, 0);
}

#[tokio::test]
async fn test_backfill_page_failure_holds_cursor() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2], true))).await;
    mount_page_expect(&server, 2, ResponseTemplate::new(404), 1).await;
    mount_page(&server, 3, html(listing(&[5, 6], true))).await;

    let storage = memory_storage(&fast_settings());
    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::Backfill)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.error_count, 1);
    assert_eq!(run.counters.pages_processed, 2);
    assert_eq!(run.counters.products_upserted, 4);

    let guard = storage.lock().unwrap();
    assert!(guard.find_product_by_external_id("6").unwrap().is_some());
    let cursor = guard.read_cursor(RunMode::Backfill).unwrap();
    assert_eq!(cursor.last_page_index, 1);
    assert_eq!(cursor.last_seen_item_id.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_storage_failure_mid_page_fails_run_and_keeps_cursor() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    mount_page(&server, 1, html(listing(&[1, 2, 3, 4, 5], true))).await;
    mount_page(&server, 2, html(listing(&[6, 7, 8, 9, 10], true))).await;
    mount_page_expect(&server, 3, html(listing(&[11], true)), 0).await;

    let mut inner = SqliteStorage::new_in_memory().unwrap();
    inner.write_config(&fast_settings()).unwrap();
    let storage = Arc::new(Mutex::new(FlakyStorage::new(inner, 7)));

    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::Backfill)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counters.pages_processed, 1);
    assert_eq!(run.counters.products_upserted, 7);
    assert!(transition_entry(&storage, &run.run_id).contains("disk I/O error"));

    let guard = storage.lock().unwrap();
    let cursor = guard.read_cursor(RunMode::Backfill).unwrap();
    assert_eq!(cursor.last_page_index, 1);
    assert!(guard.running_runs().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_ended_elsewhere_stops_crawl_and_leaves_cursor() {
    let server = MockServer::start().await;
    allow_all_robots(&server).await;
    let storage = memory_storage(&fast_settings());
    mount_page(
        &server,
        1,
        FailActiveRun {
            storage: storage.clone(),
            response: html(listing(&[1, 2, 3], true)),
        },
    )
    .await;
    mount_page_expect(&server, 2, html(listing(&[4, 5, 6], true)), 0).await;
    mount_page_expect(&server, 3, html(listing(&[7, 8, 9], true)), 0).await;

    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::Backfill)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        transition_entry(&storage, &run.run_id),
        "RUNNING -> FAILED: reaped: no progress before threshold"
    );

    let guard = storage.lock().unwrap();
    let cursor = guard.read_cursor(RunMode::Backfill).unwrap();
    assert_eq!(cursor.last_page_index, 0);
    assert!(guard.find_product_by_external_id("4").unwrap().is_none());
    assert!(guard.running_runs().unwrap().is_empty());
}

#[tokio::test]
async fn test_out_of_bounds_settings_fail_the_run() {
    let server = MockServer::start().await;
    mount_page_expect(&server, 1, html(listing(&[1], false)), 0).await;

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ingest.db");
    let mut sqlite = SqliteStorage::new(&db_path).unwrap();
    sqlite.write_config(&fast_settings()).unwrap();

    // A hand-edited row that skips write-side validation
    rusqlite::Connection::open(&db_path)
        .unwrap()
        .execute("UPDATE scraper_config SET request_interval_ms = 5", [])
        .unwrap();
    let storage = Arc::new(Mutex::new(sqlite));

    let run = coordinator(storage.clone(), test_config(&server))
        .start(RunMode::NewScan)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(transition_entry(&storage, &run.run_id).contains("request"));
}
