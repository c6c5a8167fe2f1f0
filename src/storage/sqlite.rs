//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::catalog::{CanonicalProduct, ParsedItem, SourceFields, UserFields};
use crate::config::{validate_settings, ScraperSettings};
use crate::state::{Cursor, LogLevel, RunMode, RunStatus};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{LogRecord, RunCounters, RunRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use uuid::Uuid;

const RUN_COLUMNS: &str = "run_id, mode, status, started_at, ended_at, skip_requested,
     pages_processed, products_upserted, products_created, error_count, config_hash";

const PRODUCT_COLUMNS: &str = "external_id, url, title, description, price_low, price_high,
     image_urls, official_tags, shop_name, shop_url, age_rating, community_tags,
     curation_note, created_at, updated_at";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        // WAL lets the dashboard read while a run writes
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn query_runs(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> StorageResult<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, RawRun::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRun::into_record).collect()
    }

    fn holder_of_running_slot(&self) -> StorageResult<String> {
        Ok(self
            .running_runs()?
            .into_iter()
            .next()
            .map(|run| run.run_id)
            .unwrap_or_default())
    }
}

/// Formats a timestamp the way every column in this database stores it
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::CorruptRow(format!("bad timestamp '{}': {}", s, e)))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Run row as stored, before enum and timestamp decoding
struct RawRun {
    run_id: String,
    mode: String,
    status: String,
    started_at: String,
    ended_at: Option<String>,
    skip_requested: bool,
    counters: RunCounters,
    config_hash: String,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            mode: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            skip_requested: row.get(5)?,
            counters: RunCounters {
                pages_processed: row.get(6)?,
                products_upserted: row.get(7)?,
                products_created: row.get(8)?,
                error_count: row.get(9)?,
            },
            config_hash: row.get(10)?,
        })
    }

    fn into_record(self) -> StorageResult<RunRecord> {
        let mode = RunMode::from_db_string(&self.mode)
            .ok_or_else(|| StorageError::CorruptRow(format!("unknown run mode '{}'", self.mode)))?;
        let status = RunStatus::from_db_string(&self.status).ok_or_else(|| {
            StorageError::CorruptRow(format!("unknown run status '{}'", self.status))
        })?;
        let ended_at = match self.ended_at {
            Some(s) => Some(parse_ts(&s)?),
            None => None,
        };

        Ok(RunRecord {
            run_id: self.run_id,
            mode,
            status,
            started_at: parse_ts(&self.started_at)?,
            ended_at,
            skip_requested: self.skip_requested,
            counters: self.counters,
            config_hash: self.config_hash,
        })
    }
}

/// Product row as stored, before JSON and timestamp decoding
struct RawProduct {
    external_id: String,
    url: String,
    title: String,
    description: String,
    price_low: Option<i64>,
    price_high: Option<i64>,
    image_urls: String,
    official_tags: String,
    shop_name: String,
    shop_url: String,
    age_rating: Option<String>,
    community_tags: String,
    curation_note: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawProduct {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            external_id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            price_low: row.get(4)?,
            price_high: row.get(5)?,
            image_urls: row.get(6)?,
            official_tags: row.get(7)?,
            shop_name: row.get(8)?,
            shop_url: row.get(9)?,
            age_rating: row.get(10)?,
            community_tags: row.get(11)?,
            curation_note: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_product(self) -> StorageResult<CanonicalProduct> {
        Ok(CanonicalProduct {
            external_id: self.external_id,
            source: SourceFields {
                url: self.url,
                title: self.title,
                description: self.description,
                price_low: self.price_low,
                price_high: self.price_high,
                image_urls: serde_json::from_str(&self.image_urls)?,
                official_tags: serde_json::from_str(&self.official_tags)?,
                shop_name: self.shop_name,
                shop_url: self.shop_url,
                age_rating: self.age_rating,
            },
            user: UserFields {
                community_tags: serde_json::from_str(&self.community_tags)?,
                curation_note: self.curation_note,
            },
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run_at(
        &mut self,
        mode: RunMode,
        config_hash: &str,
        started_at: DateTime<Utc>,
    ) -> StorageResult<RunRecord> {
        // Optimistic check first; the partial unique index catches any race
        if let Some(existing) = self.running_runs()?.into_iter().next() {
            return Err(StorageError::AlreadyRunning {
                run_id: existing.run_id,
            });
        }

        let run_id = Uuid::new_v4().to_string();
        let inserted = self.conn.execute(
            "INSERT INTO runs (run_id, mode, status, started_at, config_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                mode.to_db_string(),
                RunStatus::Running.to_db_string(),
                format_ts(started_at),
                config_hash
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(StorageError::AlreadyRunning {
                    run_id: self.holder_of_running_slot()?,
                });
            }
            Err(e) => return Err(e.into()),
        }

        Ok(RunRecord {
            run_id,
            mode,
            status: RunStatus::Running,
            started_at,
            ended_at: None,
            skip_requested: false,
            counters: RunCounters::default(),
            config_hash: config_hash.to_string(),
        })
    }

    fn get_run(&self, run_id: &str) -> StorageResult<Option<RunRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                RawRun::from_row,
            )
            .optional()?;

        raw.map(RawRun::into_record).transpose()
    }

    fn running_runs(&self) -> StorageResult<Vec<RunRecord>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM runs WHERE status = ?1 ORDER BY started_at",
                RUN_COLUMNS
            ),
            &[&RunStatus::Running.to_db_string()],
        )
    }

    fn list_recent_runs(&self, limit: u32) -> StorageResult<Vec<RunRecord>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
                RUN_COLUMNS
            ),
            &[&limit],
        )
    }

    fn update_run_counters(&mut self, run_id: &str, counters: &RunCounters) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE runs SET
                pages_processed = MAX(pages_processed, ?2),
                products_upserted = MAX(products_upserted, ?3),
                products_created = MAX(products_created, ?4),
                error_count = MAX(error_count, ?5)
             WHERE run_id = ?1 AND status = 'running'",
            params![
                run_id,
                counters.pages_processed,
                counters.products_upserted,
                counters.products_created,
                counters.error_count
            ],
        )?;

        if changed == 0 && self.get_run(run_id)?.is_none() {
            return Err(StorageError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    fn update_run_status(
        &mut self,
        run_id: &str,
        status: RunStatus,
        counters: &RunCounters,
    ) -> StorageResult<bool> {
        if !RunStatus::Running.can_transition_to(status) {
            return Err(StorageError::Database(format!(
                "run {} cannot be moved to {}",
                run_id, status
            )));
        }

        let changed = self.conn.execute(
            "UPDATE runs SET
                status = ?2,
                ended_at = ?3,
                pages_processed = MAX(pages_processed, ?4),
                products_upserted = MAX(products_upserted, ?5),
                products_created = MAX(products_created, ?6),
                error_count = MAX(error_count, ?7)
             WHERE run_id = ?1 AND status = 'running'",
            params![
                run_id,
                status.to_db_string(),
                format_ts(Utc::now()),
                counters.pages_processed,
                counters.products_upserted,
                counters.products_created,
                counters.error_count
            ],
        )?;

        Ok(changed == 1)
    }

    fn request_skip(&mut self, run_id: &str) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE runs SET skip_requested = 1 WHERE run_id = ?1 AND status = 'running'",
            params![run_id],
        )?;
        Ok(changed == 1)
    }

    // ===== Run Log =====

    fn append_log_at(
        &mut self,
        run_id: &str,
        level: LogLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO run_logs (run_id, logged_at, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, format_ts(timestamp), level.to_db_string(), message],
        )?;
        Ok(())
    }

    fn list_logs(&self, run_id: &str, limit: u32) -> StorageResult<Vec<LogRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, logged_at, level, message FROM run_logs
             WHERE run_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;

        let raw = stmt
            .query_map(params![run_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, run_id, logged_at, level, message)| {
                let level = LogLevel::from_db_string(&level).ok_or_else(|| {
                    StorageError::CorruptRow(format!("unknown log level '{}'", level))
                })?;
                Ok(LogRecord {
                    id,
                    run_id,
                    timestamp: parse_ts(&logged_at)?,
                    level,
                    message,
                })
            })
            .collect()
    }

    fn latest_log_time(&self, run_id: &str) -> StorageResult<Option<DateTime<Utc>>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(logged_at) FROM run_logs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;

        latest.map(|s| parse_ts(&s)).transpose()
    }

    // ===== Scraper Settings =====

    fn read_config(&self) -> StorageResult<ScraperSettings> {
        let settings = self
            .conn
            .query_row(
                "SELECT scheduler_enabled, new_scan_interval_min, new_scan_page_limit,
                        backfill_interval_min, backfill_pages_per_run, backfill_max_products,
                        request_interval_ms
                 FROM scraper_config WHERE id = 1",
                [],
                |row| {
                    Ok((
                        ScraperSettings {
                            scheduler_enabled: row.get(0)?,
                            new_scan_interval_min: row.get(1)?,
                            new_scan_page_limit: row.get(2)?,
                            backfill_interval_min: row.get(3)?,
                            backfill_pages_per_run: row.get(4)?,
                            backfill_max_products: row.get(5)?,
                            request_interval_ms: 0,
                        },
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        let (mut settings, request_interval_ms) = settings.ok_or(StorageError::SettingsMissing)?;
        settings.request_interval_ms = u64::try_from(request_interval_ms).map_err(|_| {
            StorageError::CorruptRow(format!(
                "negative request_interval_ms {}",
                request_interval_ms
            ))
        })?;

        // Bounds are enforced on read, not only where the row is edited
        validate_settings(&settings)?;
        Ok(settings)
    }

    fn write_config(&mut self, settings: &ScraperSettings) -> StorageResult<()> {
        validate_settings(settings)?;

        self.conn.execute(
            "INSERT INTO scraper_config (id, scheduler_enabled, new_scan_interval_min,
                 new_scan_page_limit, backfill_interval_min, backfill_pages_per_run,
                 backfill_max_products, request_interval_ms, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 scheduler_enabled = excluded.scheduler_enabled,
                 new_scan_interval_min = excluded.new_scan_interval_min,
                 new_scan_page_limit = excluded.new_scan_page_limit,
                 backfill_interval_min = excluded.backfill_interval_min,
                 backfill_pages_per_run = excluded.backfill_pages_per_run,
                 backfill_max_products = excluded.backfill_max_products,
                 request_interval_ms = excluded.request_interval_ms,
                 updated_at = excluded.updated_at",
            params![
                settings.scheduler_enabled,
                settings.new_scan_interval_min,
                settings.new_scan_page_limit,
                settings.backfill_interval_min,
                settings.backfill_pages_per_run,
                settings.backfill_max_products,
                settings.request_interval_ms as i64,
                format_ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    fn seed_config(&mut self, settings: &ScraperSettings) -> StorageResult<bool> {
        validate_settings(settings)?;

        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO scraper_config (id, scheduler_enabled, new_scan_interval_min,
                 new_scan_page_limit, backfill_interval_min, backfill_pages_per_run,
                 backfill_max_products, request_interval_ms, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                settings.scheduler_enabled,
                settings.new_scan_interval_min,
                settings.new_scan_page_limit,
                settings.backfill_interval_min,
                settings.backfill_pages_per_run,
                settings.backfill_max_products,
                settings.request_interval_ms as i64,
                format_ts(Utc::now())
            ],
        )?;
        Ok(changed == 1)
    }

    // ===== Products =====

    fn find_product_by_external_id(
        &self,
        external_id: &str,
    ) -> StorageResult<Option<CanonicalProduct>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM products WHERE external_id = ?1",
                    PRODUCT_COLUMNS
                ),
                params![external_id],
                RawProduct::from_row,
            )
            .optional()?;

        raw.map(RawProduct::into_product).transpose()
    }

    fn upsert_product(&mut self, item: &ParsedItem) -> StorageResult<()> {
        let source = &item.source;
        let now = format_ts(Utc::now());

        // The conflict branch lists source-owned columns only
        self.conn.execute(
            "INSERT INTO products (external_id, url, title, description, price_low, price_high,
                 image_urls, official_tags, shop_name, shop_url, age_rating, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(external_id) DO UPDATE SET
                 url = excluded.url,
                 title = excluded.title,
                 description = excluded.description,
                 price_low = excluded.price_low,
                 price_high = excluded.price_high,
                 image_urls = excluded.image_urls,
                 official_tags = excluded.official_tags,
                 shop_name = excluded.shop_name,
                 shop_url = excluded.shop_url,
                 age_rating = excluded.age_rating,
                 updated_at = excluded.updated_at",
            params![
                item.external_id,
                source.url,
                source.title,
                source.description,
                source.price_low,
                source.price_high,
                serde_json::to_string(&source.image_urls)?,
                serde_json::to_string(&source.official_tags)?,
                source.shop_name,
                source.shop_url,
                source.age_rating,
                now
            ],
        )?;
        Ok(())
    }

    fn set_community_tags(
        &mut self,
        external_id: &str,
        tags: &BTreeSet<String>,
    ) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE products SET community_tags = ?2 WHERE external_id = ?1",
            params![external_id, serde_json::to_string(tags)?],
        )?;
        Ok(changed == 1)
    }

    fn set_curation_note(
        &mut self,
        external_id: &str,
        note: Option<&str>,
    ) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE products SET curation_note = ?2 WHERE external_id = ?1",
            params![external_id, note],
        )?;
        Ok(changed == 1)
    }

    fn count_products(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    // ===== Cursors =====

    fn read_cursor(&self, mode: RunMode) -> StorageResult<Cursor> {
        let cursor = self
            .conn
            .query_row(
                "SELECT last_page_index, last_seen_item_id FROM cursors WHERE mode = ?1",
                params![mode.to_db_string()],
                |row| {
                    Ok(Cursor {
                        mode,
                        last_page_index: row.get(0)?,
                        last_seen_item_id: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(cursor.unwrap_or_else(|| Cursor::start(mode)))
    }

    fn write_cursor(&mut self, cursor: &Cursor) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO cursors (mode, last_page_index, last_seen_item_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(mode) DO UPDATE SET
                 last_page_index = excluded.last_page_index,
                 last_seen_item_id = excluded.last_seen_item_id,
                 updated_at = excluded.updated_at",
            params![
                cursor.mode.to_db_string(),
                cursor.last_page_index,
                cursor.last_seen_item_id,
                format_ts(Utc::now())
            ],
        )?;
        Ok(())
    }
}
