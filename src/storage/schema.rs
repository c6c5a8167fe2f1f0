//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Market-Ingest database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- One row per crawl attempt
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    skip_requested INTEGER NOT NULL DEFAULT 0,
    pages_processed INTEGER NOT NULL DEFAULT 0,
    products_upserted INTEGER NOT NULL DEFAULT 0,
    products_created INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    config_hash TEXT NOT NULL
);

-- At most one RUNNING run at any instant
CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_single_running
    ON runs(status) WHERE status = 'running';

CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);

-- Terminal runs only ever gain log entries
CREATE TRIGGER IF NOT EXISTS trg_runs_terminal_immutable
BEFORE UPDATE ON runs
WHEN OLD.status <> 'running'
BEGIN
    SELECT RAISE(ABORT, 'terminal runs are immutable');
END;

-- Append-only audit trail
CREATE TABLE IF NOT EXISTS run_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(run_id),
    logged_at TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_logs_run ON run_logs(run_id, id);

CREATE TRIGGER IF NOT EXISTS trg_run_logs_no_update
BEFORE UPDATE ON run_logs
BEGIN
    SELECT RAISE(ABORT, 'run_logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_run_logs_no_delete
BEFORE DELETE ON run_logs
BEGIN
    SELECT RAISE(ABORT, 'run_logs is append-only');
END;

-- Per-mode pagination state, independent of any run
CREATE TABLE IF NOT EXISTS cursors (
    mode TEXT PRIMARY KEY,
    last_page_index INTEGER NOT NULL DEFAULT 0,
    last_seen_item_id TEXT,
    updated_at TEXT NOT NULL
);

-- Canonical products keyed by marketplace item id
CREATE TABLE IF NOT EXISTS products (
    external_id TEXT PRIMARY KEY,
    -- source-owned
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    price_low INTEGER,
    price_high INTEGER,
    image_urls TEXT NOT NULL DEFAULT '[]',
    official_tags TEXT NOT NULL DEFAULT '[]',
    shop_name TEXT NOT NULL DEFAULT '',
    shop_url TEXT NOT NULL DEFAULT '',
    age_rating TEXT,
    -- user-owned
    community_tags TEXT NOT NULL DEFAULT '[]',
    curation_note TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Singleton scraper settings
CREATE TABLE IF NOT EXISTS scraper_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    scheduler_enabled INTEGER NOT NULL,
    new_scan_interval_min INTEGER NOT NULL,
    new_scan_page_limit INTEGER NOT NULL,
    backfill_interval_min INTEGER NOT NULL,
    backfill_pages_per_run INTEGER NOT NULL,
    backfill_max_products INTEGER NOT NULL,
    request_interval_ms INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    add_missing_columns(conn)?;
    Ok(())
}

/// Columns added after the first release, as (table, column, definition)
const ADDED_COLUMNS: &[(&str, &str, &str)] =
    &[("products", "shop_url", "TEXT NOT NULL DEFAULT ''")];

/// Brings databases created by older builds up to the current table layout
fn add_missing_columns(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    for (table, column, definition) in ADDED_COLUMNS {
        let existing = {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            names
        };

        if !existing.iter().any(|name| name.as_str() == *column) {
            tracing::info!("Adding column {}.{}", table, column);
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, definition
            ))?;
        }
    }
    Ok(())
}
