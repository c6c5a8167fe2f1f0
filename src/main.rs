//! Market-Ingest main entry point
//!
//! This is the command-line interface for the marketplace ingest engine.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use market_ingest::config::{load_config_with_hash, AppConfig};
use market_ingest::control::ControlChannel;
use market_ingest::crawler::{reap_stale_runs, RunCoordinator};
use market_ingest::schedule::{Scheduler, TriggerOutcome};
use market_ingest::storage::{open_storage, RunRecord, SqliteStorage, Storage, StorageError};
use market_ingest::RunMode;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Market-Ingest: a polite marketplace crawler
///
/// Market-Ingest discovers new listings and back-fills the catalog from a
/// single marketplace, one run at a time, pacing every request and
/// respecting robots.txt.
#[derive(Parser, Debug)]
#[command(name = "market-ingest")]
#[command(version)]
#[command(about = "A polite marketplace ingest engine", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reap stale runs, then run one crawl now
    Run {
        /// Path to TOML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        #[arg(long, value_enum)]
        mode: ModeArg,
    },

    /// Run both crawl cadences until Ctrl-C
    Schedule {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Ask a running crawl to stop at its next page boundary
    Skip {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        #[arg(value_name = "RUN_ID")]
        run_id: String,

        /// Who is asking
        #[arg(long, default_value = "cli")]
        by: String,

        /// Why the run should stop
        #[arg(long, default_value = "requested from the command line")]
        reason: String,
    },

    /// List recent runs
    Runs {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show the log of one run, newest first
    Logs {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        #[arg(value_name = "RUN_ID")]
        run_id: String,

        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Fail runs that stopped making progress
    Reap {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Validate the configuration and show what would be crawled
    Check {
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    NewScan,
    Backfill,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::NewScan => RunMode::NewScan,
            ModeArg::Backfill => RunMode::Backfill,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    match cli.command {
        Command::Run { config, mode } => handle_run(&config, mode.into()).await,
        Command::Schedule { config } => handle_schedule(&config).await,
        Command::Skip {
            config,
            run_id,
            by,
            reason,
        } => handle_skip(&config, &run_id, &by, &reason),
        Command::Runs { config, limit } => handle_runs(&config, limit),
        Command::Logs {
            config,
            run_id,
            limit,
        } => handle_logs(&config, &run_id, limit),
        Command::Reap { config } => handle_reap(&config),
        Command::Check { config } => handle_check(&config),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("market_ingest=info,warn"),
            1 => EnvFilter::new("market_ingest=debug,info"),
            2 => EnvFilter::new("market_ingest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Loads the config file and opens its database, seeding the settings row
fn open(path: &Path) -> anyhow::Result<(AppConfig, String, Arc<Mutex<SqliteStorage>>)> {
    tracing::debug!("Loading configuration from: {}", path.display());
    let (config, hash) = load_config_with_hash(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    tracing::debug!("Configuration loaded (hash: {})", hash);

    let mut storage = open_storage(Path::new(&config.storage.database_path))
        .with_context(|| format!("failed to open database {}", config.storage.database_path))?;
    if storage.seed_config(&config.schedule)? {
        tracing::info!("Seeded scraper settings from the [schedule] section");
    }

    Ok((config, hash, Arc::new(Mutex::new(storage))))
}

fn scheduler(path: &Path) -> anyhow::Result<Scheduler<SqliteStorage>> {
    let (config, hash, storage) = open(path)?;
    Ok(Scheduler::new(RunCoordinator::new(storage, config, hash)))
}

fn control(path: &Path) -> anyhow::Result<ControlChannel<SqliteStorage>> {
    let (_, _, storage) = open(path)?;
    Ok(ControlChannel::new(storage))
}

async fn handle_run(path: &Path, mode: RunMode) -> anyhow::Result<()> {
    let scheduler = scheduler(path)?;

    match scheduler.run_now(mode).await? {
        TriggerOutcome::Finished(run) => {
            print_run(&run);
            Ok(())
        }
        TriggerOutcome::AlreadyRunning { run_id } => {
            println!("Run {} is still in progress; nothing started", run_id);
            Ok(())
        }
        TriggerOutcome::Disabled => Ok(()),
    }
}

async fn handle_schedule(path: &Path) -> anyhow::Result<()> {
    let scheduler = scheduler(path)?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    scheduler.run_until(shutdown).await?;
    Ok(())
}

fn handle_skip(path: &Path, run_id: &str, by: &str, reason: &str) -> anyhow::Result<()> {
    control(path)?.request_skip(run_id, by, reason)?;
    println!("Skip requested for run {}", run_id);
    Ok(())
}

fn handle_runs(path: &Path, limit: u32) -> anyhow::Result<()> {
    let runs = control(path)?.recent_runs(limit)?;
    if runs.is_empty() {
        println!("No runs recorded yet");
    }
    for run in &runs {
        print_run(run);
    }
    Ok(())
}

fn handle_logs(path: &Path, run_id: &str, limit: u32) -> anyhow::Result<()> {
    for entry in control(path)?.logs(run_id, limit)? {
        println!(
            "{}  {:<5}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.level,
            entry.message
        );
    }
    Ok(())
}

fn handle_reap(path: &Path) -> anyhow::Result<()> {
    let (config, _, storage) = open(path)?;
    let reaped = reap_stale_runs(&storage, config.reaper.threshold(), chrono::Utc::now())?;

    if reaped.is_empty() {
        println!("No stale runs");
    }
    for run_id in reaped {
        println!("Reaped {}", run_id);
    }
    Ok(())
}

/// Validates config and shows what would be crawled
fn handle_check(path: &Path) -> anyhow::Result<()> {
    let (config, hash) = load_config_with_hash(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    println!("=== Market-Ingest Configuration Check ===\n");

    println!("User Agent: {}", config.user_agent.header_value());

    println!("\nTarget:");
    println!("  Listing URL: {}", config.target.listing_url);
    println!("  Cookie: {}", if config.target.cookie.is_some() { "set" } else { "none" });
    println!("  Fetch details: {}", config.target.fetch_details);

    println!("\nFetch:");
    println!("  Timeout: {}s", config.fetch.timeout_secs);
    println!("  Max attempts: {}", config.fetch.max_attempts);
    println!("  Retry backoff: {}ms", config.fetch.retry_backoff_ms);
    println!("  robots.txt TTL: {} min", config.fetch.robots_ttl_min);

    println!("\nStorage: {}", config.storage.database_path);
    println!("Stale run threshold: {} min", config.reaper.stale_after_min);

    let schedule = &config.schedule;
    println!("\nInitial schedule:");
    println!("  Scheduler enabled: {}", schedule.scheduler_enabled);
    println!(
        "  NEW_SCAN: every {} min, up to {} pages",
        schedule.new_scan_interval_min, schedule.new_scan_page_limit
    );
    println!(
        "  BACKFILL: every {} min, {} pages per run, at most {} products",
        schedule.backfill_interval_min,
        schedule.backfill_pages_per_run,
        schedule.backfill_max_products
    );
    println!("  Request interval: {}ms", schedule.request_interval_ms);

    if Path::new(&config.storage.database_path).exists() {
        let storage = open_storage(Path::new(&config.storage.database_path))?;
        match storage.read_config() {
            Ok(active) if active != config.schedule => {
                println!("\nNote: the database holds different settings, which take precedence")
            }
            Ok(_) | Err(StorageError::SettingsMissing) => {}
            Err(e) => bail!("stored scraper settings are invalid: {}", e),
        }
    }

    println!("\n✓ Configuration is valid (hash: {})", hash);
    Ok(())
}

fn print_run(run: &RunRecord) {
    println!(
        "{}  {:<8}  {:<9}  started {}  pages {}  upserted {}  new {}  errors {}{}",
        run.run_id,
        run.mode,
        run.status,
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.counters.pages_processed,
        run.counters.products_upserted,
        run.counters.products_created,
        run.counters.error_count,
        if run.skip_requested { "  (skip requested)" } else { "" }
    );
}
