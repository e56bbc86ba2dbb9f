/// barsync command line: incremental bar sync and MA crossover signals
use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use barsync::broker::MarketDataRouter;
use barsync::config::{build_sync_tasks, load_config};
use barsync::data::{jobs_for, save_sync_report, BarStore, SqliteBarStore, SyncEngine};
use barsync::strategy::SignalMonitor;
use barsync::utils::{CancelToken, RateLimiter};
use barsync::{AssetType, Config, LogFormat, SeriesKey, Timeframe};

#[derive(Parser)]
#[command(name = "barsync", version, about = "Incremental OHLCV sync and MA crossover signals")]
struct Cli {
    /// Path to the TOML configuration
    #[arg(long, short, env = "BARSYNC_CONFIG", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch missing and recent bars into the store
    Sync {
        #[command(flatten)]
        selection: Selection,

        /// History depth for series with no stored bars
        #[arg(long)]
        days_back: Option<u32>,
    },
    /// Keep syncing on each asset class's schedule until interrupted
    Watch {
        #[command(flatten)]
        selection: Selection,
    },
    /// Evaluate crossover signals from stored bars
    Signals {
        #[command(flatten)]
        selection: Selection,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Empty lists mean "all known"
#[derive(Args, Debug, Default)]
struct Selection {
    #[arg(long = "asset-type", value_delimiter = ',')]
    asset_types: Vec<AssetType>,

    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    timeframes: Vec<Timeframe>,
}

impl Selection {
    fn is_empty(&self) -> bool {
        self.asset_types.is_empty() && self.symbols.is_empty() && self.timeframes.is_empty()
    }

    fn matches(&self, key: &SeriesKey) -> bool {
        (self.asset_types.is_empty() || self.asset_types.contains(&key.asset_type))
            && (self.timeframes.is_empty() || self.timeframes.contains(&key.timeframe))
            && (self.symbols.is_empty()
                || self.symbols.iter().any(|s| s.eq_ignore_ascii_case(&key.symbol)))
    }
}

enum Outcome {
    Clean,
    Incomplete,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = if cli.config.exists() {
        load_config(&cli.config)
    } else {
        Ok(Config::default())
    };
    match &loaded {
        Ok(config) => init_logging(&config.log_level, config.log_format),
        Err(_) => init_logging("info", LogFormat::Pretty),
    }

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Failed to load {}: {}", cli.config.display(), e);
            return ExitCode::from(2);
        }
    };
    if !cli.config.exists() {
        warn!("⚠️ {} not found, using defaults", cli.config.display());
    }

    let outcome = match cli.command {
        Command::Sync { selection, days_back } => run_sync(&config, &selection, days_back).await,
        Command::Watch { selection } => run_watch(&config, &selection).await,
        Command::Signals { selection, json } => run_signals(&config, &selection, json).await,
    };

    match outcome {
        Ok(Outcome::Clean) => ExitCode::SUCCESS,
        Ok(Outcome::Incomplete) => ExitCode::from(1),
        Err(e) => {
            error!("❌ Fatal: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn open_store(config: &Config) -> anyhow::Result<SqliteBarStore> {
    SqliteBarStore::open(&config.database_path, config.database_pool_size)
        .with_context(|| format!("opening store at {}", config.database_path.display()))
}

fn sync_tasks(config: &Config, selection: &Selection) -> anyhow::Result<Vec<SeriesKey>> {
    let tasks = build_sync_tasks(
        config,
        Some(&selection.asset_types),
        Some(&selection.symbols),
        Some(&selection.timeframes),
    )
    .context("building sync tasks")?;
    if tasks.is_empty() {
        warn!("No tuples to sync; configure [universe.symbols] or pass --symbols");
    }
    Ok(tasks)
}

/// Engine over the SQLite store, with one rate limiter shared by the engine
/// and the providers
fn sync_engine(config: &Config) -> anyhow::Result<SyncEngine<SqliteBarStore, MarketDataRouter>> {
    let store = open_store(config)?;
    let limiter = Arc::new(RateLimiter::new(config.sync.requests_per_second));
    let router = MarketDataRouter::from_config(config, Arc::clone(&limiter))
        .context("configuring providers")?;
    Ok(SyncEngine::new(store, router, config.sync.clone()).with_rate_limiter(limiter))
}

/// Token cancelled on Ctrl-C
fn interrupt_token() -> CancelToken {
    let cancel = CancelToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, finishing in-flight tuples");
            watcher.cancel();
        }
    });
    cancel
}

async fn run_sync(
    config: &Config,
    selection: &Selection,
    days_back: Option<u32>,
) -> anyhow::Result<Outcome> {
    info!("🚀 barsync sync");

    let tasks = sync_tasks(config, selection)?;
    if tasks.is_empty() {
        return Ok(Outcome::Clean);
    }

    let engine = sync_engine(config)?;
    let cancel = interrupt_token();

    let report = engine.run(&tasks, Utc::now(), days_back, &cancel).await?;
    report.log_summary();

    let path = save_sync_report(&report, &config.report_dir).await?;
    info!("💾 Report saved to {}", path.display());

    if report.has_failures() || report.cancelled {
        Ok(Outcome::Incomplete)
    } else {
        Ok(Outcome::Clean)
    }
}

async fn run_watch(config: &Config, selection: &Selection) -> anyhow::Result<Outcome> {
    info!("🚀 barsync watch");

    let tasks = sync_tasks(config, selection)?;
    if tasks.is_empty() {
        return Ok(Outcome::Clean);
    }

    let engine = sync_engine(config)?;
    let cancel = interrupt_token();
    let jobs = jobs_for(&tasks, &config.schedule);

    engine
        .run_scheduled(&jobs, &cancel, Some(config.report_dir.as_path()))
        .await?;

    // stopping on Ctrl-C is the normal way out of watch mode
    Ok(Outcome::Clean)
}

async fn run_signals(config: &Config, selection: &Selection, json: bool) -> anyhow::Result<Outcome> {
    let store = Arc::new(open_store(config)?);

    let keys: Option<Vec<SeriesKey>> = if selection.is_empty() {
        None
    } else {
        let stored = store.list_series().await?;
        Some(stored.into_iter().filter(|k| selection.matches(k)).collect())
    };

    let monitor = SignalMonitor::new(
        Arc::clone(&store),
        config.signal.clone(),
        config.liquidity.clone(),
    );
    let reports = monitor.evaluate_all(keys.as_deref(), Utc::now()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if reports.is_empty() {
        println!("No stored series matched");
    } else {
        for report in &reports {
            println!("{}", report);
        }
    }

    Ok(Outcome::Clean)
}
