/// Command-line entry point for FMP backfills
/// Usage: cargo run --release -- concurrent --start 020124 --end 310124 --tickers AAPL,MSFT
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fmp_backfill::client::FmpClient;
use fmp_backfill::config::{load_config, validate_config};
use fmp_backfill::data::{
    output_filename, save_report, BackfillRequest, BatchPlanner, ConcurrentBackfill, CsvSink,
    FetchPipeline,
};
use fmp_backfill::db::{BarDatabase, OnConflict};
use fmp_backfill::time::{market_today, HolidayCalendar};
use fmp_backfill::{Config, Interval};

#[derive(Parser)]
#[command(name = "fmp-backfill", about = "Backfill FMP price bars into SQLite or CSV")]
struct Cli {
    /// Path to the TOML config file; defaults apply when it is absent.
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RangeArgs {
    /// First day, DDMMYY (e.g. 040325 for March 4, 2025).
    #[arg(long, value_parser = parse_ddmmyy)]
    start: NaiveDate,

    /// Last day, DDMMYY.
    #[arg(long, value_parser = parse_ddmmyy)]
    end: NaiveDate,

    /// Comma-separated symbols.
    #[arg(long, value_delimiter = ',', required = true)]
    tickers: Vec<String>,

    /// Bar size in minutes: 1, 5, 15, 30 or 60.
    #[arg(long, default_value_t = 1)]
    interval: u32,

    /// Exchange stored with the rows; defaults to backfill.default_exchange.
    #[arg(long)]
    exchange: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch tickers in parallel and bulk insert into the database.
    Concurrent {
        #[command(flatten)]
        range: RangeArgs,

        /// Worker count; must be below database.max_connections.
        #[arg(long)]
        threads: Option<usize>,

        /// Duplicate handling: fail or ignore.
        #[arg(long, default_value = "fail", value_parser = parse_on_conflict)]
        on_conflict: OnConflict,

        /// Prepare rows without inserting them.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Per-ticker exchanges as TICKER=EXCHANGE pairs.
        #[arg(long, value_delimiter = ',')]
        exchange_map: Vec<String>,
    },
    /// Fetch tickers one after another into a CSV file.
    Csv {
        #[command(flatten)]
        range: RangeArgs,

        /// Output file; defaults to a generated name in backfill.output_dir.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the latest price for tickers, or a whole exchange's quote count.
    Quote {
        /// Comma-separated symbols.
        #[arg(long, value_delimiter = ',')]
        tickers: Vec<String>,

        /// Exchange for a batch quote request (e.g. NASDAQ).
        #[arg(long)]
        exchange: Option<String>,
    },
}

fn parse_ddmmyy(value: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%d%m%y").map_err(|_| {
        format!(
            "invalid date '{}': expected DDMMYY (e.g. 040325 for March 4, 2025)",
            value
        )
    })
}

fn parse_on_conflict(value: &str) -> std::result::Result<OnConflict, String> {
    value.parse().map_err(|e: fmp_backfill::BackfillError| e.to_string())
}

fn parse_exchange_map(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for pair in pairs {
        let Some((ticker, exchange)) = pair.split_once('=') else {
            bail!("exchange map entry '{}' must look like TICKER=EXCHANGE", pair);
        };
        map.insert(ticker.trim().to_uppercase(), exchange.trim().to_string());
    }
    Ok(map)
}

fn load_or_default(path: &Path) -> Result<(Config, bool)> {
    if path.exists() {
        let config = load_config(path).with_context(|| format!("loading {}", path.display()))?;
        Ok((config, true))
    } else {
        let config = Config::default();
        validate_config(&config)?;
        Ok((config, false))
    }
}

fn build_planner(config: &Config) -> BatchPlanner {
    let planner = BatchPlanner::new(config.backfill.batch_days);
    if !config.backfill.use_holiday_calendar {
        return planner;
    }
    let calendar = HolidayCalendar::us_equities()
        .with_extra(config.backfill.extra_holidays.iter().copied());
    planner.with_calendar(Arc::new(calendar))
}

fn retry_pause(config: &Config) -> Duration {
    Duration::from_millis(config.backfill.batch_retry_pause_ms)
}

/// Clamp a future end date to the current market day and reject inverted ranges
fn check_range(range: &mut RangeArgs) -> Result<()> {
    let today = market_today();
    if range.end > today {
        warn!("⚠️  End date {} is in the future, using {}", range.end, today);
        range.end = today;
    }
    if range.start > range.end {
        bail!("start date {} is after end date {}", range.start, range.end);
    }
    Ok(())
}

fn normalize_tickers(tickers: Vec<String>) -> Vec<String> {
    tickers
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, from_file) = load_or_default(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    if from_file {
        info!("📋 Loaded configuration from {}", cli.config.display());
    } else {
        warn!(
            "⚠️  {} not found, using built-in defaults",
            cli.config.display()
        );
    }

    match cli.command {
        Commands::Concurrent {
            range,
            threads,
            on_conflict,
            dry_run,
            exchange_map,
        } => {
            run_concurrent(&config, range, threads, on_conflict, dry_run, &exchange_map).await
        }
        Commands::Csv { range, output } => run_csv(&config, range, output).await,
        Commands::Quote { tickers, exchange } => run_quote(&config, tickers, exchange).await,
    }
}

async fn run_concurrent(
    config: &Config,
    mut range: RangeArgs,
    threads: Option<usize>,
    on_conflict: OnConflict,
    dry_run: bool,
    exchange_map: &[String],
) -> Result<()> {
    check_range(&mut range)?;
    let interval = Interval::try_from(range.interval)?;
    let tickers = normalize_tickers(range.tickers);

    let client = Arc::new(FmpClient::from_config(config)?);
    let database = BarDatabase::from_config(&config.database)?;
    let workers = threads.unwrap_or(config.backfill.worker_count);

    let backfill = ConcurrentBackfill::new(client, build_planner(config), database, workers)?
        .with_retry(config.backfill.batch_max_tries, retry_pause(config));

    let mut request = BackfillRequest::new(tickers, range.start, range.end, interval);
    request.default_exchange = range
        .exchange
        .unwrap_or_else(|| config.backfill.default_exchange.clone());
    request.exchange_map = parse_exchange_map(exchange_map)?;
    request.on_conflict = on_conflict;
    request.dry_run = dry_run;

    let stats = backfill.run(request).await;

    if let Err(e) = save_report(&stats, &config.backfill.report_dir).await {
        warn!("⚠️  Failed to save backfill report: {}", e);
    }
    for failure in &stats.failures {
        warn!("   ❌ {}", failure);
    }

    Ok(())
}

async fn run_csv(config: &Config, mut range: RangeArgs, output: Option<PathBuf>) -> Result<()> {
    check_range(&mut range)?;
    let interval = Interval::try_from(range.interval)?;
    let tickers = normalize_tickers(range.tickers);
    let exchange = range
        .exchange
        .unwrap_or_else(|| config.backfill.default_exchange.clone());

    let path = output.unwrap_or_else(|| {
        config.backfill.output_dir.join(output_filename(
            &tickers,
            range.start,
            range.end,
            interval,
            Some(&exchange),
        ))
    });

    info!(
        "📥 Starting backfill for {:?} from {} to {}, interval={}, exchange={}",
        tickers, range.start, range.end, interval, exchange
    );

    let client = Arc::new(FmpClient::from_config(config)?);
    let pipeline = FetchPipeline::new(client, build_planner(config))
        .with_retry(config.backfill.batch_max_tries, retry_pause(config))
        .with_sink(CsvSink::create(&path)?);

    let mut total_rows = 0;
    let mut failed_batches = 0;
    for ticker in &tickers {
        let result = pipeline.run(ticker, range.start, range.end, interval).await;
        total_rows += result.rows.len();
        failed_batches += result.failed_batches;
    }

    info!(
        "✅ [Backfill] Completed. {} rows saved to {}",
        total_rows,
        path.display()
    );
    if failed_batches > 0 {
        warn!("   Failed batches: {}", failed_batches);
    }

    Ok(())
}

async fn run_quote(config: &Config, tickers: Vec<String>, exchange: Option<String>) -> Result<()> {
    if tickers.is_empty() && exchange.is_none() {
        bail!("pass --tickers and/or --exchange");
    }

    let client = FmpClient::from_config(config)?;

    for ticker in normalize_tickers(tickers) {
        let price = client.fetch_quote(&ticker).await;
        println!("{:<10} {:>12.4}", ticker, price);
    }

    if let Some(exchange) = exchange {
        match client.fetch_exchange_quotes(&exchange).await {
            Some(quotes) => println!("{}: {} quotes", exchange, quotes.len()),
            None => bail!("failed to fetch quotes for {}", exchange),
        }
    }

    Ok(())
}
