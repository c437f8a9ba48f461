/// Multi-ticker backfill across a bounded worker pool sharing one DB pool
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::batch_planner::BatchPlanner;
use super::pipeline::{BarSource, FetchPipeline};
use crate::db::{bulk_insert, prepare_rows, BarDatabase, DbPool, InsertRow, OnConflict};
use crate::error::{BackfillError, Result};
use crate::types::{FetchResult, Interval};
use crate::utils::write_json_atomic;

/// What to backfill and how to store it
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub tickers: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub interval: Interval,
    pub default_exchange: String,
    /// Keyed by uppercase ticker
    pub exchange_map: HashMap<String, String>,
    pub on_conflict: OnConflict,
    pub dry_run: bool,
}

impl BackfillRequest {
    pub fn new(tickers: Vec<String>, start: NaiveDate, end: NaiveDate, interval: Interval) -> Self {
        BackfillRequest {
            tickers,
            start,
            end,
            interval,
            default_exchange: "nasdaq".to_string(),
            exchange_map: HashMap::new(),
            on_conflict: OnConflict::Fail,
            dry_run: false,
        }
    }

    /// Lowercased exchange stored with this ticker's rows
    pub fn exchange_for(&self, ticker: &str) -> String {
        self.exchange_map
            .get(&ticker.to_uppercase())
            .unwrap_or(&self.default_exchange)
            .to_lowercase()
    }

    fn display_exchange(&self) -> String {
        if self.exchange_map.is_empty() {
            return self.default_exchange.clone();
        }
        let unique: BTreeSet<&String> = self.exchange_map.values().collect();
        match unique.into_iter().collect::<Vec<_>>().as_slice() {
            [only] => only.to_string(),
            _ => "mixed".to_string(),
        }
    }
}

/// Aggregate outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub dry_run: bool,
    pub tickers: usize,
    pub tickers_failed: usize,
    pub failed_batches: usize,
    pub rows_fetched: usize,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    pub elapsed: Duration,
    pub failures: Vec<String>,
}

impl RunStats {
    fn new(tickers: usize, dry_run: bool) -> Self {
        RunStats {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            dry_run,
            tickers,
            tickers_failed: 0,
            failed_batches: 0,
            rows_fetched: 0,
            rows_inserted: 0,
            rows_skipped: 0,
            elapsed: Duration::ZERO,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, result: &FetchResult) {
        self.failed_batches += result.failed_batches;
        self.rows_fetched += result.rows.len();
        self.rows_inserted += result.rows_inserted;
        self.rows_skipped += result.rows_skipped;
        if let Some(e) = &result.error {
            self.record_failure(&result.ticker, e);
        }
    }

    fn record_failure(&mut self, ticker: &str, reason: &str) {
        self.tickers_failed += 1;
        self.failures.push(format!("{}: {}", ticker, reason));
    }
}

pub struct ConcurrentBackfill {
    source: Arc<dyn BarSource>,
    planner: BatchPlanner,
    database: BarDatabase,
    worker_count: usize,
    max_tries: u32,
    retry_pause: Duration,
}

impl ConcurrentBackfill {
    /// Workers must leave at least one pooled connection spare
    pub fn new(
        source: Arc<dyn BarSource>,
        planner: BatchPlanner,
        database: BarDatabase,
        worker_count: usize,
    ) -> Result<Self> {
        if worker_count == 0 {
            return Err(BackfillError::InvalidParameter(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if worker_count >= database.max_connections() as usize {
            return Err(BackfillError::InvalidParameter(format!(
                "worker_count ({}) must be less than the pool size ({})",
                worker_count,
                database.max_connections()
            )));
        }

        Ok(ConcurrentBackfill {
            source,
            planner,
            database,
            worker_count,
            max_tries: 2,
            retry_pause: Duration::from_secs(1),
        })
    }

    pub fn with_retry(mut self, max_tries: u32, retry_pause: Duration) -> Self {
        self.max_tries = max_tries;
        self.retry_pause = retry_pause;
        self
    }

    /// Backfill every ticker, then close the pool
    pub async fn run(self, request: BackfillRequest) -> RunStats {
        let started = Instant::now();
        let mut stats = RunStats::new(request.tickers.len(), request.dry_run);

        info!(
            "🚀 [ConcurrentBackfill] Starting concurrency for {} tickers (run {}).",
            request.tickers.len(),
            stats.run_id
        );
        info!(
            "   Date range: {} to {}, interval={}, exchange={}",
            request.start,
            request.end,
            request.interval,
            request.display_exchange()
        );
        info!("   Using up to {} workers.", self.worker_count);

        let pipeline = Arc::new(
            FetchPipeline::new(Arc::clone(&self.source), self.planner.clone())
                .with_retry(self.max_tries, self.retry_pause),
        );
        let request = Arc::new(request);
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut handles = Vec::with_capacity(request.tickers.len());

        for ticker in request.tickers.iter().cloned() {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                error!("[ConcurrentBackfill] Worker pool closed before {} started", ticker);
                stats.record_failure(&ticker, "worker pool closed");
                continue;
            };

            let pipeline = Arc::clone(&pipeline);
            let pool = self.database.pool();
            let request = Arc::clone(&request);
            let task_ticker = ticker.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                backfill_single_ticker(&pipeline, pool, &task_ticker, &request).await
            });
            handles.push((ticker, handle));
        }

        let outcomes = join_all(
            handles
                .into_iter()
                .map(|(ticker, handle)| async move { (ticker, handle.await) }),
        )
        .await;

        for (ticker, outcome) in outcomes {
            match outcome {
                Ok(result) => stats.record(&result),
                Err(e) => {
                    error!("❌ [ConcurrentBackfill:ERROR] A worker failed with: {}", e);
                    stats.record_failure(&ticker, &format!("worker aborted: {}", e));
                }
            }
        }

        info!("[ConcurrentBackfill] All workers completed. Closing connection pool.");
        self.database.close();

        stats.elapsed = started.elapsed();
        info!("✅ Backfill finished in {:.1}s", stats.elapsed.as_secs_f64());
        info!("   Tickers: {} ({} failed)", stats.tickers, stats.tickers_failed);
        info!(
            "   Rows fetched: {} | inserted: {} | skipped: {}",
            stats.rows_fetched, stats.rows_inserted, stats.rows_skipped
        );
        if stats.failed_batches > 0 {
            warn!("   Failed batches: {}", stats.failed_batches);
        }

        stats
    }
}

/// Fetch one ticker and insert it in a single transaction
async fn backfill_single_ticker(
    pipeline: &FetchPipeline,
    pool: DbPool,
    ticker: &str,
    request: &BackfillRequest,
) -> FetchResult {
    let mut result = pipeline
        .run(ticker, request.start, request.end, request.interval)
        .await;

    if result.rows.is_empty() {
        info!("[{}] No data returned from backfill.", ticker);
        return result;
    }

    let exchange = request.exchange_for(ticker);
    let (rows, rejected) = prepare_rows(&result.rows, &exchange);
    result.rows_skipped = rejected;

    if request.dry_run {
        info!("[{}:DRY_RUN] Rows prepared: {}.", ticker, rows.len());
        return result;
    }
    if rows.is_empty() {
        warn!("[{}] No valid rows to insert.", ticker);
        return result;
    }

    let prepared = rows.len();
    match insert_rows(pool, rows, request.on_conflict).await {
        Ok(inserted) => {
            result.rows_inserted = inserted;
            result.rows_skipped += prepared - inserted;
            info!("💾 [{}] Inserted {} rows into DB.", ticker, inserted);
        }
        Err(e) => {
            error!("❌ [{}] Error during backfill or insert: {}", ticker, e);
            result.error = Some(e.to_string());
        }
    }

    result
}

/// Lease a connection on the blocking pool; it returns to the pool when the closure ends
async fn insert_rows(pool: DbPool, rows: Vec<InsertRow>, on_conflict: OnConflict) -> Result<usize> {
    tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut lease = pool.get()?;
        bulk_insert(&mut lease, &rows, on_conflict)
    })
    .await
    .map_err(|e| BackfillError::WorkerFailed(format!("insert task: {}", e)))?
}

/// Persist run stats as `backfill_report_{timestamp}.json`
pub async fn save_report(stats: &RunStats, report_dir: &Path) -> Result<PathBuf> {
    let path = report_dir.join(format!(
        "backfill_report_{}.json",
        stats.started_at.format("%Y%m%d_%H%M%S")
    ));
    write_json_atomic(&path, stats).await?;
    info!("💾 Saved backfill report to {}", path.display());
    Ok(path)
}
