/// Per-ticker batch driver: plan, fetch with fallback, normalize, sink
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{error, info, warn};

use super::batch_planner::BatchPlanner;
use super::csv_sink::CsvSink;
use crate::error::Result;
use crate::types::{Bar, BatchSpec, FetchResult, Interval, RawBar};

/// Where bars come from; `Ok(None)` means the provider had nothing
#[async_trait]
pub trait BarSource: Send + Sync {
    async fn intraday(&self, ticker: &str, batch: &BatchSpec) -> Result<Option<Vec<RawBar>>>;
    async fn daily(&self, ticker: &str, batch: &BatchSpec) -> Result<Option<Vec<RawBar>>>;
}

pub struct FetchPipeline {
    source: Arc<dyn BarSource>,
    planner: BatchPlanner,
    max_tries: u32,
    retry_pause: Duration,
    sink: Option<CsvSink>,
}

impl FetchPipeline {
    pub fn new(source: Arc<dyn BarSource>, planner: BatchPlanner) -> Self {
        FetchPipeline {
            source,
            planner,
            max_tries: 2,
            retry_pause: Duration::from_secs(1),
            sink: None,
        }
    }

    pub fn with_retry(mut self, max_tries: u32, retry_pause: Duration) -> Self {
        self.max_tries = max_tries.max(1);
        self.retry_pause = retry_pause;
        self
    }

    /// Also append every fetched batch to a CSV file
    pub fn with_sink(mut self, sink: CsvSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn sink(&self) -> Option<&CsvSink> {
        self.sink.as_ref()
    }

    /// Fetch every batch in ascending order; a failed batch never aborts the ticker
    pub async fn run(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
    ) -> FetchResult {
        let mut result = FetchResult::new(ticker);
        let plan = self.planner.plan(start, end, interval);

        if plan.is_empty() {
            warn!("[Backfill] No valid trading days between {} and {}.", start, end);
            return result;
        }

        info!("[Backfill] Processing {} ({} batches)...", ticker, plan.len());

        for batch in &plan {
            match self.fetch_with_retry(ticker, batch).await {
                Some(bars) if bars.is_empty() => {
                    info!(
                        "  [Backfill] No data returned for {} from {} to {}.",
                        ticker, batch.from_date, batch.to_date
                    );
                }
                Some(bars) => {
                    if let Some(sink) = &self.sink {
                        if let Err(e) = sink.append(&bars).await {
                            warn!(
                                "⚠️  [{}] Failed to write batch to {}: {}",
                                ticker,
                                sink.path().display(),
                                e
                            );
                        }
                    }
                    result.rows.extend(bars);
                }
                None => result.failed_batches += 1,
            }
        }

        info!(
            "✅ [Backfill] {} complete: {} rows, {} failed batches",
            ticker,
            result.rows.len(),
            result.failed_batches
        );
        result
    }

    /// `None` once every try has failed
    async fn fetch_with_retry(&self, ticker: &str, batch: &BatchSpec) -> Option<Vec<Bar>> {
        info!(
            "[Backfill] Fetching {} from {} to {}...",
            ticker, batch.from_date, batch.to_date
        );

        for attempt in 1..=self.max_tries {
            match self.fetch_batch(ticker, batch).await {
                Ok(bars) => return Some(bars),
                Err(e) => {
                    error!(
                        "❌ [Backfill:ERROR] Attempt {} error fetching {} from {} to {}: {}",
                        attempt, ticker, batch.from_date, batch.to_date, e
                    );
                    if attempt < self.max_tries {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
            }
        }

        None
    }

    /// One try: intraday first, daily when intraday has nothing
    async fn fetch_batch(&self, ticker: &str, batch: &BatchSpec) -> Result<Vec<Bar>> {
        let rows = match self.source.intraday(ticker, batch).await? {
            Some(rows) if !rows.is_empty() => rows,
            _ => self.source.daily(ticker, batch).await?.unwrap_or_default(),
        };

        rows.iter().map(|raw| Bar::from_raw(ticker, raw)).collect()
    }
}
