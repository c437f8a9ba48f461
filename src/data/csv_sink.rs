/// Append-only CSV output for fetched bars
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BackfillError, Result};
use crate::types::{parse_timestamp, Bar, Interval};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// On-disk column layout
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    ticker: String,
    date: NaiveDate,
    datetime: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
}

impl From<&Bar> for CsvRow {
    fn from(bar: &Bar) -> Self {
        CsvRow {
            ticker: bar.ticker.clone(),
            date: bar.trading_date,
            datetime: bar.timestamp.format(DATETIME_FORMAT).to_string(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume as i64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    /// Start a fresh file at `path`, removing any previous output
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(CsvSink { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append rows on the blocking pool; the header is written only when the file is new
    pub async fn append(&self, bars: &[Bar]) -> Result<()> {
        if bars.is_empty() {
            return Ok(());
        }

        let path = self.path.clone();
        let rows: Vec<CsvRow> = bars.iter().map(CsvRow::from).collect();
        let count = rows.len();

        tokio::task::spawn_blocking(move || write_rows(&path, &rows))
            .await
            .map_err(|e| BackfillError::FileWriteFailed(format!("csv append task: {}", e)))??;

        debug!("Appended {} rows to {}", count, self.path.display());
        Ok(())
    }
}

fn write_rows(path: &Path, rows: &[CsvRow]) -> Result<()> {
    let write_header = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Load bars back from a sink file
pub fn read_bars(path: &Path) -> Result<Vec<Bar>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut bars = Vec::new();

    for row in reader.deserialize::<CsvRow>() {
        let row = row?;
        let timestamp = parse_timestamp(&row.datetime)?;
        bars.push(Bar {
            ticker: row.ticker,
            trading_date: row.date,
            timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume as f64,
        });
    }

    Ok(bars)
}

/// `backfill_{ticker|multiple_tickers}_{YYYYMMDD}_{YYYYMMDD}_{n}min_{exchange}.csv`
pub fn output_filename(
    tickers: &[String],
    start: NaiveDate,
    end: NaiveDate,
    interval: Interval,
    exchange: Option<&str>,
) -> String {
    let subject = match tickers {
        [single] => single.as_str(),
        _ => "multiple_tickers",
    };
    format!(
        "backfill_{}_{}_{}_{}_{}.csv",
        subject,
        start.format("%Y%m%d"),
        end.format("%Y%m%d"),
        interval,
        exchange.map(str::to_lowercase).unwrap_or_else(|| "nasdaq".to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(minute: u32, volume: f64) -> Bar {
        let timestamp = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, minute, 0)
            .unwrap();
        Bar {
            ticker: "AAPL".to_string(),
            trading_date: timestamp.date(),
            timestamp,
            open: 185.25,
            high: 186.0,
            low: 184.5,
            close: 185.75,
            volume,
        }
    }

    #[tokio::test]
    async fn test_round_trip_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::create(dir.path().join("out/bars.csv")).unwrap();

        sink.append(&[bar(30, 1500.0)]).await.unwrap();
        sink.append(&[bar(31, 42.7)]).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ticker,date,datetime,open,high,low,close,volume");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "AAPL,2024-01-02,2024-01-02 09:30:00,185.25,186.0,184.5,185.75,1500");

        let bars = read_bars(sink.path()).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0], bar(30, 1500.0));
        assert_eq!(bars[1].volume, 42.0);
    }

    #[tokio::test]
    async fn test_create_removes_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bars.csv");
        std::fs::write(&path, "stale").unwrap();

        let sink = CsvSink::create(&path).unwrap();
        assert!(!path.exists());
        sink.append(&[]).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_appends_from_spawned_tasks_keep_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::create(dir.path().join("bars.csv")).unwrap();

        for minute in 30..33 {
            let sink = sink.clone();
            tokio::spawn(async move { sink.append(&[bar(minute, 10.0)]).await })
                .await
                .unwrap()
                .unwrap();
        }

        let text = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("ticker,")).count(), 1);
        assert_eq!(read_bars(sink.path()).unwrap().len(), 3);
    }

    #[test]
    fn test_output_filename() {
        let start = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();

        assert_eq!(
            output_filename(&["AAPL".to_string()], start, end, Interval::Min5, Some("NYSE")),
            "backfill_AAPL_20250304_20250307_5min_nyse.csv"
        );
        assert_eq!(
            output_filename(
                &["AAPL".to_string(), "MSFT".to_string()],
                start,
                end,
                Interval::Hour1,
                None
            ),
            "backfill_multiple_tickers_20250304_20250307_60min_nasdaq.csv"
        );
    }
}
