/// Row preparation and bulk insert into market_data
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::types::ToSql;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BackfillError, Result};
use crate::types::Bar;

/// Rows per multi-row VALUES statement
const PAGE_SIZE: usize = 500;

/// What to do when (ticker, timestamp) already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    #[default]
    Fail,
    Ignore,
}

impl FromStr for OnConflict {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fail" => Ok(OnConflict::Fail),
            "ignore" => Ok(OnConflict::Ignore),
            other => Err(BackfillError::InvalidParameter(format!(
                "on_conflict must be 'fail' or 'ignore', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OnConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnConflict::Fail => write!(f, "fail"),
            OnConflict::Ignore => write!(f, "ignore"),
        }
    }
}

/// One market_data row, ready to bind
#[derive(Debug, Clone, PartialEq)]
pub struct InsertRow {
    pub ticker: String,
    pub timestamp: NaiveDateTime,
    pub date: NaiveDate,
    pub exchange: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

/// Convert bars to rows; non-finite values are skipped and counted
pub fn prepare_rows(bars: &[Bar], exchange: &str) -> (Vec<InsertRow>, usize) {
    let exchange = exchange.to_lowercase();
    let mut rows = Vec::with_capacity(bars.len());
    let mut skipped = 0;

    for bar in bars {
        let finite = [bar.open, bar.high, bar.low, bar.close, bar.volume]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            warn!(
                "[{}] Skipping row at {} due to non-numeric values",
                bar.ticker, bar.timestamp
            );
            skipped += 1;
            continue;
        }

        rows.push(InsertRow {
            ticker: bar.ticker.clone(),
            timestamp: bar.timestamp,
            date: bar.trading_date,
            exchange: exchange.clone(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume as i64,
        });
    }

    (rows, skipped)
}

fn insert_sql(row_count: usize, on_conflict: OnConflict) -> String {
    let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?)"; row_count].join(", ");
    let mut sql = format!(
        "INSERT INTO market_data (ticker, timestamp, date, exchange, \
         open_price, high_price, low_price, close_price, volume) VALUES {}",
        placeholders
    );
    if on_conflict == OnConflict::Ignore {
        sql.push_str(" ON CONFLICT (ticker, timestamp) DO NOTHING");
    }
    sql
}

/// Insert all rows in one transaction; returns rows actually written.
///
/// Under `Fail` a duplicate rolls back the whole batch.
pub fn bulk_insert(conn: &mut Connection, rows: &[InsertRow], on_conflict: OnConflict) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    let mut inserted = 0;

    for page in rows.chunks(PAGE_SIZE) {
        let sql = insert_sql(page.len(), on_conflict);
        let mut stmt = tx.prepare_cached(&sql)?;

        let values: Vec<&dyn ToSql> = page
            .iter()
            .flat_map(|row| {
                let bound: [&dyn ToSql; 9] = [
                    &row.ticker,
                    &row.timestamp,
                    &row.date,
                    &row.exchange,
                    &row.open,
                    &row.high,
                    &row.low,
                    &row.close,
                    &row.volume,
                ];
                bound
            })
            .collect();

        inserted += stmt
            .execute(params_from_iter(values))
            .map_err(map_constraint)?;
    }

    tx.commit()?;
    Ok(inserted)
}

fn map_constraint(e: rusqlite::Error) -> BackfillError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => BackfillError::DuplicateKey(e.to_string()),
        _ => BackfillError::DatabaseError(e),
    }
}

/// Stored rows, optionally for one ticker
pub fn count_rows(conn: &Connection, ticker: Option<&str>) -> Result<i64> {
    let count = match ticker {
        Some(ticker) => conn.query_row(
            "SELECT COUNT(*) FROM market_data WHERE ticker = ?1",
            [ticker],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(*) FROM market_data", [], |row| row.get(0))?,
    };
    Ok(count)
}
