/// Core type definitions for the backfill pipeline
use std::fmt;
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BackfillError, Result};

/// Normalized OHLCV bar for one ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ticker: String,
    pub trading_date: NaiveDate,
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Normalize a provider row, attaching the owning ticker
    pub fn from_raw(ticker: &str, raw: &RawBar) -> Result<Self> {
        let timestamp = parse_timestamp(&raw.date)?;
        Ok(Bar {
            ticker: ticker.to_string(),
            trading_date: timestamp.date(),
            timestamp,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
        })
    }
}

/// Accepts intraday ("2024-01-02 09:30:00"), ISO and daily ("2024-01-02") stamps
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|e| BackfillError::InvalidBarData(format!("bad timestamp '{}': {}", value, e)))
}

/// Bar as returned by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct RawBar {
    pub date: String,
    #[serde(default = "missing_number", deserialize_with = "nullable_f64")]
    pub open: f64,
    #[serde(default = "missing_number", deserialize_with = "nullable_f64")]
    pub high: f64,
    #[serde(default = "missing_number", deserialize_with = "nullable_f64")]
    pub low: f64,
    #[serde(default = "missing_number", deserialize_with = "nullable_f64")]
    pub close: f64,
    #[serde(default = "missing_number", deserialize_with = "nullable_f64")]
    pub volume: f64,
    /// Only present on flattened multi-symbol daily responses
    #[serde(default)]
    pub ticker: Option<String>,
}

fn missing_number() -> f64 {
    f64::NAN
}

fn nullable_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Supported bar sizes in minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
}

impl Interval {
    pub fn minutes(&self) -> u32 {
        match self {
            Interval::Min1 => 1,
            Interval::Min5 => 5,
            Interval::Min15 => 15,
            Interval::Min30 => 30,
            Interval::Hour1 => 60,
        }
    }

    /// Path segment used by the historical-chart route
    pub fn route(&self) -> &str {
        match self {
            Interval::Min1 => "1min",
            Interval::Min5 => "5min",
            Interval::Min15 => "15min",
            Interval::Min30 => "30min",
            Interval::Hour1 => "1hour",
        }
    }
}

impl TryFrom<u32> for Interval {
    type Error = BackfillError;

    fn try_from(minutes: u32) -> Result<Self> {
        match minutes {
            1 => Ok(Interval::Min1),
            5 => Ok(Interval::Min5),
            15 => Ok(Interval::Min15),
            30 => Ok(Interval::Min30),
            60 => Ok(Interval::Hour1),
            other => Err(BackfillError::InvalidParameter(format!(
                "interval {} not in allowed set [1, 5, 15, 30, 60]",
                other
            ))),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}min", self.minutes())
    }
}

/// One provider request window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSpec {
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub interval: Interval,
}

/// Outcome of one ticker's fetch (and insert, when orchestrated)
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub ticker: String,
    pub rows: Vec<Bar>,
    pub rows_inserted: usize,
    pub rows_skipped: usize,
    pub failed_batches: usize,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn new(ticker: &str) -> Self {
        FetchResult {
            ticker: ticker.to_string(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Symbol universes the provider can enumerate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Universe {
    Sp500,
    Commodity,
    Crypto,
}

impl Universe {
    pub fn as_str(&self) -> &str {
        match self {
            Universe::Sp500 => "sp500",
            Universe::Commodity => "commodity",
            Universe::Crypto => "crypto",
        }
    }

    /// Side file the universe is persisted to
    pub fn file_name(&self) -> String {
        format!("{}_tickers.json", self.as_str())
    }

    pub fn all() -> Vec<Universe> {
        vec![Universe::Sp500, Universe::Commodity, Universe::Crypto]
    }
}

/// Real-time quote row from the batch exchange endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub change: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

/// Configuration for the backfill tool
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Falls back to FMP_API_KEY when absent
    pub api_key: Option<String>,
    pub base_url: String,
    pub coingecko_base_url: String,
    pub universe_dir: PathBuf,
    pub crypto_reference_file: PathBuf,
    pub crypto_top_limit: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            api_key: None,
            base_url: "https://financialmodelingprep.com".to_string(),
            coingecko_base_url: "https://api.coingecko.com".to_string(),
            universe_dir: PathBuf::from("data/tickers"),
            crypto_reference_file: PathBuf::from("data/tickers/reference_crypto.json"),
            crypto_top_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_requests: 3000,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub max_retries: u32,
    pub request_timeout_secs: u64,
    pub rate_limit_backoff_secs: u64,
    pub timeout_backoff_secs: u64,
    pub error_backoff_secs: u64,
    pub probe_url: String,
    pub probe_timeout_secs: u64,
    pub connectivity_retry_interval_secs: u64,
    pub connectivity_max_wait_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            max_retries: 6,
            request_timeout_secs: 10,
            rate_limit_backoff_secs: 10,
            timeout_backoff_secs: 5,
            error_backoff_secs: 5,
            probe_url: "https://www.google.com".to_string(),
            probe_timeout_secs: 5,
            connectivity_retry_interval_secs: 10,
            connectivity_max_wait_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub batch_days: usize,
    pub worker_count: usize,
    pub batch_max_tries: u32,
    pub batch_retry_pause_ms: u64,
    pub use_holiday_calendar: bool,
    pub extra_holidays: Vec<NaiveDate>,
    pub default_exchange: String,
    pub output_dir: PathBuf,
    pub report_dir: PathBuf,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        BackfillConfig {
            batch_days: 3,
            worker_count: 8,
            batch_max_tries: 2,
            batch_retry_pause_ms: 1000,
            use_holiday_calendar: false,
            extra_holidays: Vec::new(),
            default_exchange: "nasdaq".to_string(),
            output_dir: PathBuf::from("data/backfill_cache"),
            report_dir: PathBuf::from("data/reports"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: PathBuf::from("data/market_data.db"),
            max_connections: 10,
            connection_timeout_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            provider: ProviderConfig::default(),
            rate_limit: RateLimitConfig::default(),
            http: HttpConfig::default(),
            backfill: BackfillConfig::default(),
            database: DatabaseConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_routes() {
        assert_eq!(Interval::try_from(60).unwrap().route(), "1hour");
        assert_eq!(Interval::try_from(1).unwrap().route(), "1min");
        assert_eq!(Interval::try_from(15).unwrap().route(), "15min");
        assert!(Interval::try_from(2).is_err());
    }

    #[test]
    fn test_bar_from_intraday_row() {
        let raw: RawBar = serde_json::from_str(
            r#"{"date":"2024-01-02 09:31:00","open":10.0,"high":11.0,"low":9.5,"close":10.5,"volume":1200.0}"#,
        )
        .unwrap();
        let bar = Bar::from_raw("AAPL", &raw).unwrap();
        assert_eq!(bar.ticker, "AAPL");
        assert_eq!(bar.trading_date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bar.timestamp.format("%H:%M").to_string(), "09:31");
        assert_eq!(bar.volume, 1200.0);
    }

    #[test]
    fn test_bar_from_daily_row() {
        let raw: RawBar = serde_json::from_str(
            r#"{"date":"2024-01-05","open":1,"high":2,"low":0.5,"close":1.5,"volume":10}"#,
        )
        .unwrap();
        let bar = Bar::from_raw("MSFT", &raw).unwrap();
        assert_eq!(bar.timestamp, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap().and_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn test_null_fields_become_nan() {
        let raw: RawBar =
            serde_json::from_str(r#"{"date":"2024-01-05","open":null,"high":2,"low":1,"close":1.5}"#).unwrap();
        assert!(raw.open.is_nan());
        assert!(raw.volume.is_nan());
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let raw: RawBar = serde_json::from_str(r#"{"date":"yesterday","open":1,"high":1,"low":1,"close":1,"volume":1}"#).unwrap();
        assert!(Bar::from_raw("X", &raw).is_err());
    }
}
