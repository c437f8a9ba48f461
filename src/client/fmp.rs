/// Financial Modeling Prep market data client
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{error, info, warn};

use super::crypto::{self, ReferenceIndex};
use super::resilient::{ResilientClient, RetryPolicy};
use crate::config::resolve_api_key;
use crate::data::pipeline::BarSource;
use crate::error::{BackfillError, Result};
use crate::types::{BatchSpec, Config, Interval, ProviderConfig, Quote, RawBar, Universe};
use crate::utils::{write_json_atomic, RateLimiter};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct FmpClient {
    http: Arc<ResilientClient>,
    coingecko: reqwest::Client,
    api_key: String,
    base_url: String,
    coingecko_base_url: String,
    universe_dir: PathBuf,
    crypto_reference_file: PathBuf,
    crypto_top_limit: usize,
}

impl FmpClient {
    /// Fails with a configuration error when the API key is blank
    pub fn new(
        http: Arc<ResilientClient>,
        provider: &ProviderConfig,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(BackfillError::ConfigError(
                "FMP API key is missing or empty".to_string(),
            ));
        }

        let coingecko = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(FmpClient {
            http,
            coingecko,
            api_key,
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            coingecko_base_url: provider.coingecko_base_url.clone(),
            universe_dir: provider.universe_dir.clone(),
            crypto_reference_file: provider.crypto_reference_file.clone(),
            crypto_top_limit: provider.crypto_top_limit,
        })
    }

    /// Build the shared limiter, request layer and client from one config
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = resolve_api_key(config)?;
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_requests,
            Duration::from_secs(config.rate_limit.window_secs),
        ));
        let http = Arc::new(ResilientClient::new(
            limiter,
            RetryPolicy::from(&config.http),
        )?);

        Self::new(http, &config.provider, api_key)
    }

    fn keyed(&self, mut params: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        params.push(("apikey", self.api_key.clone()));
        params
    }

    fn range_params(&self, from: NaiveDate, to: NaiveDate) -> Vec<(&'static str, String)> {
        self.keyed(vec![
            ("from", from.format(DATE_FORMAT).to_string()),
            ("to", to.format(DATE_FORMAT).to_string()),
        ])
    }

    /// Failed requests are logged and reported as `None`
    async fn get(&self, url: &str, params: &[(&str, String)]) -> Option<Value> {
        match self.http.request(url, params).await {
            Ok(body) => Some(body),
            Err(e) => {
                error!("❌ [FMP API] {} ({})", e, e.error_code());
                None
            }
        }
    }

    /// Intraday bars for one or more symbols
    pub async fn fetch_intraday(
        &self,
        tickers: &[String],
        from: NaiveDate,
        to: NaiveDate,
        interval: Interval,
    ) -> Result<Option<Vec<RawBar>>> {
        let url = format!(
            "{}/api/v3/historical-chart/{}/{}",
            self.base_url,
            interval.route(),
            tickers.join(",")
        );

        let Some(body) = self.get(&url, &self.range_params(from, to)).await else {
            return Ok(None);
        };

        match body {
            Value::Array(rows) if !rows.is_empty() => Ok(Some(decode_rows(rows)?)),
            _ => {
                info!("[FMP API] No intraday data found.");
                Ok(None)
            }
        }
    }

    /// Daily bars; multi-symbol responses are flattened and stamped with their symbol
    pub async fn fetch_daily(
        &self,
        tickers: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Option<Vec<RawBar>>> {
        let url = format!(
            "{}/api/v3/historical-price-full/{}",
            self.base_url,
            tickers.join(",")
        );

        let Some(body) = self.get(&url, &self.range_params(from, to)).await else {
            return Ok(None);
        };

        let rows = parse_daily(body)?;
        if rows.is_empty() {
            info!("[FMP API] No historical data found.");
            return Ok(None);
        }
        Ok(Some(rows))
    }

    /// Enumerate a universe and persist it to its side file
    pub async fn fetch_universe(&self, kind: Universe) -> Vec<String> {
        let symbols = match kind {
            Universe::Sp500 => {
                self.fetch_symbol_list("/stable/sp500-constituent", "S&P 500")
                    .await
            }
            Universe::Commodity => {
                self.fetch_symbol_list("/stable/batch-commodity-quotes", "commodity")
                    .await
            }
            Universe::Crypto => self.fetch_crypto_symbols().await,
        };

        if symbols.is_empty() {
            return symbols;
        }

        let target = self.universe_dir.join(kind.file_name());
        if write_json_atomic(&target, &symbols).await.is_ok() {
            info!(
                "💾 Saved {} {} tickers to {}",
                symbols.len(),
                kind.as_str(),
                target.display()
            );
        }
        symbols
    }

    async fn fetch_symbol_list(&self, route: &str, label: &str) -> Vec<String> {
        let url = format!("{}{}", self.base_url, route);

        let body = match self.get(&url, &self.keyed(Vec::new())).await {
            Some(Value::Array(items)) if !items.is_empty() => items,
            _ => {
                error!("[FMP API] Failed to fetch {} tickers.", label);
                return Vec::new();
            }
        };

        let symbols = extract_symbols(&body);
        if symbols.is_empty() {
            error!("[FMP API] No valid {} ticker symbols found.", label);
        }
        symbols
    }

    async fn fetch_crypto_symbols(&self) -> Vec<String> {
        let coins = crypto::fetch_top_coins(
            &self.coingecko,
            &self.coingecko_base_url,
            self.crypto_top_limit,
        )
        .await;
        let reference = crypto::load_reference_list(&self.crypto_reference_file).await;
        let index = ReferenceIndex::build(&reference);

        let (quotes, matched) = crypto::format_for_vendor(&coins, &index);
        if !index.is_empty() {
            info!(
                "🔗 Matched {}/{} crypto symbols to reference list style",
                matched,
                quotes.len()
            );
        }

        let symbols = crypto::dedupe_symbols(quotes.into_iter().map(|q| q.symbol));
        if symbols.is_empty() {
            error!("[FMP API] Error parsing crypto ticker symbols.");
        }
        symbols
    }

    /// Latest price, or 0.0 when none can be resolved
    pub async fn fetch_quote(&self, ticker: &str) -> f64 {
        let url = format!("{}/stable/quote", self.base_url);
        let params = self.keyed(vec![("symbol", ticker.to_string())]);

        let body = self.get(&url, &params).await;
        let price = body
            .as_ref()
            .and_then(|b| b.as_array())
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("price"))
            .and_then(Value::as_f64);

        match price {
            Some(price) => price,
            None => {
                warn!("No valid price found for ticker {} in API response.", ticker);
                0.0
            }
        }
    }

    /// Quotes for every symbol on an exchange in one request
    pub async fn fetch_exchange_quotes(&self, exchange: &str) -> Option<Vec<Quote>> {
        let url = format!("{}/stable/batch-exchange-quote", self.base_url);
        let params = self.keyed(vec![
            ("exchange", exchange.to_string()),
            ("short", "false".to_string()),
        ]);

        info!("📡 Fetching batch data for {}...", exchange);
        match self.get(&url, &params).await {
            Some(Value::Array(rows)) => Some(
                rows.into_iter()
                    .filter_map(|row| serde_json::from_value::<Quote>(row).ok())
                    .collect(),
            ),
            _ => {
                error!(
                    "[FMP API] Failed to fetch or parse batch data for {}.",
                    exchange
                );
                None
            }
        }
    }
}

#[async_trait]
impl BarSource for FmpClient {
    async fn intraday(&self, ticker: &str, batch: &BatchSpec) -> Result<Option<Vec<RawBar>>> {
        self.fetch_intraday(
            &[ticker.to_string()],
            batch.from_date,
            batch.to_date,
            batch.interval,
        )
        .await
    }

    async fn daily(&self, ticker: &str, batch: &BatchSpec) -> Result<Option<Vec<RawBar>>> {
        self.fetch_daily(&[ticker.to_string()], batch.from_date, batch.to_date)
            .await
    }
}

fn decode_rows(rows: Vec<Value>) -> Result<Vec<RawBar>> {
    Ok(serde_json::from_value(Value::Array(rows))?)
}

/// Handles both `{"historical": [...]}` and `{"historicalStockList": [...]}`
fn parse_daily(body: Value) -> Result<Vec<RawBar>> {
    let Value::Object(mut map) = body else {
        return Ok(Vec::new());
    };

    if let Some(Value::Array(rows)) = map.remove("historical") {
        return decode_rows(rows);
    }

    let mut flattened = Vec::new();
    if let Some(Value::Array(stocks)) = map.remove("historicalStockList") {
        for mut stock in stocks {
            let symbol = stock
                .get("symbol")
                .and_then(Value::as_str)
                .map(str::to_string);
            let rows = match stock.get_mut("historical").map(Value::take) {
                Some(Value::Array(rows)) => rows,
                _ => continue,
            };
            for mut bar in decode_rows(rows)? {
                bar.ticker = symbol.clone();
                flattened.push(bar);
            }
        }
    }
    Ok(flattened)
}

fn extract_symbols(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.get("symbol").and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
