/// Crypto universe: CoinGecko ranking matched to the vendor's symbol style
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{error, warn};

use crate::types::Quote;

pub const COINGECKO_PAGE_SIZE: usize = 250;
const PAGE_PAUSE: Duration = Duration::from_millis(200);

/// One row of the CoinGecko markets ranking
#[derive(Debug, Clone, Deserialize)]
pub struct CoinMarket {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub current_price: Option<f64>,
    #[serde(default)]
    pub price_change_24h: Option<f64>,
    #[serde(default)]
    pub total_volume: Option<f64>,
}

/// Vendor symbol list entry
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceSymbol {
    #[serde(default)]
    pub symbol: Option<String>,
}

/// Uppercase, strip a trailing USD, keep only [A-Z0-9]
pub fn normalize_symbol(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    let base = upper.strip_suffix("USD").unwrap_or(&upper);
    base.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Lookup tables over the reference list
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    exact: HashSet<String>,
    by_base: HashMap<String, Vec<String>>,
}

impl ReferenceIndex {
    pub fn build(rows: &[ReferenceSymbol]) -> Self {
        let mut index = ReferenceIndex::default();

        for row in rows {
            let symbol = row.symbol.as_deref().unwrap_or("").trim().to_uppercase();
            if symbol.is_empty() {
                continue;
            }
            index.exact.insert(symbol.clone());
            index
                .by_base
                .entry(normalize_symbol(&symbol))
                .or_default()
                .push(symbol);
        }

        index
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Preference: BASEUSD, BASE, first base match ending in USD, first base match
    pub fn pick(&self, base: &str) -> Option<String> {
        let with_usd = format!("{}USD", base);
        if self.exact.contains(&with_usd) {
            return Some(with_usd);
        }
        if self.exact.contains(base) {
            return Some(base.to_string());
        }

        let matches = self.by_base.get(base)?;
        matches
            .iter()
            .find(|s| s.ends_with("USD"))
            .or_else(|| matches.first())
            .cloned()
    }
}

/// Map ranked coins to vendor symbols; returns quotes and the matched count
pub fn format_for_vendor(coins: &[CoinMarket], index: &ReferenceIndex) -> (Vec<Quote>, usize) {
    let mut quotes = Vec::with_capacity(coins.len());
    let mut matched = 0;

    for coin in coins {
        let raw = coin.symbol.as_deref().unwrap_or("").trim();
        if raw.is_empty() {
            continue;
        }
        let base = normalize_symbol(raw);
        if base.is_empty() {
            continue;
        }

        let symbol = match index.pick(&base) {
            Some(symbol) => {
                matched += 1;
                symbol
            }
            None => format!("{}USD", base),
        };

        quotes.push(Quote {
            symbol,
            price: coin.current_price,
            change: Some(coin.price_change_24h.unwrap_or(0.0)),
            volume: coin.total_volume,
        });
    }

    (quotes, matched)
}

/// Unique symbols in first-seen order
pub fn dedupe_symbols<I, S>(symbols: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for symbol in symbols {
        let symbol: String = symbol.into();
        if symbol.trim().is_empty() {
            continue;
        }
        if seen.insert(symbol.clone()) {
            out.push(symbol);
        }
    }
    out
}

/// Missing or unreadable reference file yields an empty list
pub async fn load_reference_list(path: &Path) -> Vec<ReferenceSymbol> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => {
            error!(
                "No reference file found at {}, skipping symbol matching.",
                path.display()
            );
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<ReferenceSymbol>>(&content) {
        Ok(rows) => rows,
        Err(e) => {
            warn!("Failed to read reference file {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Page through the market-cap ranking until `limit` coins are collected
pub async fn fetch_top_coins(client: &Client, base_url: &str, limit: usize) -> Vec<CoinMarket> {
    let url = format!("{}/api/v3/coins/markets", base_url.trim_end_matches('/'));
    let pages = limit.div_ceil(COINGECKO_PAGE_SIZE);
    let mut coins = Vec::new();

    for page in 1..=pages {
        let params = [
            ("vs_currency", "usd".to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", COINGECKO_PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];

        let result = async {
            client
                .get(&url)
                .query(&params)
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<CoinMarket>>()
                .await
        }
        .await;

        match result {
            Ok(rows) => {
                coins.extend(rows);
                tokio::time::sleep(PAGE_PAUSE).await;
            }
            Err(e) => {
                error!("  Error on page {}: {}", page, e);
                break;
            }
        }
    }

    coins.truncate(limit);
    coins
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockServer;
    use std::sync::Arc;

    fn reference(symbols: &[&str]) -> ReferenceIndex {
        let rows: Vec<ReferenceSymbol> = symbols
            .iter()
            .map(|s| ReferenceSymbol {
                symbol: Some(s.to_string()),
            })
            .collect();
        ReferenceIndex::build(&rows)
    }

    fn coin(symbol: &str) -> CoinMarket {
        CoinMarket {
            symbol: Some(symbol.to_string()),
            current_price: Some(1.0),
            price_change_24h: None,
            total_volume: Some(10.0),
        }
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("btcusd"), "BTC");
        assert_eq!(normalize_symbol(" eth "), "ETH");
        assert_eq!(normalize_symbol("1inch-usd"), "1INCH");
        assert_eq!(normalize_symbol("usd"), "");
    }

    #[test]
    fn test_pick_prefers_usd_pair() {
        let index = reference(&["BTC", "BTCUSD", "BTCEUR"]);
        assert_eq!(index.pick("BTC").as_deref(), Some("BTCUSD"));
    }

    #[test]
    fn test_pick_falls_back_through_base_matches() {
        let index = reference(&["SOL"]);
        assert_eq!(index.pick("SOL").as_deref(), Some("SOL"));

        let index = reference(&["X-RPUSD", "XRPEUR"]);
        assert_eq!(index.pick("XRP").as_deref(), Some("X-RPUSD"));

        let index = reference(&["ADA.X"]);
        assert_eq!(index.pick("ADAX").as_deref(), Some("ADA.X"));

        assert_eq!(index.pick("DOGE"), None);
    }

    #[test]
    fn test_format_defaults_unmatched_to_usd_pair() {
        let index = reference(&["ETHUSD"]);
        let coins = vec![coin("eth"), coin("pepe"), coin(""), coin("usd")];

        let (quotes, matched) = format_for_vendor(&coins, &index);
        let symbols: Vec<&str> = quotes.iter().map(|q| q.symbol.as_str()).collect();

        assert_eq!(symbols, vec!["ETHUSD", "PEPEUSD"]);
        assert_eq!(matched, 1);
        assert_eq!(quotes[0].change, Some(0.0));
    }

    #[test]
    fn test_dedupe_keeps_rank_order() {
        let out = dedupe_symbols(vec!["BTCUSD", "ETHUSD", "BTCUSD", " ", "SOLUSD"]);
        assert_eq!(out, vec!["BTCUSD", "ETHUSD", "SOLUSD"]);
    }

    #[tokio::test]
    async fn test_reference_file_missing_or_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_reference_list(&dir.path().join("nope.json")).await.is_empty());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(load_reference_list(&bad).await.is_empty());

        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"[{"symbol":"BTCUSD"},{"name":"no symbol"}]"#).unwrap();
        let rows = load_reference_list(&good).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(ReferenceIndex::build(&rows).pick("BTC").as_deref(), Some("BTCUSD"));
    }

    #[tokio::test]
    async fn test_paging_stops_on_error_and_truncates() {
        let page: String = format!(
            "[{}]",
            (0..COINGECKO_PAGE_SIZE)
                .map(|i| format!(r#"{{"symbol":"c{}"}}"#, i))
                .collect::<Vec<_>>()
                .join(",")
        );
        let server = MockServer::start(Arc::new(move |target: &str, _| {
            if target.ends_with("&page=1") {
                (200, page.clone())
            } else {
                (500, "boom".to_string())
            }
        }))
        .await;

        let client = Client::new();
        let coins = fetch_top_coins(&client, &server.base_url(), 500).await;

        assert_eq!(coins.len(), COINGECKO_PAGE_SIZE);
        assert_eq!(server.hits(), 2);
        assert!(server.requests()[0].contains("per_page=250"));
    }
}
