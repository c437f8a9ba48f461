/// Refresh the S&P 500, commodity and crypto ticker side files
/// Usage: cargo run --bin refresh_universe --release -- [config.toml]
use fmp_backfill::client::FmpClient;
use fmp_backfill::config::load_config;
use fmp_backfill::{Config, Universe};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        load_config(&config_path)?
    } else {
        Config::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("🚀 Universe Refresh Utility");
    info!("==========================");

    let client = FmpClient::from_config(&config)?;
    let mut failed = 0;

    for kind in Universe::all() {
        info!("📥 Fetching {} tickers...", kind.as_str());
        let symbols = client.fetch_universe(kind).await;

        if symbols.is_empty() {
            error!("❌ No {} tickers fetched", kind.as_str());
            failed += 1;
            continue;
        }

        info!("✅ {} {} tickers", symbols.len(), kind.as_str());
        let preview: Vec<&str> = symbols.iter().take(10).map(String::as_str).collect();
        info!("   First 10: {}", preview.join(", "));
    }

    if failed > 0 {
        warn!("⚠️  {} universe(s) could not be refreshed", failed);
    }

    Ok(())
}
