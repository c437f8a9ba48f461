/// Configuration loading from TOML file
use std::path::Path;

use crate::error::{BackfillError, Result};
use crate::types::Config;

/// Environment variable consulted when the config carries no API key
pub const API_KEY_ENV: &str = "FMP_API_KEY";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        BackfillError::ConfigError(format!(
            "Failed to read config file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;

    let config: Config = toml::from_str(&content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.rate_limit.max_requests == 0 {
        return Err(BackfillError::ConfigError("rate_limit.max_requests must be > 0".to_string()));
    }

    if config.rate_limit.window_secs == 0 {
        return Err(BackfillError::ConfigError("rate_limit.window_secs must be > 0".to_string()));
    }

    if config.http.max_retries == 0 {
        return Err(BackfillError::ConfigError("http.max_retries must be >= 1".to_string()));
    }

    if config.http.request_timeout_secs == 0 {
        return Err(BackfillError::ConfigError("http.request_timeout_secs must be > 0".to_string()));
    }

    if config.backfill.batch_days == 0 {
        return Err(BackfillError::ConfigError("backfill.batch_days must be > 0".to_string()));
    }

    if config.backfill.batch_max_tries == 0 {
        return Err(BackfillError::ConfigError("backfill.batch_max_tries must be >= 1".to_string()));
    }

    // Workers each hold at most one lease, so the pool must stay strictly larger
    if config.backfill.worker_count == 0
        || config.backfill.worker_count as u64 >= config.database.max_connections as u64
    {
        return Err(BackfillError::ConfigError(format!(
            "backfill.worker_count ({}) must be between 1 and database.max_connections - 1 ({})",
            config.backfill.worker_count,
            config.database.max_connections.saturating_sub(1)
        )));
    }

    Ok(())
}

/// Resolve the provider key from config, then environment
pub fn resolve_api_key(config: &Config) -> Result<String> {
    let key = config
        .provider
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| std::env::var(API_KEY_ENV).ok());

    match key {
        Some(k) if !k.trim().is_empty() => Ok(k.trim().to_string()),
        _ => Err(BackfillError::ConfigError(format!(
            "FMP API key is missing or empty. Set provider.api_key or {}",
            API_KEY_ENV
        ))),
    }
}
