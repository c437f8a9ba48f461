/// Rate-limited HTTP client with retries and connectivity recovery
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::error::{BackfillError, Result};
use crate::types::HttpConfig;
use crate::utils::RateLimiter;

/// Retry and timeout budget for one logical request
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub request_timeout: Duration,
    /// Scaled by attempt number on HTTP 429
    pub rate_limit_backoff: Duration,
    /// Scaled by attempt number on request timeout
    pub timeout_backoff: Duration,
    /// Scaled by attempt number on other transport or decode errors
    pub error_backoff: Duration,
    pub probe_url: String,
    pub probe_timeout: Duration,
    pub connectivity_retry_interval: Duration,
    pub connectivity_max_wait: Duration,
}

impl From<&HttpConfig> for RetryPolicy {
    fn from(config: &HttpConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries.max(1),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            rate_limit_backoff: Duration::from_secs(config.rate_limit_backoff_secs),
            timeout_backoff: Duration::from_secs(config.timeout_backoff_secs),
            error_backoff: Duration::from_secs(config.error_backoff_secs),
            probe_url: config.probe_url.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            connectivity_retry_interval: Duration::from_secs(config.connectivity_retry_interval_secs),
            connectivity_max_wait: Duration::from_secs(config.connectivity_max_wait_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&HttpConfig::default())
    }
}

/// Shared request layer; one per process
pub struct ResilientClient {
    client: Client,
    probe_client: Client,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder().timeout(policy.request_timeout).build()?;
        let probe_client = Client::builder().timeout(policy.probe_timeout).build()?;

        Ok(ResilientClient {
            client,
            probe_client,
            limiter,
            policy,
        })
    }

    /// GET `url` and parse the JSON body, retrying transient failures.
    ///
    /// Exhausting the budget yields `RetriesExhausted`, never a panic.
    pub async fn request(&self, url: &str, params: &[(&str, String)]) -> Result<Value> {
        let max = self.policy.max_retries;

        for attempt in 1..=max {
            self.limiter.acquire().await;

            match self.client.get(url).query(params).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::OK {
                        match response.json::<Value>().await {
                            Ok(body) => return Ok(body),
                            Err(e) => {
                                warn!(
                                    "[FMP API] Unreadable body from {}: {} (Attempt {}/{})",
                                    url,
                                    e.without_url(),
                                    attempt,
                                    max
                                );
                                sleep(self.policy.error_backoff * attempt).await;
                            }
                        }
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    warn!(
                        "[FMP API] Received {} - {} (Attempt {}/{})",
                        status.as_u16(),
                        truncate(&body, 200),
                        attempt,
                        max
                    );

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!("[FMP API] Too many requests. Waiting before retrying...");
                        sleep(self.policy.rate_limit_backoff * attempt).await;
                    }
                }
                Err(e) if e.is_timeout() => {
                    warn!("[FMP API] Timeout on {} (Attempt {}/{}). Retrying...", url, attempt, max);
                    sleep(self.policy.timeout_backoff * attempt).await;
                }
                Err(e) if e.is_connect() => {
                    warn!("[FMP API] Lost internet connection. Waiting for reconnection...");
                    if !self.wait_for_connectivity().await {
                        warn!("[FMP API] Reconnection timeout reached for this attempt.");
                    }
                }
                Err(e) => {
                    warn!(
                        "[FMP API] Request failed: {} (Attempt {}/{})",
                        e.without_url(),
                        attempt,
                        max
                    );
                    sleep(self.policy.error_backoff * attempt).await;
                }
            }
        }

        error!("[FMP API] Failed to fetch data from {} after {} attempts.", url, max);
        Err(BackfillError::RetriesExhausted {
            url: url.to_string(),
            attempts: max,
        })
    }

    /// Probe until the network answers or the wait ceiling passes
    pub async fn wait_for_connectivity(&self) -> bool {
        let start = Instant::now();

        loop {
            match self.probe_client.get(&self.policy.probe_url).send().await {
                Ok(_) => {
                    info!("[Internet] Connection restored");
                    return true;
                }
                Err(_) => {
                    if start.elapsed() >= self.policy.connectivity_max_wait {
                        warn!(
                            "[Internet] Still offline after {}s. Proceeding with retry limits.",
                            self.policy.connectivity_max_wait.as_secs()
                        );
                        return false;
                    }
                    warn!(
                        "[Internet] No connection. Retrying in {} seconds...",
                        self.policy.connectivity_retry_interval.as_secs()
                    );
                    sleep(self.policy.connectivity_retry_interval).await;
                }
            }
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{closed_port_url, silent_server_url, MockServer};

    fn fast_policy(max_retries: u32, probe_url: String) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            request_timeout: Duration::from_secs(2),
            rate_limit_backoff: Duration::from_millis(5),
            timeout_backoff: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
            probe_url,
            probe_timeout: Duration::from_millis(200),
            connectivity_retry_interval: Duration::from_millis(10),
            connectivity_max_wait: Duration::from_millis(30),
        }
    }

    fn client(policy: RetryPolicy) -> ResilientClient {
        let limiter = Arc::new(RateLimiter::new(1000, Duration::from_secs(60)));
        ResilientClient::new(limiter, policy).unwrap()
    }

    #[tokio::test]
    async fn test_returns_body_on_200() {
        let server = MockServer::scripted(vec![(200, r#"[{"symbol":"AAPL"}]"#)]).await;
        let client = client(fast_policy(3, server.base_url()));

        let body = client
            .request(&server.url("/stable/quote"), &[("symbol", "AAPL".to_string())])
            .await
            .unwrap();

        assert_eq!(body[0]["symbol"], "AAPL");
        assert_eq!(server.hits(), 1);
        assert!(server.requests()[0].contains("symbol=AAPL"));
    }

    #[tokio::test]
    async fn test_retries_after_429_and_server_error() {
        let server = MockServer::scripted(vec![
            (429, r#"{"message":"slow down"}"#),
            (500, "oops"),
            (200, r#"{"ok":true}"#),
        ])
        .await;
        let client = client(fast_policy(5, server.base_url()));

        let body = client.request(&server.url("/x"), &[]).await.unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn test_429_backoff_grows_with_attempt() {
        let server = MockServer::scripted(vec![
            (429, r#"{"message":"slow down"}"#),
            (429, r#"{"message":"slow down"}"#),
            (200, r#"{"ok":true}"#),
        ])
        .await;
        let mut policy = fast_policy(3, server.base_url());
        policy.rate_limit_backoff = Duration::from_millis(60);
        let client = client(policy);

        let start = Instant::now();
        client.request(&server.url("/x"), &[]).await.unwrap();

        // 60ms after the first 429, 120ms after the second
        assert!(start.elapsed() >= Duration::from_millis(180));
        assert_eq!(server.hits(), 3);
    }

    #[tokio::test]
    async fn test_timeout_backoff_grows_with_attempt() {
        let silent = silent_server_url().await;
        let mut policy = fast_policy(2, silent.clone());
        policy.request_timeout = Duration::from_millis(100);
        policy.timeout_backoff = Duration::from_millis(80);
        let client = client(policy);

        let start = Instant::now();
        let err = client.request(&format!("{}/x", silent), &[]).await.unwrap_err();

        assert!(matches!(err, BackfillError::RetriesExhausted { attempts: 2, .. }));
        // Two request timeouts plus 80ms and 160ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(2 * 100 + 80 + 160));
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_error() {
        let server = MockServer::scripted(vec![(503, "unavailable")]).await;
        let client = client(fast_policy(4, server.base_url()));

        let err = client.request(&server.url("/x"), &[]).await.unwrap_err();
        match err {
            BackfillError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.hits(), 4);
    }

    #[tokio::test]
    async fn test_invalid_json_counts_as_failed_attempt() {
        let server = MockServer::scripted(vec![(200, "not json"), (200, r#"[1,2]"#)]).await;
        let client = client(fast_policy(3, server.base_url()));

        let body = client.request(&server.url("/x"), &[]).await.unwrap();
        assert_eq!(body, serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn test_connection_loss_waits_then_gives_up() {
        let dead = closed_port_url().await;
        let client = client(fast_policy(2, dead.clone()));

        let start = Instant::now();
        let err = client.request(&format!("{}/x", dead), &[]).await.unwrap_err();

        assert!(matches!(err, BackfillError::RetriesExhausted { attempts: 2, .. }));
        // Each attempt spent at least the connectivity ceiling waiting
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_connectivity_probe_succeeds_when_reachable() {
        let server = MockServer::scripted(vec![(200, "{}")]).await;
        let client = client(fast_policy(1, server.base_url()));
        assert!(client.wait_for_connectivity().await);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
