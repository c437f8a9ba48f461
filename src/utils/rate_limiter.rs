/// Sliding window rate limiter
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Timestamps of admitted requests inside the trailing window
#[derive(Debug, Default)]
struct RequestWindow {
    timestamps: VecDeque<Instant>,
}

impl RequestWindow {
    /// Drop entries that have left the window
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn count(&self) -> usize {
        self.timestamps.len()
    }
}

/// Process-wide limiter shared by every request path
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    state: Mutex<RequestWindow>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        RateLimiter {
            max_requests: max_requests.max(1),
            window,
            state: Mutex::new(RequestWindow::default()),
        }
    }

    /// Wait until one more request fits in the window, then record it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.purge(now, self.window);

                if state.count() < self.max_requests {
                    state.timestamps.push_back(now);
                    return;
                }

                match state.timestamps.front() {
                    Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                    None => Duration::ZERO,
                }
            };

            // Lock is released before sleeping
            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                warn!(
                    "[RateLimiter] Hit API limit ({} calls/{}s). Sleeping for {:.2}s...",
                    self.max_requests,
                    self.window.as_secs(),
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Requests currently counted against the window
    pub async fn in_window(&self) -> usize {
        let mut state = self.state.lock().await;
        state.purge(Instant::now(), self.window);
        state.count()
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_window().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_excess_call_waits_for_oldest_to_expire() {
        let limiter = RateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();

        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(400)).await;
        limiter.acquire().await;

        // Third call must wait until the first timestamp leaves the window
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_instead_of_resetting() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));

        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        limiter.acquire().await;

        // First entry expires at t=10, second at t=16
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.in_window().await, 1);

        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);

        let before = Instant::now();
        limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_budget() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(2)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap().duration_since(start));
        }
        admitted.sort();

        // 5 in the first window, 5 in the second, 2 in the third
        assert!(admitted[4] < Duration::from_secs(2));
        assert!(admitted[5] >= Duration::from_secs(2));
        assert!(admitted[10] >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_zero_limit_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.max_requests(), 1);
        limiter.acquire().await;
    }
}
