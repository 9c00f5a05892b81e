use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window limiter for outbound calls.
///
/// [`RateLimiter::acquire`] sleeps until a slot is free; callers are never
/// queued or rejected.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: u32, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1) as usize,
            window,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub fn per_minute(max_calls: u32) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls
                    .front()
                    .is_some_and(|&oldest| now.duration_since(oldest) >= self.window)
                {
                    calls.pop_front();
                }

                match calls.front() {
                    Some(&oldest) if calls.len() >= self.max_calls => {
                        self.window.saturating_sub(now.duration_since(oldest))
                    }
                    _ => {
                        calls.push_back(now);
                        return;
                    }
                }
            };

            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Calls recorded in the current window.
    pub async fn in_flight(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|&&at| now.duration_since(at) < self.window)
            .count()
    }
}
