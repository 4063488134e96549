//! Retry policy with exponential backoff.
//!
//! One policy object is applied uniformly by the fetch layer. Only errors
//! that [`storysync_shared::StorySyncError::is_retryable`] accepts are retried.

use std::future::Future;
use std::time::Duration;

use storysync_shared::{Result, SyncConfig};

/// `(max_attempts, backoff schedule)` for a single fetch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor applied after every retry.
    pub backoff_multiplier: f64,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_multiplier,
            max_delay,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.backoff_base,
            config.backoff_multiplier,
            config.backoff_max,
        )
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Delay slept after failed attempt number `attempt` (1-based).
    ///
    /// Saturates at `max_delay` when the exponent overflows or the
    /// multiplier is not finite.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is exhausted. Returns the last error on failure.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        error = %e,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(error = %e, attempts = attempt, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0, Duration::from_secs(30))
    }
}
