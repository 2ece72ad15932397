// Error recovery utilities
// Bounded retry with exponential backoff for transient failures

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry policy for transient failures (storage I/O, dropped connections)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay
    pub max_backoff_ms: u64,
    /// Growth factor applied after every failed attempt
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 20,
            max_backoff_ms: 1_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after `attempt` (1-based) has failed
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. The last error is returned unchanged.
    pub async fn retry<T, E, F, Fut, R>(
        &self,
        operation_name: &str,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < max_attempts && is_retryable(&error) => {
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
