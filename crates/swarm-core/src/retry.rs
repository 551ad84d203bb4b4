//! Retry policy applied at each backend call site

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::BackendError;

/// Attempt ceiling, exponential backoff, and the predicate deciding which
/// failures are worth another attempt
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable: fn(&BackendError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            retryable: BackendError::is_transient,
        }
    }
}

/// Final result of a retried operation and how many attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, BackendError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_retryable(mut self, predicate: fn(&BackendError) -> bool) -> Self {
        self.retryable = predicate;
        self
    }

    /// Wait before attempt `attempt + 1`, where `attempt` is 0-based.
    /// `base * 2^attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt ceiling is reached. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{}: succeeded on attempt {}/{}", label, attempt, max_attempts);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    let retryable = (self.retryable)(&err);
                    warn!(
                        "{}: attempt {}/{} failed (retryable={}): {}",
                        label, attempt, max_attempts, retryable, err
                    );

                    if !retryable || attempt >= max_attempts {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }

                    let delay = self.delay_for(attempt - 1);
                    debug!("{}: backing off for {:?} before retry", label, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
