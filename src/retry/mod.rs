//! Retry and backoff policies
//!
//! Store writes are retried through [`RetryConfig::run`]; partition cursors
//! use a [`Backoff`] to pace iterator reacquisition.

mod backoff;

pub use backoff::{Backoff, ExponentialBackoff, ExponentialBackoffBuilder, FixedBackoff};

use crate::error::IngestError;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// The last failure of an operation that ran out of attempts
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up after {} attempts: {}", self.attempts, self.last)
    }
}

impl<E: Display + Debug> std::error::Error for RetryError<E> {}

impl<E: Display> From<RetryError<E>> for IngestError {
    fn from(err: RetryError<E>) -> Self {
        IngestError::MaxRetriesExceeded(err.to_string())
    }
}

/// Attempt budget and delays for one store operation
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Relative jitter (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.initial_backoff)
            .max_delay(self.max_backoff)
            .jitter_factor(self.jitter_factor)
            .build()
    }

    /// Run `operation` until it succeeds or `max_attempts` is spent
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_with(&self.backoff(), operation).await
    }

    pub async fn run_with<T, E, F, Fut>(
        &self,
        backoff: &dyn Backoff,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let budget = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "Store operation recovered");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if attempt >= budget {
                return Err(RetryError {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = backoff.next_delay(attempt);
            warn!(
                attempt = attempt,
                budget = budget,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Store operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
