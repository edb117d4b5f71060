//! Retry with backoff for transient failures.
//!
//! [`RetryExecutor`] wraps an async operation and re-runs it until it
//! succeeds or the configured number of attempts is used up.
//!
//! # Backoff Strategy
//!
//! Attempt 0 runs immediately. Attempt `i` first waits:
//! - [`Backoff::Fixed`]: `base_delay`
//! - [`Backoff::Linear`]: `i * base_delay`
//!
//! Every wait is raced against a [`CancellationToken`]; cancelling aborts the
//! wait at once instead of letting it run out.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// Delay grows with the attempt index.
    #[default]
    Linear,
}

/// Retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    /// Delay before the attempt with the given zero-based index.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_millis(200))
    }
}

/// Error returned by [`RetryExecutor`].
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed; carries the last error.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The operation failed with an error the caller marked as not retryable.
    #[error("{operation} failed on attempt {attempts}: {source}")]
    Aborted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// Cancellation was requested before the operation succeeded.
    #[error("{operation} cancelled after {attempts} attempts")]
    Cancelled { operation: String, attempts: u32 },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of attempts that ran.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Aborted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last error from the operation, if it ran at all.
    pub fn into_source(self) -> Option<E> {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Aborted { source, .. } => Some(source),
            RetryError::Cancelled { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Runs named operations under a [`RetryPolicy`].
///
/// Attempt counters are kept per operation name and reset when an invocation
/// starts, so concurrent callers using different names do not interfere.
#[derive(Debug, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attempts made by the latest invocation of `operation`.
    pub fn attempts(&self, operation: &str) -> u32 {
        self.attempts.lock().get(operation).copied().unwrap_or(0)
    }

    /// Run `operation`, retrying every error.
    pub async fn run<F, Fut, T, E>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.run_if(name, cancel, |_| true, operation).await
    }

    /// Run `operation`, retrying only errors for which `retryable` is true.
    pub async fn run_if<F, Fut, T, E, P>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        retryable: P,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
        P: Fn(&E) -> bool,
    {
        self.attempts.lock().insert(name.to_string(), 0);

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let delay = self.policy.delay_for(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!(operation = name, attempt, "retry cancelled during backoff");
                        return Err(RetryError::Cancelled {
                            operation: name.to_string(),
                            attempts: attempt,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            } else if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    operation: name.to_string(),
                    attempts: 0,
                });
            }

            self.bump(name);
            let result = operation().await;
            attempt += 1;

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation = name, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !retryable(&err) => {
                    return Err(RetryError::Aborted {
                        operation: name.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) if attempt >= max_attempts => {
                    tracing::warn!(
                        operation = name,
                        attempts = attempt,
                        error = %err,
                        "retries exhausted",
                    );
                    return Err(RetryError::Exhausted {
                        operation: name.to_string(),
                        attempts: attempt,
                        source: err,
                    });
                }
                Err(err) => {
                    tracing::debug!(
                        operation = name,
                        attempt,
                        max_attempts,
                        delay_ms = self.policy.delay_for(attempt).as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying after backoff",
                    );
                }
            }
        }
    }

    fn bump(&self, name: &str) {
        *self.attempts.lock().entry(name.to_string()).or_insert(0) += 1;
    }
}
