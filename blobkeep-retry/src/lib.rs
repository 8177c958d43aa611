//! Retry and backoff helpers for blobkeep orchestrators
//!
//! The storage core never retries on its own. Callers that want
//! "retry transient failures, give up on permanent ones" wrap an
//! operation with [`with_backoff`] and let the error type decide,
//! through [`RetryableError`], whether another attempt makes sense.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure of a retried operation.
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Operation '{operation}' gave up after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        #[source]
        source: E,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The error returned by the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Permanent { source, .. } => source,
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Classifies errors as worth retrying or not.
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Attempt budget plus the delay schedule between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            backoff: default_backoff_policy(),
        }
    }

    /// Policy tuned for calls against remote object storage.
    pub fn cloud_storage(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            backoff: cloud_storage_backoff_policy(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run `f` until it succeeds, fails permanently, or the policy runs out.
///
/// `f` receives the 1-based attempt number. A `max_attempts` of zero is
/// treated as a single attempt.
pub async fn with_backoff<F, Fut, T, E>(
    op_name: &'static str,
    policy: RetryPolicy,
    mut f: F,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::error::Error + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut schedule = policy.backoff;
    schedule.reset();

    let mut attempt = 1;
    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        let err = match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if err.is_permanent() {
            warn!(operation = op_name, attempt, error = %err, "Operation failed permanently");
            return Err(RetryError::Permanent {
                operation: op_name,
                source: err,
            });
        }

        let delay = if attempt < max_attempts {
            schedule.next_backoff()
        } else {
            None
        };

        match delay {
            Some(delay) => {
                warn!(
                    operation = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            None => {
                return Err(RetryError::Exhausted {
                    operation: op_name,
                    attempts: attempt,
                    source: err,
                });
            }
        }
    }
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy optimized for cloud storage operations
pub fn cloud_storage_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .with_multiplier(1.5)
        .build()
}
