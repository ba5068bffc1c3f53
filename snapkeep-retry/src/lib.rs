//! Unified retry and backoff logic for Snapkeep provider calls
//!
//! Every remote call the engine makes goes through [`with_policy`]: the
//! number of attempts is bounded, each attempt is bounded by a timeout, and
//! transient failures are followed by an exponential backoff sleep.
//! Permanent failures are returned on the spot.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Terminal outcome of a retried operation
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Operation '{operation}' exceeded maximum retry attempts ({attempts}): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        #[source]
        source: E,
    },
    #[error("Operation '{operation}' timed out after {attempts} attempts")]
    TimedOut {
        operation: &'static str,
        attempts: usize,
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
    /// Name of the operation that failed
    pub fn operation(&self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded { operation, .. }
            | Self::TimedOut { operation, .. }
            | Self::Permanent { operation, .. } => operation,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl RetryableError for std::io::Error {
    fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::TimedOut
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionAborted
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
        )
    }
}

/// Attempt budget, per-attempt timeout and backoff shape for one operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Upper bound on a single attempt; `None` disables the timeout
    pub attempt_timeout: Option<Duration>,
    /// Delay before the second attempt
    pub initial_interval: Duration,
    /// Ceiling for any single delay
    pub max_interval: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Policy tuned for cloud control-plane calls (image create/delete/list)
    pub fn cloud_provider() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Some(Duration::from_secs(60)),
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 1.5,
        }
    }

    /// Policy without delays, used for tests and in-process backends
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            attempt_timeout: None,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Set the per-attempt timeout
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Some(Duration::from_secs(30)),
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// Execute an operation with the default retry policy
pub async fn with_backoff<F, Fut, T, E>(op_name: &'static str, f: F) -> RetryResult<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: RetryableError + std::error::Error + 'static,
{
    with_policy(op_name, &RetryPolicy::default(), f).await
}

enum Failure<E> {
    Transient(E),
    TimedOut,
}

/// Execute an operation under the given retry policy
///
/// The closure receives the 1-based attempt number, so callers can make a
/// non-idempotent operation safe to repeat (e.g. look for the result of an
/// earlier attempt before issuing the call again).
pub async fn with_policy<F, Fut, T, E>(
    op_name: &'static str,
    policy: &RetryPolicy,
    mut f: F,
) -> RetryResult<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: RetryableError + std::error::Error + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        let failure = match run_attempt(policy.attempt_timeout, f(attempt)).await {
            Some(Ok(value)) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Some(Err(err)) if err.is_permanent() => {
                warn!(operation = op_name, attempt, error = %err, "Operation failed permanently");
                return Err(RetryError::Permanent {
                    operation: op_name,
                    source: err,
                });
            }
            Some(Err(err)) => Failure::Transient(err),
            None => Failure::TimedOut,
        };

        if attempt >= max_attempts {
            return Err(match failure {
                Failure::Transient(err) => RetryError::MaxRetriesExceeded {
                    operation: op_name,
                    attempts: attempt,
                    source: err,
                },
                Failure::TimedOut => RetryError::TimedOut {
                    operation: op_name,
                    attempts: attempt,
                },
            });
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
        match &failure {
            Failure::Transient(err) => warn!(
                operation = op_name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            ),
            Failure::TimedOut => warn!(
                operation = op_name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Attempt timed out, retrying"
            ),
        }

        pause(delay).await;
        attempt += 1;
    }
}

#[cfg(any(feature = "async-rt", test))]
async fn run_attempt<Fut, T>(timeout: Option<Duration>, fut: Fut) -> Option<T>
where
    Fut: Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(not(any(feature = "async-rt", test)))]
async fn run_attempt<Fut, T>(_timeout: Option<Duration>, fut: Fut) -> Option<T>
where
    Fut: Future<Output = T>,
{
    Some(fut.await)
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        return;
    }

    #[cfg(any(feature = "async-rt", test))]
    tokio::time::sleep(delay).await;

    #[cfg(not(any(feature = "async-rt", test)))]
    std::thread::sleep(delay);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_successful_operation() {
        let result: RetryResult<&str, io::Error> =
            with_backoff("test_op", |_attempt| async { Ok("success") }).await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_then_success() {
        let attempt_count = Arc::new(AtomicUsize::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = with_backoff("test_op", move |_attempt| {
            let count = attempt_count_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "connection refused",
                    ))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let attempt_count = AtomicUsize::new(0);

        let result: RetryResult<&str, io::Error> = with_backoff("test_op", |_attempt| {
            attempt_count.fetch_add(1, Ordering::SeqCst);
            async {
                Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "permission denied",
                ))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Permanent { .. }));
        assert_eq!(err.operation(), "test_op");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_is_bounded() {
        let policy = RetryPolicy::default().with_max_attempts(4);
        let attempt_count = AtomicUsize::new(0);

        let result: RetryResult<(), io::Error> = with_policy("test_op", &policy, |_attempt| {
            attempt_count.fetch_add(1, Ordering::SeqCst);
            async { Err(io::Error::new(io::ErrorKind::TimedOut, "slow down")) }
        })
        .await;

        match result {
            Err(RetryError::MaxRetriesExceeded {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("expected MaxRetriesExceeded, got {other:?}"),
        }
        assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out() {
        let policy = RetryPolicy::default()
            .with_max_attempts(2)
            .with_attempt_timeout(Duration::from_secs(1));

        let result: RetryResult<(), io::Error> = with_policy("hung_op", &policy, |_attempt| {
            futures::future::pending::<std::result::Result<(), io::Error>>()
        })
        .await;

        match result {
            Err(RetryError::TimedOut {
                operation,
                attempts,
            }) => {
                assert_eq!(operation, "hung_op");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attempt_number_is_passed_to_closure() {
        let policy = RetryPolicy::immediate(3);
        let mut seen = Vec::new();

        let result: RetryResult<usize, io::Error> = with_policy("test_op", &policy, |attempt| {
            seen.push(attempt);
            async move {
                if attempt < 3 {
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_io_error_classification() {
        assert!(io::Error::new(io::ErrorKind::ConnectionReset, "x").is_transient());
        assert!(io::Error::new(io::ErrorKind::NotFound, "x").is_permanent());
    }
}
