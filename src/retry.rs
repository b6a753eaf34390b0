// src/retry.rs

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often and how patiently a fallible operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The token fired before or between attempts, or during one.
    Cancelled,
    /// The last error once attempts ran out, or the first non-retryable one.
    Exhausted { attempts: u32, last: E },
}

/// Runs `op` until it succeeds, fails with an error `is_retryable` rejects,
/// or `policy.max_attempts` is reached.
///
/// Cancellation wins over everything else: an attempt in flight is dropped
/// as soon as `token` fires, and no delay is slept after that.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    token: &CancellationToken,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            result = op(attempt) => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= policy.max_attempts || !is_retryable(&err) {
            return Err(RetryError::Exhausted { attempts: attempt, last: err });
        }

        debug!(attempt, max_attempts = policy.max_attempts, error = %err, "attempt failed, retrying");

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(policy.delay) => {}
        }
        attempt += 1;
    }
}
