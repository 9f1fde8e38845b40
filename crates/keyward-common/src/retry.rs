//! Bounded retry combinator
//!
//! Every retry loop in keyward goes through [`attempt`]: it re-runs an
//! operation while it fails with a retryable storage error, sleeping on the
//! injected [`LeaseClock`] between attempts, and gives up with
//! [`StorageError::TemporaryFailure`] once the attempt budget is spent.
//! Non-retryable errors propagate unchanged on the first occurrence.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::clock::LeaseClock;
use crate::error::{StorageError, StorageResult};

/// Delay between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// Doubles after every failed attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let backoff = if delay.is_zero() {
            Backoff::None
        } else {
            Backoff::Fixed(delay)
        };
        Self::new(max_attempts, backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(
            crate::constants::DEFAULT_IDS_RETRY_COUNT,
            Duration::from_millis(crate::constants::DEFAULT_IDS_WAIT_TIME_MS),
        )
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is exhausted. `op` receives the 1-based attempt
/// number.
pub async fn attempt<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    clock: &dyn LeaseClock,
    mut op: F,
) -> StorageResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    // A budget of zero still runs the operation once; a configured retry
    // count never disables the operation itself.
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };

        if attempt >= max_attempts {
            return Err(StorageError::TemporaryFailure {
                operation: operation.to_string(),
                attempts: attempt,
                source: Box::new(err),
            });
        }

        let delay = policy.backoff.delay(attempt);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Storage failure, retrying"
        );
        clock.sleep(delay).await;
    }
}
