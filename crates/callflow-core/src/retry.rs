// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded exponential backoff.
//!
//! [`RetryPolicy`] is pure: it only computes waits and the stop decision.
//! [`retry_with_backoff`] drives an async operation under a policy and
//! reports each retry to an observer before sleeping.

use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Failure classification used by [`retry_with_backoff`].
pub trait Retryable {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;
}

/// Retry parameters.
///
/// Wait before attempt `k` (k >= 2) is `min(initial_wait * multiplier^(k-2), max_wait)`.
/// Attempt 1 never waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (at least 1).
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub initial_wait: Duration,
    /// Upper bound for any single wait.
    pub max_wait: Duration,
    /// Growth factor between consecutive waits.
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Create a policy with the default multiplier of 2.
    pub fn new(max_attempts: u32, initial_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            initial_wait,
            max_wait,
            multiplier: 2,
        }
    }

    /// Replace the growth factor.
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Calculate the wait before the given attempt (1-indexed).
    pub fn wait_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.saturating_pow(attempt - 2);
        self.initial_wait.saturating_mul(factor).min(self.max_wait)
    }

    /// Whether another attempt is allowed after `attempts_made` consecutive failures.
    pub fn allows_attempt_after(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }

    /// Waits before attempts 2 through `max_attempts`, in order.
    pub fn waits(&self) -> impl Iterator<Item = Duration> + '_ {
        (2..=self.max_attempts).map(|attempt| self.wait_before(attempt))
    }

    /// Sum of every backoff wait a fully exhausted run sleeps through.
    pub fn total_wait(&self) -> Duration {
        self.waits().fold(Duration::ZERO, Duration::saturating_add)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Successful result together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    /// Value returned by the successful attempt.
    pub value: T,
    /// Attempts consumed, at least 1.
    pub attempts: u32,
}

/// Final failure of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryError<E> {
    /// The last failure observed.
    pub error: E,
    /// Attempts consumed, at least 1.
    pub attempts: u32,
    /// True when the policy ran out of attempts on retryable failures;
    /// false when a non-retryable failure stopped it early.
    pub exhausted: bool,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exhausted {
            write!(f, "gave up after {} attempts: {}", self.attempts, self.error)
        } else {
            write!(f, "{}", self.error)
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Run `operation` under `policy`.
///
/// `operation` receives the 1-indexed attempt number. Retryable failures are
/// retried until `policy.max_attempts` attempts have been made; any other
/// failure is returned immediately. `on_retry(failed_attempt, &error, wait)`
/// runs before every backoff sleep.
pub async fn retry_with_backoff<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: O,
) -> Result<Retried<T>, RetryError<E>>
where
    E: Retryable,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    O: FnMut(u32, &E, Duration),
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) if !error.is_retryable() => {
                return Err(RetryError {
                    error,
                    attempts: attempt,
                    exhausted: false,
                });
            }
            Err(error) if !policy.allows_attempt_after(attempt) => {
                return Err(RetryError {
                    error,
                    attempts: attempt,
                    exhausted: true,
                });
            }
            Err(error) => {
                let wait = policy.wait_before(attempt + 1);
                on_retry(attempt, &error, wait);
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}
