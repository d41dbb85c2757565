//! Async retry with fixed, linear, or exponential backoff.
//!
//! Operations return `Result<Option<T>, E>`: `Ok(None)` is an "empty"
//! outcome that is retried by default, just like an error.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Linear,
    Exponential,
}

/// Retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1)
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            base_delay: delay,
            ..Self::default()
        }
    }

    pub fn exponential(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay after the given 1-based failed attempt, capped at `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Default retry predicate: retry while there is no value
pub fn retry_if_empty<T, E>(result: Option<&T>, _error: Option<&E>) -> bool {
    result.is_none()
}

/// Run `operation` under `policy` with the default predicate and no hook
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    retry_with(policy, retry_if_empty, |_, _| {}, operation).await
}

/// Run `operation` until it yields a value the predicate accepts.
///
/// - `should_retry(result, error)` is consulted after every attempt. When it
///   rejects an error, that error is returned immediately.
/// - `on_retry(attempt, delay)` runs before each sleep.
/// - On exhaustion the last error is returned if the last attempt failed,
///   otherwise the last result (possibly `None`).
pub async fn retry_with<T, E, F, Fut, P, R>(
    policy: &RetryPolicy,
    mut should_retry: P,
    mut on_retry: R,
    mut operation: F,
) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    P: FnMut(Option<&T>, Option<&E>) -> bool,
    R: FnMut(u32, Duration),
{
    let attempts = policy.attempts.max(1);
    let mut last: Result<Option<T>, E> = Ok(None);

    for attempt in 1..=attempts {
        match operation(attempt).await {
            Ok(result) => {
                if !should_retry(result.as_ref(), None) {
                    return Ok(result);
                }
                last = Ok(result);
            }
            Err(error) => {
                if !should_retry(None, Some(&error)) {
                    return Err(error);
                }
                last = Err(error);
            }
        }

        if attempt < attempts {
            let delay = policy.delay_for(attempt);
            on_retry(attempt, delay);
            tokio::time::sleep(delay).await;
        }
    }

    last
}
