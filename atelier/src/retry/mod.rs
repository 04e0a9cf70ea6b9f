//! Retry with backoff for external calls.
//!
//! A policy decides attempt counts and delays; [`retry_with_policy`] wraps a
//! call-site with a retryability predicate so only whitelisted failures are
//! retried. The circuit breaker in [`breaker`] guards the same call-sites
//! against cascading faults.

mod breaker;

pub use breaker::{BreakerError, BreakerState, CircuitBreaker, CircuitBreakerSet};

use std::future::Future;
use std::time::Duration;

use crate::config::CoreConfig;

/// Retry policy for handling transient failures.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// Fail immediately on error.
    None,
    /// Constant delay between attempts.
    Fixed {
        max_attempts: usize,
        interval: Duration,
    },
    /// Exponentially increasing delay, capped.
    Exponential {
        max_attempts: usize,
        initial_interval: Duration,
        max_interval: Duration,
        multiplier: f64,
    },
}

impl RetryPolicy {
    pub fn none() -> Self {
        RetryPolicy::None
    }

    pub fn fixed(max_attempts: usize, interval: Duration) -> Self {
        RetryPolicy::Fixed {
            max_attempts,
            interval,
        }
    }

    pub fn exponential(
        max_attempts: usize,
        initial_interval: Duration,
        max_interval: Duration,
        multiplier: f64,
    ) -> Self {
        RetryPolicy::Exponential {
            max_attempts,
            initial_interval,
            max_interval,
            multiplier,
        }
    }

    /// The configured policy for calls that leave the process (LLM, tools,
    /// stores, chat API).
    pub fn external(config: &CoreConfig) -> Self {
        RetryPolicy::Exponential {
            max_attempts: config.max_retries,
            initial_interval: config.retry_base,
            max_interval: config.retry_cap,
            multiplier: config.retry_factor,
        }
    }

    /// True when a retry is allowed after `attempt` failures (0-based).
    pub fn should_retry(&self, attempt: usize) -> bool {
        match self {
            RetryPolicy::None => false,
            RetryPolicy::Fixed { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => attempt + 1 < *max_attempts,
        }
    }

    /// Delay before the retry following `attempt` failures.
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Fixed { interval, .. } => *interval,
            RetryPolicy::Exponential {
                initial_interval,
                max_interval,
                multiplier,
                ..
            } => {
                let secs = initial_interval.as_secs_f64() * multiplier.powi(attempt as i32);
                Duration::from_secs_f64(secs).min(*max_interval)
            }
        }
    }

    pub fn max_attempts(&self) -> usize {
        match self {
            RetryPolicy::None => 1,
            RetryPolicy::Fixed { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::None
    }
}

/// Runs `f` until it succeeds, the error is not retryable, or attempts are
/// exhausted. The last error is re-raised unchanged.
pub async fn retry_with_policy<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut is_retryable: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 0usize;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) || !policy.should_retry(attempt) {
                    return Err(err);
                }
                let delay = policy.delay(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
