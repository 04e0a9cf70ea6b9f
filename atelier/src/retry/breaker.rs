//! Per-service circuit breaker: closed → open → half-open → closed.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Breaker state as observed by callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Error wrapper for calls guarded by a breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the call was rejected without being attempted.
    #[error("circuit open for service {service}")]
    Open { service: String },
    /// The underlying call ran and failed.
    #[error(transparent)]
    Inner(E),
}

struct Inner {
    state: BreakerState,
    /// Failures observed in the current window.
    failures: u32,
    window_start: Instant,
    opened_at: Instant,
    /// One probe at a time while half-open.
    probe_in_flight: bool,
}

/// Failure-counting breaker for one external service.
///
/// After `fail_threshold` failures within `window`, calls fail fast with
/// [`BreakerError::Open`] until `timeout` elapses; then a single probe is
/// admitted. Probe success closes the breaker, probe failure reopens it.
/// State is per-process; instances do not coordinate.
pub struct CircuitBreaker {
    service: String,
    fail_threshold: u32,
    window: Duration,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, fail_threshold: u32, timeout: Duration) -> Self {
        Self {
            service: service.into(),
            fail_threshold: fail_threshold.max(1),
            window: timeout,
            timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                window_start: Instant::now(),
                opened_at: Instant::now(),
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Inner holds no user code, so poisoning cannot leave partial state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission check. `Ok` means the caller may run the protected call and
    /// must report the outcome via [`on_success`]/[`on_failure`].
    ///
    /// [`on_success`]: CircuitBreaker::on_success
    /// [`on_failure`]: CircuitBreaker::on_failure
    pub fn try_acquire(&self) -> Result<(), BreakerError<std::convert::Infallible>> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= self.timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        service: self.service.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BreakerError::Open {
                        service: self.service.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.window_start = Instant::now();
        inner.probe_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Instant::now();
                inner.probe_in_flight = false;
                warn!(service = %self.service, "circuit breaker probe failed; reopening");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                if inner.window_start.elapsed() > self.window {
                    inner.failures = 0;
                    inner.window_start = Instant::now();
                }
                inner.failures += 1;
                if inner.failures >= self.fail_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Instant::now();
                    warn!(
                        service = %self.service,
                        failures = inner.failures,
                        "circuit breaker opened"
                    );
                }
            }
        }
    }

    /// Runs `f` through the breaker, recording the outcome.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(BreakerError::Open { service }) = self.try_acquire() {
            return Err(BreakerError::Open { service });
        }
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }
}

/// Process-local set of breakers, one per service name.
pub struct CircuitBreakerSet {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    fail_threshold: u32,
    timeout: Duration,
}

impl CircuitBreakerSet {
    pub fn new(fail_threshold: u32, timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            fail_threshold,
            timeout,
        }
    }

    /// Returns the breaker for `service`, creating it on first use.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(service, self.fail_threshold, self.timeout))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("deploy", 3, Duration::from_secs(60));
        for _ in 0..3 {
            let r: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("boom") }).await;
            assert!(matches!(r, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let rejected: Result<(), BreakerError<&str>> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new("llm", 1, Duration::from_millis(20));
        let _: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("boom") }).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let probe: Result<u32, BreakerError<&str>> = breaker.call(|| async { Ok(7) }).await;
        assert!(matches!(probe, Ok(7)));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("vcs", 1, Duration::from_millis(20));
        let _: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("boom") }).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let probe: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("still down") }).await;
        assert!(matches!(probe, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new("db", 1, Duration::from_millis(10));
        let _: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("boom") }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_err());
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("chat", 3, Duration::from_secs(60));
        for _ in 0..2 {
            let _: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("boom") }).await;
        }
        let _: Result<(), BreakerError<&str>> = breaker.call(|| async { Ok(()) }).await;
        for _ in 0..2 {
            let _: Result<(), BreakerError<&str>> = breaker.call(|| async { Err("boom") }).await;
        }
        // Two failures after the reset stay below the threshold of three.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn set_returns_same_breaker_per_service() {
        let set = CircuitBreakerSet::new(5, Duration::from_secs(60));
        let a = set.breaker("deploy");
        let b = set.breaker("deploy");
        assert!(Arc::ptr_eq(&a, &b));
        let c = set.breaker("llm");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
