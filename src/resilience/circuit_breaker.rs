use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Circuit breaker states, per §4.1: `closed -> open -> half-open -> closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 1.0,
        }
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_probes_inflight: u32,
    opened_at: Option<Instant>,
}

/// A per-destination circuit breaker guarding a store or upstream service.
///
/// Grounded on the retrieval pack's `CircuitBreaker` (consecutive-failure
/// trip + cooldown), extended with an explicit half-open admission count
/// (`half_open_max`) since the spec requires bounded probing rather than a
/// single trial request.
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    reset_timeout: Duration,
    half_open_max: u32,
    inner: Mutex<Inner>,
    requests_total: AtomicU64,
    failures_total: AtomicU64,
}

/// Returned by `Execute` while the breaker is open — a distinct sentinel so
/// callers can fail fast without attempting a round-trip.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open for {0}")]
pub struct BreakerOpenError(pub String);

impl From<BreakerOpenError> for AppError {
    fn from(e: BreakerOpenError) -> Self {
        AppError::UpstreamUnavailable(e.to_string())
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_params(name, 5, Duration::from_secs(30), 3)
    }

    pub fn with_params(
        name: impl Into<String>,
        max_failures: u32,
        reset_timeout: Duration,
        half_open_max: u32,
    ) -> Self {
        CircuitBreaker {
            name: name.into(),
            max_failures,
            reset_timeout,
            half_open_max,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_probes_inflight: 0,
                opened_at: None,
            }),
            requests_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit breaker mutex poisoned").state
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn failures_total(&self) -> u64 {
        self.failures_total.load(Ordering::Relaxed)
    }

    /// Runs `f` through the breaker: fails fast with `BreakerOpenError` while
    /// open, admits up to `half_open_max` concurrent probes while half-open,
    /// and records the outcome on both paths.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerExecError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        if !self.admit() {
            return Err(BreakerExecError::Open(BreakerOpenError(self.name.clone())));
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.failures_total.fetch_add(1, Ordering::Relaxed);
                self.record_failure();
                Err(BreakerExecError::Inner(e))
            }
        }
    }

    /// Decides whether a call should proceed, transitioning `open -> half-open`
    /// once the reset timeout has elapsed and bookkeeping the in-flight probe
    /// count so only `half_open_max` probes run concurrently.
    fn admit(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_probes_inflight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_probes_inflight < self.half_open_max {
                    inner.half_open_probes_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_probes_inflight = inner.half_open_probes_inflight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.half_open_max {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.max_failures {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_probes_inflight = inner.half_open_probes_inflight.saturating_sub(1);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }
}

#[derive(Debug)]
pub enum BreakerExecError<E> {
    Open(BreakerOpenError),
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_max_failures_consecutive_failures() {
        let cb = CircuitBreaker::with_params("test", 5, Duration::from_secs(30), 3);
        for _ in 0..4 {
            let _ = cb
                .execute::<(), &str, _, _>(|| async { Err("boom") })
                .await;
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        let _ = cb
            .execute::<(), &str, _, _>(|| async { Err("boom") })
            .await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fails_fast_while_open_without_calling_upstream() {
        let cb = CircuitBreaker::with_params("test", 2, Duration::from_secs(30), 3);
        for _ in 0..2 {
            let _ = cb
                .execute::<(), &str, _, _>(|| async { Err("boom") })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let mut called = false;
        let result = cb
            .execute::<(), &str, _, _>(|| {
                called = true;
                async { Ok(()) }
            })
            .await;
        assert!(!called, "upstream must not be invoked while breaker is open");
        assert!(matches!(result, Err(BreakerExecError::Open(_))));
    }

    #[tokio::test]
    async fn closes_after_half_open_max_consecutive_successes() {
        let cb = CircuitBreaker::with_params("test", 2, Duration::from_millis(10), 3);
        for _ in 0..2 {
            let _ = cb
                .execute::<(), &str, _, _>(|| async { Err("boom") })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..3 {
            let result = cb.execute::<(), &str, _, _>(|| async { Ok(()) }).await;
            assert!(result.is_ok(), "probe {i} should be admitted and succeed");
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn any_half_open_probe_failure_reopens() {
        let cb = CircuitBreaker::with_params("test", 1, Duration::from_millis(10), 3);
        let _ = cb.execute::<(), &str, _, _>(|| async { Err("boom") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = cb.execute::<(), &str, _, _>(|| async { Err("boom") }).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failure_counter() {
        let cb = CircuitBreaker::with_params("test", 3, Duration::from_secs(30), 3);
        let _ = cb.execute::<(), &str, _, _>(|| async { Err("boom") }).await;
        let _ = cb.execute::<(), &str, _, _>(|| async { Ok(()) }).await;
        let _ = cb.execute::<(), &str, _, _>(|| async { Err("boom") }).await;
        let _ = cb.execute::<(), &str, _, _>(|| async { Err("boom") }).await;
        // Only 2 consecutive failures since the success reset the counter.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn gauge_values_are_ordered_by_severity() {
        assert!(CircuitState::Closed.as_gauge_value() < CircuitState::HalfOpen.as_gauge_value());
        assert!(CircuitState::HalfOpen.as_gauge_value() < CircuitState::Open.as_gauge_value());
    }
}
