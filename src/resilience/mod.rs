pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerExecError, BreakerOpenError, CircuitBreaker, CircuitState};
pub use retry::{retry_with_backoff, retry_with_backoff_if, BackoffPolicy};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

/// Tracks whether a dependent store is currently considered degraded, so
/// gateway middleware can switch between fail-open and fail-closed policy
/// per §4.1/§7 without every caller re-deriving it from the circuit breaker
/// state directly.
#[derive(Clone)]
pub struct DegradedFlag {
    flag: Arc<AtomicBool>,
    name: &'static str,
}

impl DegradedFlag {
    pub fn new(name: &'static str) -> Self {
        DegradedFlag {
            flag: Arc::new(AtomicBool::new(false)),
            name,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn set(&self, degraded: bool) {
        let previous = self.flag.swap(degraded, Ordering::Relaxed);
        if previous != degraded {
            if degraded {
                warn!(dependency = self.name, "entering degraded mode");
            } else {
                info!(dependency = self.name, "recovered from degraded mode");
            }
            metrics::gauge!("secureconnect_degraded_mode", "dependency" => self.name)
                .set(if degraded { 1.0 } else { 0.0 });
        }
    }

    /// Spawns a background task that pings `probe` every `interval` and
    /// flips the flag based on the result, per §4.1's 10s health-check
    /// cadence for degraded-mode recovery detection.
    pub fn spawn_health_check<F, Fut>(&self, interval: Duration, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let healthy = probe().await;
                this.set(!healthy);
            }
        });
    }
}
