use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{AppError, AppResult};

/// An exponential backoff schedule with full jitter, grounded on the
/// retrieval pack's `retry_delay`/`apply_jitter` helpers but parameterized
/// per call site rather than hardcoded, since §4.1 specifies different
/// schedules for hot-path cache calls versus start-up store connects.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// §4.1 hot-path policy for cache/session operations: 3 attempts,
    /// 100ms initial, doubling, capped at 1s.
    pub const fn hot_path() -> Self {
        BackoffPolicy {
            max_attempts: 3,
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    /// §4.1 start-up policy for the relational store connect: 5 attempts,
    /// 1s initial, doubling, capped at 30s.
    pub const fn startup() -> Self {
        BackoffPolicy {
            max_attempts: 5,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max.as_millis() as f64);
        let jittered_ms = rand::thread_rng().gen_range(0.0..=capped_ms);
        Duration::from_millis(jittered_ms as u64)
    }
}

/// Retries `f` up to `policy.max_attempts` times with full jitter between
/// attempts, logging a warning on every retry. The last error is surfaced
/// unchanged so callers keep their original error taxonomy.
pub async fn retry_with_backoff<T, F, Fut>(policy: &BackoffPolicy, label: &str, mut f: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(operation = %label, attempt, "retry attempts exhausted");
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(operation = %label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Like `retry_with_backoff` but treats any error as retryable only if
/// `is_retryable` returns true; non-retryable errors return immediately.
pub async fn retry_with_backoff_if<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut f: F,
    is_retryable: impl Fn(&AppError) -> bool,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = AppResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(operation = %label, attempt, "retry attempts exhausted");
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(operation = %label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying after failure");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
