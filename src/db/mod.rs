use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use tracing::info;

use crate::error::{AppError, AppResult};

/// Creates the relational connection pool with the caps from §5 (Concurrency
/// & Resource Model): max 25 connections, 5 idle, 1h max lifetime, 30m
/// max-idle-time. Acquisitions respect the caller's context deadline via
/// sqlx's `acquire_timeout`.
pub async fn create_pool(database_url: &str) -> AppResult<PgPool> {
    info!("connecting to relational store...");

    let pool = PgPoolOptions::new()
        .max_connections(25)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .max_lifetime(Duration::from_secs(60 * 60))
        .idle_timeout(Duration::from_secs(30 * 60))
        .connect(database_url)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, "failed to connect to relational store");
            AppError::Database(e)
        })?;

    info!("relational store connection pool created");
    Ok(pool)
}

/// Connects with the start-up retry policy from §4.1: 5 attempts, 1s → 30s
/// exponential backoff with full jitter.
pub async fn create_pool_with_retry(database_url: &str) -> AppResult<PgPool> {
    use crate::resilience::retry::{retry_with_backoff, BackoffPolicy};

    let policy = BackoffPolicy {
        max_attempts: 5,
        initial: Duration::from_secs(1),
        max: Duration::from_secs(30),
        multiplier: 2.0,
    };

    retry_with_backoff(&policy, "db_connect", || {
        let url = database_url.to_string();
        async move { create_pool(&url).await }
    })
    .await
}

pub async fn health_check(pool: &PgPool) -> AppResult<()> {
    sqlx::query("SELECT 1").execute(pool).await.map_err(AppError::Database)?;
    Ok(())
}

/// Runs a query future under a bounded deadline. Returns `AppError::Timeout`
/// if the deadline elapses before the store responds — distinguished from a
/// genuine store error so callers on fail-closed paths can emit the
/// `Retry-After` hint required by §7.
pub async fn with_query_timeout<T, F>(timeout: Duration, label: &str, fut: F) -> AppResult<T>
where
    F: std::future::Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(query = %label, timeout_secs = timeout.as_secs(), "query timed out");
            Err(AppError::Timeout(format!("{label} exceeded {:?}", timeout)))
        }
    }
}
