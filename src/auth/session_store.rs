use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{keys, CacheClient};
use crate::error::AppResult;

const FAILED_LOGIN_WINDOW: Duration = Duration::from_secs(15 * 60);
const FAILED_LOGIN_LOCK_THRESHOLD: i64 = 5;
const ACCOUNT_LOCK_DURATION: Duration = Duration::from_secs(15 * 60);

/// A session record keyed by `session_id` (the refresh token's `jti`),
/// per §4.3. `refresh_hash` is the SHA-256 digest of the current refresh
/// token, compared on every `Refresh` call to detect replay of a rotated-out
/// token. `access_jti` is the most recently issued access token's `jti`, so
/// a subsequent refresh can blacklist it immediately instead of waiting out
/// its own short TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: Uuid,
    pub username: String,
    pub refresh_hash: String,
    pub access_jti: String,
    pub created_at: chrono::DateTime<Utc>,
}

pub async fn create_session(
    cache: &CacheClient,
    session_id: &str,
    record: &SessionRecord,
    ttl: Duration,
) -> AppResult<()> {
    cache.set(&keys::session(session_id), record, Some(ttl)).await?;
    let member_key = keys::user_sessions(record.user_id);
    let mut members: Vec<String> = cache.get(&member_key).await?.unwrap_or_default();
    if !members.contains(&session_id.to_string()) {
        members.push(session_id.to_string());
    }
    cache.set(&member_key, &members, Some(ttl)).await
}

pub async fn get_session(cache: &CacheClient, session_id: &str) -> AppResult<Option<SessionRecord>> {
    cache.get(&keys::session(session_id)).await
}

pub async fn delete_session(cache: &CacheClient, session_id: &str) -> AppResult<()> {
    cache.delete(&keys::session(session_id)).await?;
    Ok(())
}

/// Terminates every session for a user — used on logout-everywhere, password
/// change, and the stolen-refresh-token heuristic in §4.4.
pub async fn delete_user_sessions(cache: &CacheClient, user_id: Uuid) -> AppResult<()> {
    let member_key = keys::user_sessions(user_id);
    let members: Vec<String> = cache.get(&member_key).await?.unwrap_or_default();
    for session_id in &members {
        cache.delete(&keys::session(session_id)).await?;
    }
    cache.delete(&member_key).await?;
    Ok(())
}

/// Blacklists an access token's `jti` until its own expiry, so a logged-out
/// or rotated-out access token is rejected immediately rather than waiting
/// out its TTL.
pub async fn blacklist_token(cache: &CacheClient, jti: &str, ttl_until_expiry: Duration) -> AppResult<()> {
    cache.set(&keys::blacklist(jti), &true, Some(ttl_until_expiry)).await
}

/// Fail-open per §4.3: a store error is treated as "not blacklisted" by the
/// caller, since `CacheClient::get` already surfaces degraded-mode errors
/// distinctly and callers decide the policy — see `auth::is_revoked`.
pub async fn is_blacklisted(cache: &CacheClient, jti: &str) -> AppResult<bool> {
    Ok(cache.get::<bool>(&keys::blacklist(jti)).await?.unwrap_or(false))
}

pub use is_blacklisted as is_revoked;

/// Increments the failed-login counter for an identifier (lowercased
/// email), setting a 15-minute expiry on the first attempt within a fresh
/// window, and flips the account-lock flag once the threshold is reached.
/// Returns the new count.
pub async fn record_failed_login(cache: &CacheClient, identifier: &str) -> AppResult<i64> {
    let key = keys::failed_login(identifier);
    let count = cache.incr(&key).await?;
    if count == 1 {
        cache.expire(&key, FAILED_LOGIN_WINDOW).await?;
    }
    if count >= FAILED_LOGIN_LOCK_THRESHOLD {
        cache
            .set(&keys::account_lock(identifier), &true, Some(ACCOUNT_LOCK_DURATION))
            .await?;
    }
    Ok(count)
}

pub async fn clear_failed_logins(cache: &CacheClient, identifier: &str) -> AppResult<()> {
    cache.delete(&keys::failed_login(identifier)).await?;
    cache.delete(&keys::account_lock(identifier)).await?;
    Ok(())
}

pub async fn is_account_locked(cache: &CacheClient, identifier: &str) -> AppResult<bool> {
    Ok(cache.get::<bool>(&keys::account_lock(identifier)).await?.unwrap_or(false))
}
