pub mod keys;

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{AppError, AppResult};
use crate::resilience::{BackoffPolicy, CircuitBreaker, DegradedFlag};

/// Wraps the shared-state store connection, grounded on the retrieval
/// pack's `RedisClient` (JSON-serialized get/set, TTL helpers, blacklist
/// and failed-login counters) but adding the circuit breaker + degraded
/// flag the spec requires for every store collaborator in §4.1.
#[derive(Clone)]
pub struct CacheClient {
    conn: ConnectionManager,
    breaker: std::sync::Arc<CircuitBreaker>,
    degraded: DegradedFlag,
    query_timeout: Duration,
}

impl CacheClient {
    pub async fn connect(redis_url: &str, query_timeout: Duration) -> AppResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            AppError::StoreUnavailable(format!("invalid shared-state store url: {e}"))
        })?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("shared-state store connect failed: {e}")))?;

        Ok(CacheClient {
            conn,
            breaker: std::sync::Arc::new(CircuitBreaker::new("shared_state_store")),
            degraded: DegradedFlag::new("shared_state_store"),
            query_timeout,
        })
    }

    pub fn degraded_flag(&self) -> DegradedFlag {
        self.degraded.clone()
    }

    pub fn breaker(&self) -> std::sync::Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Runs a raw cache operation through the circuit breaker, timeout and
    /// retry policy shared by every method below. Failures flip the
    /// degraded flag; `BreakerExecError::Open` maps straight to
    /// `AppError::StoreUnavailable` without attempting the round trip.
    async fn guarded<T, F, Fut>(&self, label: &str, f: F) -> AppResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        let timeout = self.query_timeout;
        let result = self
            .breaker
            .execute(|| async {
                tokio::time::timeout(timeout, f())
                    .await
                    .unwrap_or_else(|_| Err(AppError::Timeout(label.to_string())))
            })
            .await;

        match result {
            Ok(value) => {
                self.degraded.set(false);
                Ok(value)
            }
            Err(crate::resilience::BreakerExecError::Open(e)) => {
                self.degraded.set(true);
                Err(e.into())
            }
            Err(crate::resilience::BreakerExecError::Inner(e)) => {
                self.degraded.set(true);
                Err(e)
            }
        }
    }

    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Option<Duration>) -> AppResult<()> {
        let payload = serde_json::to_string(value).map_err(|e| AppError::Internal.describe(e))?;
        self.guarded("cache_set", || {
            let mut conn = self.conn.clone();
            let key = key.to_string();
            let payload = payload.clone();
            async move {
                match ttl {
                    Some(ttl) => conn
                        .set_ex::<_, _, ()>(&key, payload, ttl.as_secs())
                        .await
                        .map_err(|e| AppError::StoreUnavailable(e.to_string())),
                    None => conn
                        .set::<_, _, ()>(&key, payload)
                        .await
                        .map_err(|e| AppError::StoreUnavailable(e.to_string())),
                }
            }
        })
        .await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let raw: Option<String> = self
            .guarded("cache_get", || {
                let mut conn = self.conn.clone();
                let key = key.to_string();
                async move {
                    conn.get::<_, Option<String>>(&key)
                        .await
                        .map_err(|e| AppError::StoreUnavailable(e.to_string()))
                }
            })
            .await?;

        match raw {
            Some(s) => serde_json::from_str(&s)
                .map(Some)
                .map_err(|e| AppError::Internal.describe(e)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> AppResult<bool> {
        let removed: i64 = self
            .guarded("cache_delete", || {
                let mut conn = self.conn.clone();
                let key = key.to_string();
                async move {
                    conn.del::<_, i64>(&key)
                        .await
                        .map_err(|e| AppError::StoreUnavailable(e.to_string()))
                }
            })
            .await?;
        Ok(removed > 0)
    }

    pub async fn exists(&self, key: &str) -> AppResult<bool> {
        self.guarded("cache_exists", || {
            let mut conn = self.conn.clone();
            let key = key.to_string();
            async move {
                conn.exists::<_, bool>(&key)
                    .await
                    .map_err(|e| AppError::StoreUnavailable(e.to_string()))
            }
        })
        .await
    }

    pub async fn incr(&self, key: &str) -> AppResult<i64> {
        self.guarded("cache_incr", || {
            let mut conn = self.conn.clone();
            let key = key.to_string();
            async move {
                conn.incr::<_, _, i64>(&key, 1)
                    .await
                    .map_err(|e| AppError::StoreUnavailable(e.to_string()))
            }
        })
        .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        self.guarded("cache_expire", || {
            let mut conn = self.conn.clone();
            let key = key.to_string();
            async move {
                conn.expire::<_, bool>(&key, ttl.as_secs() as i64)
                    .await
                    .map_err(|e| AppError::StoreUnavailable(e.to_string()))
            }
        })
        .await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        self.guarded("cache_publish", || {
            let mut conn = self.conn.clone();
            let channel = channel.to_string();
            let payload = payload.to_string();
            async move {
                conn.publish::<_, _, ()>(&channel, payload)
                    .await
                    .map_err(|e| AppError::StoreUnavailable(e.to_string()))
            }
        })
        .await
    }

    /// Atomic sliding-window counter over a sorted set: every call prunes
    /// entries older than `window`, records the current call, and returns
    /// the resulting count. Grounded on §4.7's "atomic script" rate-limit
    /// requirement; `redis::Script` keeps this a single round trip without
    /// pulling in a dependency the corpus doesn't already carry.
    pub async fn sliding_window_count(&self, key: &str, window: Duration) -> AppResult<i64> {
        const SCRIPT: &str = r#"
            redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
            redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
            redis.call('PEXPIRE', KEYS[1], ARGV[4])
            return redis.call('ZCARD', KEYS[1])
        "#;
        self.guarded("cache_sliding_window_count", || {
            let mut conn = self.conn.clone();
            let key = key.to_string();
            let now_ms = chrono::Utc::now().timestamp_millis();
            let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
            let cutoff = now_ms - window.as_millis() as i64;
            let ttl_ms = window.as_millis() as i64 + 1_000;
            async move {
                redis::Script::new(SCRIPT)
                    .key(key)
                    .arg(cutoff)
                    .arg(now_ms)
                    .arg(member)
                    .arg(ttl_ms)
                    .invoke_async::<_, i64>(&mut conn)
                    .await
                    .map_err(|e| AppError::StoreUnavailable(e.to_string()))
            }
        })
        .await
    }

    pub fn client_for_subscribe(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn retry_policy() -> BackoffPolicy {
        BackoffPolicy::hot_path()
    }
}

/// Small extension so `AppError::Internal` can carry a logged cause without
/// adding a dedicated variant for serialization failures, which should never
/// be reachable in practice but must still produce a typed error.
trait DescribeInternal {
    fn describe(self, cause: impl std::fmt::Display) -> AppError;
}

impl DescribeInternal for AppError {
    fn describe(self, cause: impl std::fmt::Display) -> AppError {
        tracing::error!(error = %cause, "internal serialization failure");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::keys;
    use uuid::Uuid;

    #[test]
    fn session_key_roundtrips_identifier() {
        assert_eq!(keys::session("abc123"), "session:abc123");
    }

    #[test]
    fn presence_key_includes_user_id() {
        let id = Uuid::nil();
        assert!(keys::presence(id).contains(&id.to_string()));
    }
}
