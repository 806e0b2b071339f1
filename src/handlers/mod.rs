pub mod auth;
pub mod calls;
pub mod keys;
pub mod messages;
pub mod storage;
pub mod users;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// Per-dependency health, per §6. Each check is independent so a single
/// degraded collaborator doesn't mask the others' status in the response.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "health check: database query failed");
            false
        }
    };

    let cache_ok = match state.cache.ping().await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "health check: cache ping failed");
            false
        }
    };

    let healthy = db_ok && cache_ok;
    let http_status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        http_status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "secureconnect-api",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "ok" } else { "unavailable" },
            "cache": if cache_ok { "ok" } else { "unavailable" },
            "ws_connections_active": state.chat_hub.connection_count() + state.signaling_hub.connection_count(),
        })),
    )
}

/// Prometheus text-format exposition, per §6's `/metrics` contract.
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}
