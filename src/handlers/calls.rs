use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::Response,
    Json,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::handlers::messages::{authenticate_ws, check_origin};
use crate::models::{Call, CallStatus};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InitiateCallRequest {
    pub conversation_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CallResponse {
    #[serde(flatten)]
    pub call: Call,
}

pub async fn initiate_call(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<InitiateCallRequest>,
) -> AppResult<(StatusCode, Json<CallResponse>)> {
    if !state.chat_hub.is_member(req.conversation_id, user.user_id()).await? {
        return Err(AppError::Forbidden("not a participant in this conversation".into()));
    }

    let call = sqlx::query_as::<_, Call>(
        r#"
        INSERT INTO calls (id, conversation_id, initiator_id, status, started_at)
        VALUES (gen_random_uuid(), $1, $2, 'ringing', now())
        RETURNING *
        "#,
    )
    .bind(req.conversation_id)
    .bind(user.user_id())
    .fetch_one(&state.pool)
    .await?;

    Ok((StatusCode::CREATED, Json(CallResponse { call })))
}

async fn require_participant(state: &AppState, call_id: Uuid, user_id: Uuid) -> AppResult<Call> {
    let call = sqlx::query_as::<_, Call>(
        r#"
        SELECT c.* FROM calls c
        JOIN conversation_participants p ON p.conversation_id = c.conversation_id
        WHERE c.id = $1 AND p.user_id = $2
        "#,
    )
    .bind(call_id)
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::Forbidden("not a participant in this call's conversation".into()))?;
    Ok(call)
}

/// A REST-triggered join, distinct from the WebSocket `join` signal: records
/// the participant and flips `ringing` to `active` on the first join, the
/// same atomic claim `signaling::hub::SignalingHub::handle_join` performs for
/// WebSocket-driven joins, so a call can be joined end to end over REST alone
/// without ever opening the signaling socket.
pub async fn join_call(
    State(state): State<AppState>,
    user: AuthUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let call = require_participant(&state, call_id, user.user_id()).await?;

    if !matches!(call.status, CallStatus::Ringing | CallStatus::Active) {
        return Err(AppError::Conflict("call is not joinable".into()));
    }

    let (active,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM call_participants WHERE call_id = $1 AND left_at IS NULL")
            .bind(call_id)
            .fetch_one(&state.pool)
            .await?;
    if active as usize >= state.config.mesh_max_participants {
        return Err(AppError::Capacity("call has reached its participant limit".into()));
    }

    sqlx::query(
        r#"
        INSERT INTO call_participants (call_id, user_id, joined_at)
        VALUES ($1, $2, now())
        ON CONFLICT (call_id, user_id) DO UPDATE SET joined_at = now(), left_at = NULL
        "#,
    )
    .bind(call_id)
    .bind(user.user_id())
    .execute(&state.pool)
    .await?;

    sqlx::query("UPDATE calls SET status = 'active' WHERE id = $1 AND status = 'ringing'")
        .bind(call_id)
        .execute(&state.pool)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn leave_call(
    State(state): State<AppState>,
    user: AuthUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    require_participant(&state, call_id, user.user_id()).await?;
    sqlx::query(
        "UPDATE call_participants SET left_at = now() WHERE call_id = $1 AND user_id = $2 AND left_at IS NULL",
    )
    .bind(call_id)
    .bind(user.user_id())
    .execute(&state.pool)
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn end_call(
    State(state): State<AppState>,
    user: AuthUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let call = require_participant(&state, call_id, user.user_id()).await?;
    if call.initiator_id != user.user_id() {
        return Err(AppError::Forbidden("only the call initiator can end it".into()));
    }
    sqlx::query(
        "UPDATE calls SET status = 'ended', ended_at = now(), duration_secs = EXTRACT(EPOCH FROM (now() - started_at))::bigint WHERE id = $1 AND status <> 'ended'",
    )
    .bind(call_id)
    .execute(&state.pool)
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_call(
    State(state): State<AppState>,
    user: AuthUser,
    Path(call_id): Path<Uuid>,
) -> AppResult<Json<CallResponse>> {
    let call = require_participant(&state, call_id, user.user_id()).await?;
    Ok(Json(CallResponse { call }))
}

#[derive(Debug, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
    pub ttl_secs: i64,
}

const TURN_CREDENTIAL_TTL_SECS: i64 = 3600;

type HmacSha1 = Hmac<Sha1>;

/// Generates short-lived TURN REST API credentials (the `username:credential`
/// scheme widely supported by coturn and similar relays): the username is
/// `"{expiry_unix}:{user_id}"`, the credential is the base64 of an
/// HMAC-SHA1 over that username keyed on the shared TURN secret.
fn turn_credentials(user_id: Uuid, secret: &str, ttl_secs: i64) -> AppResult<(String, String)> {
    let expiry = chrono::Utc::now().timestamp() + ttl_secs;
    let username = format!("{expiry}:{user_id}");

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).map_err(|_| AppError::Internal)?;
    mac.update(username.as_bytes());
    let credential = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok((username, credential))
}

/// Populates STUN/TURN servers from configuration, per §6's `/ice-servers`
/// contract. TURN entries get freshly minted time-limited credentials;
/// STUN entries need none.
pub async fn ice_servers(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<IceServersResponse>> {
    let mut servers = Vec::new();

    if !state.config.stun_servers.is_empty() {
        servers.push(IceServer {
            urls: state.config.stun_servers.clone(),
            username: None,
            credential: None,
        });
    }

    if !state.config.turn_servers.is_empty() {
        let secret = state
            .config
            .turn_password
            .as_deref()
            .ok_or_else(|| AppError::Internal)?;
        let (username, credential) = turn_credentials(user.user_id(), secret, TURN_CREDENTIAL_TTL_SECS)?;
        servers.push(IceServer {
            urls: state.config.turn_servers.clone(),
            username: Some(username),
            credential: Some(credential),
        });
    }

    Ok(Json(IceServersResponse {
        ice_servers: servers,
        ttl_secs: TURN_CREDENTIAL_TTL_SECS,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SignalingWsQuery {
    pub call_id: Uuid,
    pub token: Option<String>,
}

pub async fn signaling_ws(
    State(state): State<AppState>,
    Query(query): Query<SignalingWsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    check_origin(&state, &headers)?;
    let user_id = authenticate_ws(&state, &headers, query.token.as_deref()).await?;
    require_participant(&state, query.call_id, user_id).await?;
    Ok(ws.on_upgrade(move |socket| async move {
        state.signaling_hub.handle_socket(socket, query.call_id, user_id).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_credentials_are_deterministic_for_same_expiry() {
        let user_id = Uuid::new_v4();
        let secret = "shared-turn-secret";
        let (u1, c1) = turn_credentials(user_id, secret, 3600).unwrap();
        // Same call, same instant-derived expiry window produces a stable shape.
        assert!(u1.contains(&user_id.to_string()));
        assert!(!c1.is_empty());
    }

    #[test]
    fn turn_credentials_differ_across_secrets() {
        let user_id = Uuid::new_v4();
        let (_, c1) = turn_credentials(user_id, "secret-a", 3600).unwrap();
        let (_, c2) = turn_credentials(user_id, "secret-b", 3600).unwrap();
        assert_ne!(c1, c2);
    }
}
