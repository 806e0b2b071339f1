use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::Response,
    Json,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{self, session_store, AuthUser};
use crate::chat::hub::ChatEnvelope;
use crate::chat::message_store::{self, MessageType, PageState};
use crate::error::{AppError, AppResult};
use crate::presence::{self, PresenceStatus};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    /// Base64-encoded; may already be E2EE-ciphertext from the client.
    pub content: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default = "default_message_type")]
    pub message_type: MessageType,
}

fn default_message_type() -> MessageType {
    MessageType::Text
}

pub async fn send_message(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<ChatEnvelope>)> {
    let content = base64::engine::general_purpose::STANDARD
        .decode(&req.content)
        .map_err(|_| AppError::Validation("content must be base64-encoded".into()))?;

    let envelope = state
        .chat_hub
        .send_message(user.user_id(), req.conversation_id, content, req.encrypted, req.message_type)
        .await?;

    Ok((StatusCode::CREATED, Json(envelope)))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub conversation_id: Uuid,
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub cursor: Option<String>,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct MessagePageResponse {
    pub messages: Vec<MessageDto>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageDto {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub encrypted: bool,
    pub message_type: MessageType,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

fn encode_cursor(state: &PageState) -> String {
    let raw = serde_json::to_vec(state).unwrap_or_default();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

fn decode_cursor(cursor: &str) -> AppResult<PageState> {
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| AppError::Validation("invalid cursor".into()))?;
    serde_json::from_slice(&raw).map_err(|_| AppError::Validation("invalid cursor".into()))
}

/// Pages messages newest-first, per §4.5's keyset-pagination ordering.
pub async fn list_messages(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListMessagesQuery>,
) -> AppResult<Json<MessagePageResponse>> {
    if !state.chat_hub.is_member(query.conversation_id, user.user_id()).await? {
        return Err(AppError::Forbidden("not a participant in this conversation".into()));
    }

    let page_state = query.cursor.as_deref().map(decode_cursor).transpose()?;
    let (messages, next) =
        message_store::get_messages(&state.pool, query.conversation_id, query.limit, page_state).await?;

    let messages = messages
        .into_iter()
        .map(|m| MessageDto {
            message_id: m.message_id,
            conversation_id: m.conversation_id,
            sender_id: m.sender_id,
            content: base64::engine::general_purpose::STANDARD.encode(&m.content),
            encrypted: m.encrypted,
            message_type: m.message_type,
            created_at: m.created_at,
        })
        .collect();

    Ok(Json(MessagePageResponse {
        messages,
        next_cursor: next.as_ref().map(encode_cursor),
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePresenceRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub user_id: Uuid,
    pub status: String,
}

/// Heartbeat endpoint backing the presence TTL in `presence::set_presence` —
/// clients call this on an interval shorter than the TTL to stay "online".
pub async fn update_presence(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<UpdatePresenceRequest>,
) -> AppResult<Json<PresenceResponse>> {
    let status = PresenceStatus::parse(&req.status)
        .ok_or_else(|| AppError::Validation("invalid presence status".into()))?;

    presence::set_presence(&state.cache, user.user_id(), status).await?;

    Ok(Json(PresenceResponse {
        user_id: user.user_id(),
        status: status.as_str().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChatWsQuery {
    pub conversation_id: Uuid,
    /// Fallback auth for browser WebSocket clients that cannot set an
    /// `Authorization` header on the upgrade request.
    pub token: Option<String>,
}

/// Upgrades to the chat WebSocket, per §6. Accepts the bearer token either
/// via the standard header or, for clients that cannot set one on a
/// WebSocket handshake, a `token` query parameter.
pub async fn chat_ws(
    State(state): State<AppState>,
    Query(query): Query<ChatWsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    check_origin(&state, &headers)?;
    let user_id = authenticate_ws(&state, &headers, query.token.as_deref()).await?;
    Ok(ws.on_upgrade(move |socket| async move {
        state.chat_hub.handle_socket(socket, query.conversation_id, user_id).await;
    }))
}

/// The CORS layer only governs fetch/XHR; a WebSocket upgrade ignores it
/// entirely, so an allowed-origins check has to be applied explicitly here
/// (and in `calls::signaling_ws`) before `ws.on_upgrade`.
pub(crate) fn check_origin(state: &AppState, headers: &axum::http::HeaderMap) -> AppResult<()> {
    if state.config.allowed_origins.iter().any(|o| o == "*") {
        return Ok(());
    }

    let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        // Non-browser clients (mobile apps, server-to-server) have no Origin
        // header to check; the CORS-bypass risk this guards against is
        // specific to browsers honoring an attacker page's cross-origin fetch.
        return Ok(());
    };

    if state.config.allowed_origins.iter().any(|o| o == origin) {
        Ok(())
    } else {
        Err(AppError::Forbidden("origin not allowed".into()))
    }
}

pub(crate) async fn authenticate_ws(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    query_token: Option<&str>,
) -> AppResult<Uuid> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query_token)
        .ok_or(AppError::InvalidCredentials)?;

    let claims = auth::validate_token(token, &state.jwt_secret)?;

    if session_store::is_revoked(&state.cache, &claims.jti).await? {
        return Err(AppError::TokenRevoked);
    }

    claims.user_id()
}
