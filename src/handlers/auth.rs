use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::auth::{self, service::TokenPair, AuthUser};
use crate::error::{AppError, AppResult};
use crate::models::UserDto;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 3, max = 32))]
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetConfirm {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserDto,
}

impl From<(TokenPair, UserDto)> for AuthResponse {
    fn from((tokens, user): (TokenPair, UserDto)) -> Self {
        AuthResponse {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            user,
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    req.validate().map_err(|e| AppError::Validation(e.to_string()))?;

    let result = state.auth_service.register(req.email, req.username, req.password).await?;
    Ok((StatusCode::CREATED, Json((result.tokens, result.user).into())))
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> AppResult<Json<AuthResponse>> {
    req.validate().map_err(|e| AppError::Validation(e.to_string()))?;

    let result = state.auth_service.login(req.email, req.password).await?;
    Ok(Json((result.tokens, result.user).into()))
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
}

pub async fn refresh(State(state): State<AppState>, Json(req): Json<RefreshRequest>) -> AppResult<Json<TokenResponse>> {
    let tokens = state.auth_service.refresh(&req.refresh_token).await?;
    Ok(Json(TokenResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
    }))
}

pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<LogoutRequest>,
) -> AppResult<StatusCode> {
    let session_id = match &req.refresh_token {
        Some(token) => {
            let claims = auth::validate_token(token, &state.jwt_secret)?;
            Some(claims.jti)
        }
        None => None,
    };

    state
        .auth_service
        .logout(&user.claims(), session_id.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn profile(user: AuthUser) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "user_id": user.user_id(),
        "username": user.username(),
        "role": user.role(),
    }))
}

/// Always 200, regardless of whether `req.email` belongs to an account —
/// distinguishing the two would let a caller enumerate registered emails.
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(req): Json<PasswordResetRequest>,
) -> AppResult<Json<serde_json::Value>> {
    state.auth_service.request_password_reset(&req.email).await?;
    Ok(Json(serde_json::json!({
        "message": "If an account with that email exists, a password reset link has been sent.",
    })))
}

pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(req): Json<PasswordResetConfirm>,
) -> AppResult<StatusCode> {
    state
        .auth_service
        .confirm_password_reset(&req.token, &req.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn verify_email(
    State(state): State<AppState>,
    Json(req): Json<VerifyEmailRequest>,
) -> AppResult<StatusCode> {
    state.auth_service.confirm_email_verification(&req.token).await?;
    Ok(StatusCode::NO_CONTENT)
}
