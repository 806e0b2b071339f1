use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{hash_password, verify_password, AuthUser};
use crate::error::{AppError, AppResult};
use crate::models::{Block, Friendship, FriendshipStatus, User, UserDto};
use crate::presence;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeEmailRequest {
    pub new_email: String,
    pub password: String,
}

pub async fn get_me(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<UserDto>> {
    let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user.user_id())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".into()))?;
    Ok(Json(row.into()))
}

pub async fn update_me(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> AppResult<Json<UserDto>> {
    let row = sqlx::query_as::<_, User>(
        r#"
        UPDATE users
        SET username = COALESCE($1, username),
            avatar_url = COALESCE($2, avatar_url),
            updated_at = NOW()
        WHERE id = $3
        RETURNING *
        "#,
    )
    .bind(&req.username)
    .bind(&req.avatar_url)
    .bind(user.user_id())
    .fetch_one(&state.pool)
    .await?;
    Ok(Json(row.into()))
}

pub async fn change_password(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> AppResult<StatusCode> {
    let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user.user_id())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".into()))?;

    if !verify_password(&req.current_password, &row.password_hash)? {
        return Err(AppError::InvalidCredentials);
    }

    let new_hash = hash_password(&req.new_password)?;
    sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2")
        .bind(&new_hash)
        .bind(user.user_id())
        .execute(&state.pool)
        .await?;

    crate::auth::session_store::delete_user_sessions(&state.cache, user.user_id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn change_email(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<ChangeEmailRequest>,
) -> AppResult<StatusCode> {
    let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user.user_id())
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".into()))?;

    if !verify_password(&req.password, &row.password_hash)? {
        return Err(AppError::InvalidCredentials);
    }

    let new_email = req.new_email.trim().to_lowercase();
    let updated = sqlx::query_as::<_, User>(
        "UPDATE users SET email = $1, email_verified = false, updated_at = NOW() WHERE id = $2 RETURNING *",
    )
    .bind(&new_email)
    .bind(user.user_id())
    .fetch_one(&state.pool)
    .await?;

    let _ = presence::directory::put_email(&state.cache, &updated.email, updated.id).await;
    state.auth_service.request_email_verification(&updated).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_me(State(state): State<AppState>, user: AuthUser) -> AppResult<StatusCode> {
    sqlx::query("UPDATE users SET deleted_at = NOW(), status = 'offline' WHERE id = $1")
        .bind(user.user_id())
        .execute(&state.pool)
        .await?;
    crate::auth::session_store::delete_user_sessions(&state.cache, user.user_id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_blocked(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<Vec<Block>>> {
    let rows = sqlx::query_as::<_, Block>("SELECT * FROM blocks WHERE blocker_id = $1")
        .bind(user.user_id())
        .fetch_all(&state.pool)
        .await?;
    Ok(Json(rows))
}

pub async fn block_user(
    State(state): State<AppState>,
    user: AuthUser,
    Path(target_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    if target_id == user.user_id() {
        return Err(AppError::Validation("cannot block yourself".into()));
    }
    sqlx::query("INSERT INTO blocks (blocker_id, blocked_id, created_at) VALUES ($1, $2, NOW()) ON CONFLICT DO NOTHING")
        .bind(user.user_id())
        .bind(target_id)
        .execute(&state.pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unblock_user(
    State(state): State<AppState>,
    user: AuthUser,
    Path(target_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    sqlx::query("DELETE FROM blocks WHERE blocker_id = $1 AND blocked_id = $2")
        .bind(user.user_id())
        .bind(target_id)
        .execute(&state.pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct FriendshipResponse {
    pub friendship: Friendship,
}

pub async fn send_friend_request(
    State(state): State<AppState>,
    user: AuthUser,
    Path(target_id): Path<Uuid>,
) -> AppResult<Json<FriendshipResponse>> {
    if target_id == user.user_id() {
        return Err(AppError::Validation("cannot friend yourself".into()));
    }
    let friendship = sqlx::query_as::<_, Friendship>(
        r#"
        INSERT INTO friendships (requester_id, addressee_id, status, created_at)
        VALUES ($1, $2, 'pending', NOW())
        ON CONFLICT (requester_id, addressee_id) DO UPDATE SET status = friendships.status
        RETURNING *
        "#,
    )
    .bind(user.user_id())
    .bind(target_id)
    .fetch_one(&state.pool)
    .await?;
    Ok(Json(FriendshipResponse { friendship }))
}

pub async fn accept_friend_request(
    State(state): State<AppState>,
    user: AuthUser,
    Path(requester_id): Path<Uuid>,
) -> AppResult<Json<FriendshipResponse>> {
    let friendship = sqlx::query_as::<_, Friendship>(
        "UPDATE friendships SET status = 'accepted' WHERE requester_id = $1 AND addressee_id = $2 RETURNING *",
    )
    .bind(requester_id)
    .bind(user.user_id())
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("friend request not found".into()))?;
    Ok(Json(FriendshipResponse { friendship }))
}

pub async fn list_friends(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<Vec<Friendship>>> {
    let rows = sqlx::query_as::<_, Friendship>(
        "SELECT * FROM friendships WHERE (requester_id = $1 OR addressee_id = $1) AND status = $2",
    )
    .bind(user.user_id())
    .bind(FriendshipStatus::Accepted)
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}
