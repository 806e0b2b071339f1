use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::models::{PreKeyBundleDto, UploadKeysDto};
use crate::state::AppState;

/// Uploads (or replaces) a user's identity key, signed pre-key and one-time
/// pre-key pool. All key material is opaque to the server (§4's E2EE
/// invariant) — it is stored and returned as raw bytes, never inspected.
pub async fn upload_keys(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<UploadKeysDto>,
) -> AppResult<StatusCode> {
    let mut tx = state.pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO identity_keys (user_id, public_key, created_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (user_id) DO UPDATE SET public_key = EXCLUDED.public_key, created_at = NOW()
        "#,
    )
    .bind(user.user_id())
    .bind(&req.identity_key)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO signed_pre_keys (user_id, key_id, public_key, signature, created_at)
        VALUES ($1, 1, $2, $3, NOW())
        ON CONFLICT (user_id, key_id) DO UPDATE SET public_key = EXCLUDED.public_key, signature = EXCLUDED.signature, created_at = NOW()
        "#,
    )
    .bind(user.user_id())
    .bind(&req.signed_pre_key)
    .bind(&req.signed_pre_key_signature)
    .execute(&mut *tx)
    .await?;

    for (idx, key) in req.one_time_pre_keys.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO one_time_pre_keys (user_id, key_id, public_key, used)
            VALUES ($1, $2, $3, false)
            ON CONFLICT (user_id, key_id) DO UPDATE SET public_key = EXCLUDED.public_key, used = false
            "#,
        )
        .bind(user.user_id())
        .bind(idx as i32)
        .bind(key)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fetches a pre-key bundle for starting a new session with `target_id`:
/// identity key, signed pre-key, and one consumed one-time pre-key (if the
/// pool isn't exhausted).
pub async fn get_key_bundle(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(target_id): Path<Uuid>,
) -> AppResult<Json<PreKeyBundleDto>> {
    let (identity_key,): (Vec<u8>,) = sqlx::query_as("SELECT public_key FROM identity_keys WHERE user_id = $1")
        .bind(target_id)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("user has not published keys".into()))?;

    let (signed_pre_key, signed_pre_key_signature): (Vec<u8>, Vec<u8>) = sqlx::query_as(
        "SELECT public_key, signature FROM signed_pre_keys WHERE user_id = $1 ORDER BY key_id DESC LIMIT 1",
    )
    .bind(target_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| AppError::NotFound("user has not published a signed pre-key".into()))?;

    // A single atomic claim: the subquery's `FOR UPDATE SKIP LOCKED` picks
    // one unused row and locks it before the outer UPDATE flips it, so two
    // concurrent callers can never walk away with the same key_id.
    let one_time_pre_key: Option<(Vec<u8>,)> = sqlx::query_as(
        r#"
        UPDATE one_time_pre_keys
        SET used = true
        WHERE key_id = (
            SELECT key_id FROM one_time_pre_keys
            WHERE user_id = $1 AND used = false
            ORDER BY key_id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        AND user_id = $1
        RETURNING public_key
        "#,
    )
    .bind(target_id)
    .fetch_optional(&state.pool)
    .await?;

    let one_time_pre_key = one_time_pre_key.map(|(public_key,)| public_key);

    Ok(Json(PreKeyBundleDto {
        identity_key,
        signed_pre_key,
        signed_pre_key_signature,
        one_time_pre_key,
    }))
}

/// Rotates the signed pre-key and tops up the one-time pre-key pool,
/// without touching the (stable) identity key.
pub async fn rotate_keys(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<UploadKeysDto>,
) -> AppResult<StatusCode> {
    sqlx::query(
        r#"
        INSERT INTO signed_pre_keys (user_id, key_id, public_key, signature, created_at)
        VALUES ($1, 1, $2, $3, NOW())
        ON CONFLICT (user_id, key_id) DO UPDATE SET public_key = EXCLUDED.public_key, signature = EXCLUDED.signature, created_at = NOW()
        "#,
    )
    .bind(user.user_id())
    .bind(&req.signed_pre_key)
    .bind(&req.signed_pre_key_signature)
    .execute(&state.pool)
    .await?;

    for key in &req.one_time_pre_keys {
        let (next_id,): (Option<i32>,) =
            sqlx::query_as("SELECT MAX(key_id) FROM one_time_pre_keys WHERE user_id = $1")
                .bind(user.user_id())
                .fetch_one(&state.pool)
                .await?;
        sqlx::query("INSERT INTO one_time_pre_keys (user_id, key_id, public_key, used) VALUES ($1, $2, $3, false)")
            .bind(user.user_id())
            .bind(next_id.unwrap_or(-1) + 1)
            .bind(key)
            .execute(&state.pool)
            .await?;
    }

    Ok(StatusCode::NO_CONTENT)
}
