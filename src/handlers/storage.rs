use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::AppResult;
use crate::models::{FileMetadata, QuotaClass};
use crate::state::AppState;
use crate::storage::QuotaStatus;

#[derive(Debug, Deserialize)]
pub struct CreateUploadUrlRequest {
    pub content_type: String,
    pub size_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateUploadUrlResponse {
    pub file: FileMetadata,
    pub upload_url: String,
}

/// All accounts are provisioned `Standard` quota for now; a tiered-billing
/// field on `users` is out of scope here (no such column exists yet).
fn quota_class_for(_user: &AuthUser) -> QuotaClass {
    QuotaClass::Standard
}

pub async fn create_upload_url(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateUploadUrlRequest>,
) -> AppResult<(StatusCode, Json<CreateUploadUrlResponse>)> {
    let (file, upload_url) = state
        .object_store
        .create_upload_url(user.user_id(), &req.content_type, req.size_bytes, quota_class_for(&user))
        .await?;

    Ok((StatusCode::CREATED, Json(CreateUploadUrlResponse { file, upload_url })))
}

pub async fn mark_upload_complete(
    State(state): State<AppState>,
    user: AuthUser,
    Path(file_id): Path<Uuid>,
) -> AppResult<Json<FileMetadata>> {
    let file = state.object_store.mark_upload_complete(user.user_id(), file_id).await?;
    Ok(Json(file))
}

#[derive(Debug, Serialize)]
pub struct DownloadUrlResponse {
    pub download_url: String,
}

pub async fn get_download_url(
    State(state): State<AppState>,
    user: AuthUser,
    Path(file_id): Path<Uuid>,
) -> AppResult<Json<DownloadUrlResponse>> {
    let download_url = state.object_store.create_download_url(user.user_id(), file_id).await?;
    Ok(Json(DownloadUrlResponse { download_url }))
}

pub async fn delete_file(
    State(state): State<AppState>,
    user: AuthUser,
    Path(file_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.object_store.delete_file(user.user_id(), file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    pub used_bytes: i64,
    pub limit_bytes: i64,
}

impl From<QuotaStatus> for QuotaResponse {
    fn from(status: QuotaStatus) -> Self {
        QuotaResponse {
            used_bytes: status.used_bytes,
            limit_bytes: status.limit_bytes,
        }
    }
}

pub async fn get_quota(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<QuotaResponse>> {
    let status = state.object_store.quota_status(user.user_id(), quota_class_for(&user)).await?;
    Ok(Json(status.into()))
}
