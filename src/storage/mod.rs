use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{FileMetadata, QuotaClass};

const UPLOAD_URL_TTL: Duration = Duration::from_secs(15 * 60);
const DOWNLOAD_URL_TTL: Duration = Duration::from_secs(15 * 60);

fn quota_bytes(class: QuotaClass) -> i64 {
    match class {
        QuotaClass::Free => 1 * 1024 * 1024 * 1024,
        QuotaClass::Standard => 20 * 1024 * 1024 * 1024,
        QuotaClass::Unlimited => i64::MAX,
    }
}

/// User-owned object storage, wrapping `aws-sdk-s3` presigned URLs so file
/// bytes never transit this process — the server only issues and tracks
/// signed URLs and the relational metadata row. Grounded on the retrieval
/// pack's S3-compatible client usage; the teacher has no direct analogue,
/// so this follows the `other_examples` presigned-URL shape.
#[derive(Clone)]
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
    pool: PgPool,
}

pub struct QuotaStatus {
    pub used_bytes: i64,
    pub limit_bytes: i64,
}

impl ObjectStore {
    pub async fn new(config: &Config, pool: PgPool) -> AppResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = &config.s3_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        let mut s3_builder = aws_sdk_s3::config::Builder::from(&shared_config).force_path_style(true);
        if let (Some(access_key), Some(secret_key)) = (&config.s3_access_key, &config.s3_secret_key) {
            s3_builder = s3_builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key, secret_key, None, None, "secureconnect-static",
            ));
        }

        Ok(ObjectStore {
            client: S3Client::from_conf(s3_builder.build()),
            bucket: config.s3_bucket.clone(),
            pool,
        })
    }

    fn object_key(owner_id: Uuid, file_id: Uuid) -> String {
        format!("users/{owner_id}/files/{file_id}")
    }

    pub async fn quota_status(&self, owner_id: Uuid, quota_class: QuotaClass) -> AppResult<QuotaStatus> {
        let (used,): (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(size_bytes) FROM files WHERE owner_id = $1 AND upload_complete = true",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(QuotaStatus {
            used_bytes: used.unwrap_or(0),
            limit_bytes: quota_bytes(quota_class),
        })
    }

    /// Issues a presigned PUT URL and records a pending (`upload_complete =
    /// false`) metadata row so `upload_complete` has something to flip.
    pub async fn create_upload_url(
        &self,
        owner_id: Uuid,
        content_type: &str,
        size_bytes: i64,
        quota_class: QuotaClass,
    ) -> AppResult<(FileMetadata, String)> {
        let quota = self.quota_status(owner_id, quota_class).await?;
        if quota.used_bytes + size_bytes > quota.limit_bytes {
            return Err(AppError::Conflict("storage quota exceeded".into()));
        }

        let file_id = Uuid::new_v4();
        let object_key = Self::object_key(owner_id, file_id);

        let file: FileMetadata = sqlx::query_as(
            r#"
            INSERT INTO files (id, owner_id, object_key, size_bytes, content_type, quota_class, upload_complete, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, false, now())
            RETURNING id, owner_id, object_key, size_bytes, content_type, quota_class, upload_complete, created_at
            "#,
        )
        .bind(file_id)
        .bind(owner_id)
        .bind(&object_key)
        .bind(size_bytes)
        .bind(content_type)
        .bind(quota_class)
        .fetch_one(&self.pool)
        .await?;

        let presign_config = PresigningConfig::expires_in(UPLOAD_URL_TTL)
            .map_err(|e| AppError::Internal.describe(e))?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(content_type)
            .presigned(presign_config)
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("presign upload failed: {e}")))?;

        Ok((file, presigned.uri().to_string()))
    }

    pub async fn mark_upload_complete(&self, owner_id: Uuid, file_id: Uuid) -> AppResult<FileMetadata> {
        let file: FileMetadata = sqlx::query_as(
            r#"
            UPDATE files SET upload_complete = true
            WHERE id = $1 AND owner_id = $2
            RETURNING id, owner_id, object_key, size_bytes, content_type, quota_class, upload_complete, created_at
            "#,
        )
        .bind(file_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("file not found".into()))?;

        Ok(file)
    }

    pub async fn create_download_url(&self, owner_id: Uuid, file_id: Uuid) -> AppResult<String> {
        let file = self.get_file(owner_id, file_id).await?;

        let presign_config = PresigningConfig::expires_in(DOWNLOAD_URL_TTL)
            .map_err(|e| AppError::Internal.describe(e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&file.object_key)
            .presigned(presign_config)
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("presign download failed: {e}")))?;

        Ok(presigned.uri().to_string())
    }

    pub async fn delete_file(&self, owner_id: Uuid, file_id: Uuid) -> AppResult<()> {
        let file = self.get_file(owner_id, file_id).await?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&file.object_key)
            .send()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(format!("object delete failed: {e}")))?;

        sqlx::query("DELETE FROM files WHERE id = $1 AND owner_id = $2")
            .bind(file_id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_file(&self, owner_id: Uuid, file_id: Uuid) -> AppResult<FileMetadata> {
        sqlx::query_as(
            "SELECT id, owner_id, object_key, size_bytes, content_type, quota_class, upload_complete, created_at FROM files WHERE id = $1 AND owner_id = $2",
        )
        .bind(file_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("file not found".into()))
    }
}

trait DescribeInternal {
    fn describe(self, cause: impl std::fmt::Display) -> AppError;
}

impl DescribeInternal for AppError {
    fn describe(self, cause: impl std::fmt::Display) -> AppError {
        tracing::error!(error = %cause, "internal storage failure");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_is_scoped_under_owner() {
        let owner = Uuid::new_v4();
        let file = Uuid::new_v4();
        let key = ObjectStore::object_key(owner, file);
        assert!(key.starts_with(&format!("users/{owner}/files/")));
    }

    #[test]
    fn free_quota_is_one_gibibyte() {
        assert_eq!(quota_bytes(QuotaClass::Free), 1024 * 1024 * 1024);
    }
}
