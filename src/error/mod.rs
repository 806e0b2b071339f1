use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Stable machine-readable error codes, included in every error body so
/// clients can branch on behavior without parsing `error` strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    AuthInvalidCredentials,
    AuthExpired,
    TokenRevoked,
    AuthAudienceMismatch,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    StoreUnavailable,
    UpstreamUnavailable,
    Timeout,
    Capacity,
    Internal,
}

impl ErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::AuthInvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::AuthExpired => "TOKEN_EXPIRED",
            ErrorCode::TokenRevoked => "TOKEN_REVOKED",
            ErrorCode::AuthAudienceMismatch => "AUDIENCE_MISMATCH",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Capacity => "CAPACITY_EXCEEDED",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }
}

/// The taxonomy from the error-handling design: kinds, not type names.
///
/// `IntoResponse` maps every variant to the shared `{error, code, details}`
/// body shape. Internal causes (database errors, serialization failures) are
/// logged with full detail here and never echoed to the client.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Audience mismatch")]
    AudienceMismatch,

    #[error("Account temporarily locked")]
    AccountLocked,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    #[error("Internal server error")]
    Internal,
}

/// Map sqlx errors to AppError, with special handling for unique-constraint
/// violations (PG error code 23505) so they surface as 409 Conflict rather
/// than 500 Internal Server Error.
impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.code().as_deref() == Some("23505") {
                let message = match db_err.constraint() {
                    Some(c) if c.contains("email") => "Email already registered",
                    Some(c) if c.contains("username") => "Username already taken",
                    _ => "Resource already exists",
                };
                return AppError::Conflict(message.into());
            }
        }
        AppError::Database(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Database(e) => {
                tracing::error!(error = ?e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Internal,
                    "Internal server error".to_string(),
                )
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, ErrorCode::Validation, msg.clone()),
            AppError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                ErrorCode::AuthInvalidCredentials,
                "Invalid credentials".to_string(),
            ),
            AppError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                ErrorCode::AuthExpired,
                "Token expired".to_string(),
            ),
            AppError::TokenRevoked => (
                StatusCode::UNAUTHORIZED,
                ErrorCode::TokenRevoked,
                "Token has been revoked".to_string(),
            ),
            AppError::AudienceMismatch => (
                StatusCode::UNAUTHORIZED,
                ErrorCode::AuthAudienceMismatch,
                "Token audience mismatch".to_string(),
            ),
            AppError::AccountLocked => (
                // Intentionally the same status/code/message as
                // InvalidCredentials: locked accounts must not be
                // distinguishable from wrong passwords.
                StatusCode::UNAUTHORIZED,
                ErrorCode::AuthInvalidCredentials,
                "Invalid credentials".to_string(),
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, ErrorCode::Forbidden, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorCode::NotFound, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ErrorCode::Conflict, msg.clone()),
            AppError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorCode::RateLimited,
                "Rate limit exceeded".to_string(),
            ),
            AppError::StoreUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::StoreUnavailable,
                msg.clone(),
            ),
            AppError::UpstreamUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::UpstreamUnavailable,
                msg.clone(),
            ),
            AppError::Timeout(msg) => (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::Timeout, msg.clone()),
            AppError::Capacity(msg) => (StatusCode::CONFLICT, ErrorCode::Capacity, msg.clone()),
            AppError::Internal => {
                tracing::error!("internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::Internal,
                    "Internal server error".to_string(),
                )
            }
        };

        let mut response = (
            status,
            Json(json!({
                "error": message,
                "code": code.as_str(),
                "details": {},
            })),
        )
            .into_response();

        match &self {
            AppError::RateLimited { retry_after_secs } => {
                if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert("Retry-After", v);
                }
            }
            AppError::StoreUnavailable(_) | AppError::UpstreamUnavailable(_) | AppError::Timeout(_) => {
                response
                    .headers_mut()
                    .insert("Retry-After", HeaderValue::from_static("5"));
            }
            _ => {}
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn invalid_credentials_returns_401_with_stable_code() {
        let response = AppError::InvalidCredentials.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["code"], "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn token_revoked_returns_401_with_revoked_code() {
        let response = AppError::TokenRevoked.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["code"], "TOKEN_REVOKED");
    }

    #[tokio::test]
    async fn account_locked_reads_like_invalid_credentials() {
        let locked = AppError::AccountLocked.into_response();
        let invalid = AppError::InvalidCredentials.into_response();
        assert_eq!(locked.status(), invalid.status());

        let locked_json = body_json(locked.into_body()).await;
        let invalid_json = body_json(invalid.into_body()).await;
        assert_eq!(locked_json["code"], invalid_json["code"]);
        assert_eq!(locked_json["code"], "INVALID_CREDENTIALS");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after_header() {
        let response = AppError::RateLimited { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "42");
    }

    #[tokio::test]
    async fn store_unavailable_returns_503_with_retry_after() {
        let response = AppError::StoreUnavailable("wide-column store down".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key("Retry-After"));
    }

    #[tokio::test]
    async fn validation_error_returns_400() {
        let response = AppError::Validation("bad input".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn conflict_error_returns_409() {
        let response = AppError::Conflict("already exists".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn capacity_error_returns_409() {
        let response = AppError::Capacity("mesh full".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn not_found_body_has_error_key() {
        let response = AppError::NotFound("message not found".into()).into_response();
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "message not found");
        assert_eq!(json["code"], "NOT_FOUND");
    }
}
