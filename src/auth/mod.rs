pub mod service;
pub mod session_store;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// The audience claim every token issued by this service carries, and the
/// only audience `validate_token` accepts. Catches tokens minted for a
/// different deployment or service sharing the same signing secret.
pub const TOKEN_AUDIENCE: &str = "secureconnect-api";

const ACCESS_TOKEN_MINUTES: i64 = 15;
const REFRESH_TOKEN_MINUTES: i64 = 60 * 24 * 30; // 30 days, per §4.2

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub aud: String,
    /// Unique per-token identifier, used as the cache key for revocation
    /// (logout, password change, explicit session kill) without needing to
    /// blacklist the full token string.
    pub jti: String,
    pub username: String,
    pub role: String,
    pub token_type: TokenType,
}

impl Claims {
    fn new(
        user_id: Uuid,
        username: String,
        role: String,
        expiration_minutes: i64,
        token_type: TokenType,
    ) -> Self {
        let now = Utc::now();
        let exp = now + Duration::minutes(expiration_minutes);

        Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            aud: TOKEN_AUDIENCE.to_string(),
            jti: Uuid::new_v4().to_string(),
            username,
            role,
            token_type,
        }
    }

    pub fn user_id(&self) -> AppResult<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::InvalidCredentials)
    }

    pub fn expires_at(&self) -> AppResult<chrono::DateTime<Utc>> {
        chrono::DateTime::from_timestamp(self.exp, 0).ok_or(AppError::InvalidCredentials)
    }
}

pub fn create_access_token(user_id: Uuid, username: String, role: String, secret: &str) -> AppResult<(String, Claims)> {
    let claims = Claims::new(user_id, username, role, ACCESS_TOKEN_MINUTES, TokenType::Access);
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).map_err(|e| {
        tracing::error!(error = ?e, "failed to create access token");
        AppError::Internal
    })?;
    Ok((token, claims))
}

pub fn create_refresh_token(user_id: Uuid, username: String, role: String, secret: &str) -> AppResult<(String, Claims)> {
    let claims = Claims::new(user_id, username, role, REFRESH_TOKEN_MINUTES, TokenType::Refresh);
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).map_err(|e| {
        tracing::error!(error = ?e, "failed to create refresh token");
        AppError::Internal
    })?;
    Ok((token, claims))
}

/// Decodes and validates signature, expiry and audience. Does not consult
/// the revocation list — callers on the request path additionally check
/// `session_store::is_revoked` so a blacklisted-but-unexpired token is
/// still rejected.
pub fn validate_token(token: &str, secret: &str) -> AppResult<Claims> {
    let mut validation = Validation::default();
    validation.set_audience(&[TOKEN_AUDIENCE]);

    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AppError::TokenExpired,
                ErrorKind::InvalidAudience => AppError::AudienceMismatch,
                _ => AppError::InvalidCredentials,
            }
        })
}

/// Deterministic SHA-256 digest used to key refresh-token session records
/// by hash rather than storing raw tokens. bcrypt is unsuitable here: it is
/// intentionally non-deterministic, so the same token would hash
/// differently each time and could never be looked up again.
pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn hash_password(password: &str) -> AppResult<String> {
    bcrypt::hash(password, 10).map_err(|e| {
        tracing::error!(error = ?e, "failed to hash password");
        AppError::Internal
    })
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    bcrypt::verify(password, hash).map_err(|e| {
        tracing::error!(error = ?e, "failed to verify password");
        AppError::Internal
    })
}

/// Authenticated user extracted from a valid, non-revoked access-token
/// bearer header. Fields are private: the only constructor is the
/// `FromRequestParts` impl, so handlers cannot forge one via struct literal.
pub struct AuthUser {
    user_id: Uuid,
    username: String,
    role: String,
    jti: String,
    exp: i64,
}

impl AuthUser {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn jti(&self) -> &str {
        &self.jti
    }

    /// Reconstructs the bearer token's claims, for handlers (logout) that
    /// need to hand the full `Claims` back to `AuthService` without
    /// re-parsing the `Authorization` header themselves.
    pub fn claims(&self) -> Claims {
        Claims {
            sub: self.user_id.to_string(),
            exp: self.exp,
            iat: self.exp,
            aud: TOKEN_AUDIENCE.to_string(),
            jti: self.jti.clone(),
            username: self.username.clone(),
            role: self.role.clone(),
            token_type: TokenType::Access,
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| AppError::InvalidCredentials)?;

        let claims = validate_token(bearer.token(), &state.jwt_secret)?;

        if claims.token_type != TokenType::Access {
            return Err(AppError::InvalidCredentials);
        }

        if session_store::is_revoked(&state.cache, &claims.jti).await? {
            return Err(AppError::TokenRevoked);
        }

        let user_id = claims.user_id()?;

        Ok(AuthUser {
            user_id,
            username: claims.username,
            role: claims.role,
            jti: claims.jti,
            exp: claims.exp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-secret-min-32-characters-long!!";

    #[test]
    fn hash_refresh_token_is_64_char_hex_and_deterministic() {
        let token = "some-random-token";
        let h1 = hash_refresh_token(token);
        let h2 = hash_refresh_token(token);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_refresh_token_differs_on_different_inputs() {
        assert_ne!(hash_refresh_token("token-alpha"), hash_refresh_token("token-beta"));
    }

    #[test]
    fn access_token_roundtrip_happy_path() {
        let user_id = Uuid::new_v4();
        let (token, minted) = create_access_token(user_id, "alice".into(), "user".into(), TEST_SECRET).unwrap();
        let claims = validate_token(&token, TEST_SECRET).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.aud, TOKEN_AUDIENCE);
        assert_eq!(claims.jti, minted.jti);
    }

    #[test]
    fn refresh_token_roundtrip_happy_path() {
        let user_id = Uuid::new_v4();
        let (token, _) = create_refresh_token(user_id, "bob".into(), "user".into(), TEST_SECRET).unwrap();
        let claims = validate_token(&token, TEST_SECRET).unwrap();
        assert_eq!(claims.token_type, TokenType::Refresh);
    }

    #[test]
    fn access_and_refresh_tokens_have_distinct_jti() {
        let user_id = Uuid::new_v4();
        let (_, access) = create_access_token(user_id, "carol".into(), "user".into(), TEST_SECRET).unwrap();
        let (_, refresh) = create_refresh_token(user_id, "carol".into(), "user".into(), TEST_SECRET).unwrap();
        assert_ne!(access.jti, refresh.jti);
    }

    #[test]
    fn validate_token_rejects_wrong_secret() {
        let (token, _) = create_access_token(Uuid::new_v4(), "dave".into(), "user".into(), TEST_SECRET).unwrap();
        let result = validate_token(&token, "completely-different-secret-value!!");
        assert!(result.is_err());
    }

    #[test]
    fn validate_token_rejects_malformed_string() {
        assert!(validate_token("this.is.not.a.valid.jwt", TEST_SECRET).is_err());
    }

    #[test]
    fn validate_token_rejects_empty_string() {
        assert!(validate_token("", TEST_SECRET).is_err());
    }

    #[test]
    fn password_hash_verify_roundtrip() {
        let password = "super-secure-password-123!";
        let hash = hash_password(password).unwrap();
        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrong-password", &hash).unwrap());
    }

    #[test]
    fn claims_user_id_parses_valid_uuid() {
        let expected_id = Uuid::new_v4();
        let (token, _) = create_access_token(expected_id, "eve".into(), "user".into(), TEST_SECRET).unwrap();
        let claims = validate_token(&token, TEST_SECRET).unwrap();
        assert_eq!(claims.user_id().unwrap(), expected_id);
    }

    #[test]
    fn claims_user_id_rejects_invalid_sub() {
        let claims = Claims {
            sub: "not-a-uuid".into(),
            exp: 9_999_999_999,
            iat: 0,
            aud: TOKEN_AUDIENCE.into(),
            jti: Uuid::new_v4().to_string(),
            username: "frank".into(),
            role: "user".into(),
            token_type: TokenType::Access,
        };
        assert!(claims.user_id().is_err());
    }
}
