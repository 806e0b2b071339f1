use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{
    self, create_access_token, create_refresh_token, hash_password, hash_refresh_token, session_store,
    verify_password, Claims, TokenType,
};
use crate::email::Mailer;
use crate::error::{AppError, AppResult};
use crate::models::{User, UserDto};
use crate::presence::{self, PresenceStatus};

/// A single-use, hashed token used for both password reset and email
/// verification, per §4.4 ("same token pattern"). Stored hashed so a leaked
/// database row cannot be replayed directly.
struct ActionToken {
    user_id: Uuid,
}

const PASSWORD_RESET_TTL: Duration = Duration::from_secs(60 * 60);
const EMAIL_VERIFICATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A fixed bcrypt hash of a password nobody will ever type, compared against
/// on login for non-existent accounts so the bcrypt cost is paid either way
/// and response timing does not disclose whether the email is registered.
const DUMMY_PASSWORD_HASH: &str = "$2b$10$CwTycUXWue0Thq9StjUM0uJ8gm3P2n7ivLA2U7.tV0Z8p8b6WiJAG";

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct AuthResult {
    pub tokens: TokenPair,
    pub user: UserDto,
}

/// Orchestrates the register/login/refresh/logout/reset/verify state
/// machine from §4.4, stitching together the relational store (source of
/// truth), the session/directory caches, and the SMTP collaborator.
#[derive(Clone)]
pub struct AuthService {
    pool: PgPool,
    cache: crate::cache::CacheClient,
    jwt_secret: Arc<str>,
    mailer: Arc<dyn Mailer>,
}

fn username_re() -> &'static Regex {
    static RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]{3,32}$").unwrap());
    &RE
}

fn password_meets_policy(password: &str) -> bool {
    if password.len() < 8 {
        return false;
    }
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| !c.is_ascii_alphanumeric());
    [has_lower, has_upper, has_digit, has_symbol].iter().filter(|b| **b).count() >= 3
}

impl AuthService {
    pub fn new(
        pool: PgPool,
        cache: crate::cache::CacheClient,
        jwt_secret: Arc<str>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        AuthService {
            pool,
            cache,
            jwt_secret,
            mailer,
        }
    }

    /// Register: validates inputs, checks uniqueness, hashes the password
    /// at bcrypt cost 10, writes the user, seeds the directory cache, and
    /// issues a fresh token pair.
    pub async fn register(&self, email: String, username: String, password: String) -> AppResult<AuthResult> {
        let email = email.trim().to_lowercase();

        if !username_re().is_match(&username) {
            return Err(AppError::Validation(
                "username must be 3-32 alphanumeric or underscore characters".into(),
            ));
        }
        if !password_meets_policy(&password) {
            return Err(AppError::Validation(
                "password must be at least 8 characters and include at least three of: lowercase, uppercase, digit, symbol".into(),
            ));
        }

        if presence::directory::lookup_by_email(&self.cache, &email).await.ok().flatten().is_some() {
            return Err(AppError::Conflict("Email already registered".into()));
        }
        if presence::directory::lookup_by_username(&self.cache, &username)
            .await
            .ok()
            .flatten()
            .is_some()
        {
            return Err(AppError::Conflict("Username already taken".into()));
        }

        let existing = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1 OR username = $2")
            .bind(&email)
            .bind(&username)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(existing) = existing {
            if existing.email == email {
                return Err(AppError::Conflict("Email already registered".into()));
            }
            return Err(AppError::Conflict("Username already taken".into()));
        }

        let password_hash = hash_password(&password)?;

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, username, password_hash, role, status, email_verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'user', 'offline', false, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .bind(&username)
        .bind(&password_hash)
        .fetch_one(&self.pool)
        .await?;

        let _ = presence::directory::put_email(&self.cache, &user.email, user.id).await;
        let _ = presence::directory::put_username(&self.cache, &user.username, user.id).await;

        let tokens = self.issue_session(&user).await?;
        Ok(AuthResult {
            tokens,
            user: user.into(),
        })
    }

    /// Login, per §4.4's six ordered steps. Every directory/lockout lookup
    /// failure is fail-open (falls back to the relational store, or — for
    /// lockout — proceeds as if unlocked, since the password check remains
    /// authoritative).
    pub async fn login(&self, email: String, password: String) -> AppResult<AuthResult> {
        let email = email.trim().to_lowercase();

        let locked = session_store::is_account_locked(&self.cache, &email).await.unwrap_or(false);
        if locked {
            return Err(AppError::AccountLocked);
        }

        let user_id = presence::directory::lookup_by_email(&self.cache, &email)
            .await
            .ok()
            .flatten();

        let user = match user_id {
            Some(id) => sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
            None => sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
                .bind(&email)
                .fetch_optional(&self.pool)
                .await?,
        };

        // Always run the bcrypt compare, even for a non-existent user, so
        // response timing does not disclose whether the email is registered.
        let password_ok = match &user {
            Some(u) => verify_password(&password, &u.password_hash)?,
            None => verify_password(&password, DUMMY_PASSWORD_HASH).unwrap_or(false),
        };

        let user = match (user, password_ok) {
            (Some(u), true) => u,
            _ => {
                let _ = session_store::record_failed_login(&self.cache, &email).await;
                return Err(AppError::InvalidCredentials);
            }
        };

        let _ = session_store::clear_failed_logins(&self.cache, &email).await;

        sqlx::query("UPDATE users SET status = 'online', updated_at = NOW() WHERE id = $1")
            .bind(user.id)
            .execute(&self.pool)
            .await?;
        let _ = presence::set_presence(&self.cache, user.id, PresenceStatus::Online).await;

        let tokens = self.issue_session(&user).await?;
        Ok(AuthResult {
            tokens,
            user: user.into(),
        })
    }

    /// Mints an access/refresh pair and records the refresh session, keyed
    /// by the refresh token's `jti`.
    async fn issue_session(&self, user: &User) -> AppResult<TokenPair> {
        let (access_token, access_claims) =
            create_access_token(user.id, user.username.clone(), user.role.clone(), &self.jwt_secret)?;
        let (refresh_token, refresh_claims) =
            create_refresh_token(user.id, user.username.clone(), user.role.clone(), &self.jwt_secret)?;

        let record = session_store::SessionRecord {
            user_id: user.id,
            username: user.username.clone(),
            refresh_hash: hash_refresh_token(&refresh_token),
            access_jti: access_claims.jti,
            created_at: Utc::now(),
        };
        let ttl = Duration::from_secs((refresh_claims.exp - refresh_claims.iat).max(0) as u64);
        session_store::create_session(&self.cache, &refresh_claims.jti, &record, ttl).await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Refresh: verifies the refresh token, loads its session, and checks
    /// the stored hash still matches (single-use rotation). A hash mismatch
    /// means the token was already rotated out and is being replayed —
    /// treated as a stolen-token signal, revoking every session for the
    /// user.
    pub async fn refresh(&self, refresh_token: &str) -> AppResult<TokenPair> {
        let claims: Claims = auth::validate_token(refresh_token, &self.jwt_secret)?;
        if claims.token_type != TokenType::Refresh {
            return Err(AppError::InvalidCredentials);
        }
        let user_id = claims.user_id()?;

        let session = session_store::get_session(&self.cache, &claims.jti)
            .await?
            .ok_or(AppError::InvalidCredentials)?;

        if session.refresh_hash != hash_refresh_token(refresh_token) {
            session_store::delete_user_sessions(&self.cache, user_id).await?;
            return Err(AppError::InvalidCredentials);
        }

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::InvalidCredentials)?;

        // Remaining lifetime of the access token this session last issued —
        // blacklisting it for exactly that long is enough to invalidate it
        // without leaving a lingering entry after it would have expired
        // anyway.
        let remaining = (claims.exp - Utc::now().timestamp()).max(0) as u64;
        session_store::blacklist_token(&self.cache, &session.access_jti, Duration::from_secs(remaining.max(1)))
            .await?;
        session_store::delete_session(&self.cache, &claims.jti).await?;

        self.issue_session(&user).await
    }

    /// Logout: blacklists the access token's `jti` for its remaining
    /// lifetime and deletes its associated session, if any.
    pub async fn logout(&self, access_claims: &Claims, refresh_session_id: Option<&str>) -> AppResult<()> {
        let remaining = (access_claims.exp - Utc::now().timestamp()).max(1) as u64;
        session_store::blacklist_token(&self.cache, &access_claims.jti, Duration::from_secs(remaining)).await?;
        if let Some(session_id) = refresh_session_id {
            session_store::delete_session(&self.cache, session_id).await?;
        }
        Ok(())
    }

    /// Password reset request: always returns success regardless of whether
    /// the email exists, to avoid account enumeration. The email dispatch
    /// itself is best-effort — failure is logged, not propagated.
    pub async fn request_password_reset(&self, email: &str) -> AppResult<()> {
        let email = email.trim().to_lowercase();
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(&email)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(user) = user {
            let token = Uuid::new_v4().to_string();
            self.store_action_token(&token, user.id, "password_reset", PASSWORD_RESET_TTL)
                .await?;
            if let Err(e) = self.mailer.send_password_reset(&user.email, &token).await {
                tracing::warn!(error = %e, user_id = %user.id, "failed to dispatch password reset email");
            }
        }
        Ok(())
    }

    pub async fn confirm_password_reset(&self, token: &str, new_password: &str) -> AppResult<()> {
        if !password_meets_policy(new_password) {
            return Err(AppError::Validation("password does not meet complexity requirements".into()));
        }
        let action = self.consume_action_token(token, "password_reset").await?;

        let password_hash = hash_password(new_password)?;
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2")
            .bind(&password_hash)
            .bind(action.user_id)
            .execute(&self.pool)
            .await?;

        session_store::delete_user_sessions(&self.cache, action.user_id).await?;
        Ok(())
    }

    pub async fn request_email_verification(&self, user: &User) -> AppResult<()> {
        let token = Uuid::new_v4().to_string();
        self.store_action_token(&token, user.id, "email_verification", EMAIL_VERIFICATION_TTL)
            .await?;
        if let Err(e) = self.mailer.send_verification(&user.email, &token).await {
            tracing::warn!(error = %e, user_id = %user.id, "failed to dispatch verification email");
        }
        Ok(())
    }

    pub async fn confirm_email_verification(&self, token: &str) -> AppResult<()> {
        let action = self.consume_action_token(token, "email_verification").await?;
        sqlx::query("UPDATE users SET email_verified = true, updated_at = NOW() WHERE id = $1")
            .bind(action.user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn store_action_token(&self, token: &str, user_id: Uuid, purpose: &str, ttl: Duration) -> AppResult<()> {
        let key = format!("action_token:{purpose}:{}", hash_refresh_token(token));
        self.cache.set(&key, &user_id, Some(ttl)).await
    }

    async fn consume_action_token(&self, token: &str, purpose: &'static str) -> AppResult<ActionToken> {
        let key = format!("action_token:{purpose}:{}", hash_refresh_token(token));
        let user_id: Uuid = self
            .cache
            .get(&key)
            .await?
            .ok_or_else(|| AppError::Validation("token invalid or expired".into()))?;
        self.cache.delete(&key).await?;
        let _ = purpose;
        Ok(ActionToken { user_id })
    }
}
