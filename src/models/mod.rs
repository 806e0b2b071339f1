use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub username: String,
    pub role: String,
    pub status: String,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct UserDto {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub role: String,
    pub status: String,
    pub avatar_url: Option<String>,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserDto {
    fn from(user: User) -> Self {
        UserDto {
            id: user.id,
            email: user.email,
            username: user.username,
            role: user.role,
            status: user.status,
            avatar_url: user.avatar_url,
            email_verified: user.email_verified,
            created_at: user.created_at,
        }
    }
}

// ============================================================================
// Call
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Declined,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Call {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub initiator_id: Uuid,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

// ============================================================================
// E2EE key material — the server treats every byte blob here as opaque.
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IdentityKey {
    pub user_id: Uuid,
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SignedPreKey {
    pub user_id: Uuid,
    pub key_id: i32,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OneTimePreKey {
    pub user_id: Uuid,
    pub key_id: i32,
    pub public_key: Vec<u8>,
    pub used: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadKeysDto {
    pub identity_key: Vec<u8>,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    pub one_time_pre_keys: Vec<Vec<u8>>,
}

#[derive(Debug, Serialize)]
pub struct PreKeyBundleDto {
    pub identity_key: Vec<u8>,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_signature: Vec<u8>,
    /// A single consumed one-time pre-key, or `None` if the pool is exhausted
    /// (clients fall back to the signed pre-key alone).
    pub one_time_pre_key: Option<Vec<u8>>,
}

// ============================================================================
// File metadata — object bytes live in the object store, linked by object key.
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QuotaClass {
    Free,
    Standard,
    Unlimited,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FileMetadata {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub object_key: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub quota_class: QuotaClass,
    pub upload_complete: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Friendship / block — friend-and-block endpoints listed in the HTTP surface.
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FriendshipStatus {
    Pending,
    Accepted,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Friendship {
    pub requester_id: Uuid,
    pub addressee_id: Uuid,
    pub status: FriendshipStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Block {
    pub blocker_id: Uuid,
    pub blocked_id: Uuid,
    pub created_at: DateTime<Utc>,
}
