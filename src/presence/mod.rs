use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{keys, CacheClient};
use crate::error::AppResult;

/// TTL chosen so a crashed process's presence entry self-heals within one
/// missed heartbeat interval rather than sticking at "online" forever.
const PRESENCE_TTL: Duration = Duration::from_secs(90);

/// Directory TTL is deliberately short (§3 "fast lookup caches... carry
/// only derived state and may be rebuilt from the source of record") —
/// stale entries fall back to the relational store rather than serving a
/// wrong answer indefinitely.
const DIRECTORY_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Dnd,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Dnd => "dnd",
            PresenceStatus::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(PresenceStatus::Online),
            "away" => Some(PresenceStatus::Away),
            "dnd" => Some(PresenceStatus::Dnd),
            "offline" => Some(PresenceStatus::Offline),
            _ => None,
        }
    }
}

pub async fn set_presence(cache: &CacheClient, user_id: Uuid, status: PresenceStatus) -> AppResult<()> {
    cache.set(&keys::presence(user_id), &status, Some(PRESENCE_TTL)).await
}

pub async fn get_presence(cache: &CacheClient, user_id: Uuid) -> AppResult<PresenceStatus> {
    Ok(cache
        .get::<PresenceStatus>(&keys::presence(user_id))
        .await?
        .unwrap_or(PresenceStatus::Offline))
}

/// Email/username → user ID directory, a derived cache rebuilt from the
/// relational store on a miss. Populated on register, consulted (fail-open
/// to the relational store) on login.
pub mod directory {
    use super::*;

    pub async fn put_email(cache: &CacheClient, email: &str, user_id: Uuid) -> AppResult<()> {
        cache
            .set(&keys::directory_email(email), &user_id, Some(DIRECTORY_TTL))
            .await
    }

    pub async fn put_username(cache: &CacheClient, username: &str, user_id: Uuid) -> AppResult<()> {
        cache
            .set(&keys::directory_username(username), &user_id, Some(DIRECTORY_TTL))
            .await
    }

    pub async fn lookup_by_email(cache: &CacheClient, email: &str) -> AppResult<Option<Uuid>> {
        cache.get(&keys::directory_email(email)).await
    }

    pub async fn lookup_by_username(cache: &CacheClient, username: &str) -> AppResult<Option<Uuid>> {
        cache.get(&keys::directory_username(username)).await
    }
}
