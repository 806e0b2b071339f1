use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::db::with_query_timeout;
use crate::error::AppResult;

/// Append-only message store adapter. The retrieval pack carries no
/// wide-column (Scylla/Cassandra) driver, so this models the spec's
/// partition key `(conversation_id, time_bucket)` and clustering key
/// `(created_at DESC, message_id DESC)` as an ordinary Postgres table on
/// the same relational pool, rather than fabricating a driver dependency
/// the corpus never uses. See DESIGN.md for the substitution rationale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Media,
    System,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: Vec<u8>,
    pub encrypted: bool,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

/// Daily partition bucket, e.g. `2026-07-27`. Stored alongside each row so
/// a future migration to a genuine wide-column store can shard on it
/// without a backfill; reads in this Postgres-backed implementation scan
/// across buckets for a conversation rather than targeting one.
fn time_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageState {
    pub created_at: DateTime<Utc>,
    pub message_id: Uuid,
}

/// Appends a message with a 5 s query timeout, per §4.1's "fail-closed"
/// policy for message writes — callers propagate a store error rather than
/// silently dropping the write.
pub async fn append_message(
    pool: &PgPool,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: Vec<u8>,
    encrypted: bool,
    message_type: MessageType,
) -> AppResult<Message> {
    let message_id = Uuid::new_v4();
    let created_at = Utc::now();
    let bucket = time_bucket(created_at);

    with_query_timeout(Duration::from_secs(5), "append_message", async {
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages
                (message_id, conversation_id, time_bucket, sender_id, content, encrypted, message_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING message_id, conversation_id, sender_id, content, encrypted, message_type, created_at
            "#,
        )
        .bind(message_id)
        .bind(conversation_id)
        .bind(&bucket)
        .bind(sender_id)
        .bind(&content)
        .bind(encrypted)
        .bind(message_type)
        .bind(created_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    })
    .await
}

/// Pages messages newest-first via keyset pagination on
/// `(created_at DESC, message_id DESC)`, per §4.5's ordering invariant.
/// A 5 s query timeout applies; callers on the read path fail-closed with
/// 503 on timeout, per §4.1.
pub async fn get_messages(
    pool: &PgPool,
    conversation_id: Uuid,
    limit: i64,
    page_state: Option<PageState>,
) -> AppResult<(Vec<Message>, Option<PageState>)> {
    let limit = limit.clamp(1, 200);

    let rows = with_query_timeout(Duration::from_secs(5), "get_messages", async {
        let result = match page_state {
            Some(cursor) => {
                sqlx::query_as::<_, Message>(
                    r#"
                    SELECT message_id, conversation_id, sender_id, content, encrypted, message_type, created_at
                    FROM messages
                    WHERE conversation_id = $1
                      AND (created_at, message_id) < ($2, $3)
                    ORDER BY created_at DESC, message_id DESC
                    LIMIT $4
                    "#,
                )
                .bind(conversation_id)
                .bind(cursor.created_at)
                .bind(cursor.message_id)
                .bind(limit + 1)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Message>(
                    r#"
                    SELECT message_id, conversation_id, sender_id, content, encrypted, message_type, created_at
                    FROM messages
                    WHERE conversation_id = $1
                    ORDER BY created_at DESC, message_id DESC
                    LIMIT $2
                    "#,
                )
                .bind(conversation_id)
                .bind(limit + 1)
                .fetch_all(pool)
                .await
            }
        };
        result.map_err(Into::into)
    })
    .await?;

    let mut rows = rows;
    let next_page_state = if rows.len() as i64 > limit {
        rows.truncate(limit as usize);
        rows.last().map(|m| PageState {
            created_at: m.created_at,
            message_id: m.message_id,
        })
    } else {
        None
    };

    Ok((rows, next_page_state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_bucket_formats_as_calendar_day() {
        let at = DateTime::parse_from_rfc3339("2026-07-27T10:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(time_bucket(at), "2026-07-27");
    }
}
