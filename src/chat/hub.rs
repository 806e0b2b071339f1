use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{channels, FanoutBus};
use crate::chat::message_store::{self, MessageType};
use crate::error::{AppError, AppResult};
use crate::push::{PushNotification, PushProvider};

/// Every frame this hub ever emits is a `message` frame; kept as an enum
/// (rather than a literal) to match the `SignalEnvelope` wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEventType {
    Message,
}

/// Serialized over the bus and, on the wire, over the per-client WebSocket
/// channel. `content` carries the opaque (possibly E2EE-encrypted) message
/// body base64-encoded for JSON transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEnvelope {
    #[serde(rename = "type")]
    pub event_type: ChatEventType,
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub conversation_id: Uuid,
    pub content: String,
    pub encrypted: bool,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

struct ClientHandle {
    conversation_id: Uuid,
    user_id: Uuid,
    outbound: mpsc::Sender<WsMessage>,
}

/// Per-process WebSocket hub for chat, per §4.5. Holds the local client
/// registry and the per-conversation bus subscription lifecycle; grounded
/// on the teacher's `ConnectionManager`/`websocket::handler` shape,
/// generalized from "one connection per user" to "N clients subscribed
/// per conversation" and extended with the bus fan-out the spec requires.
/// Push dispatch runs under this deadline per recipient so a slow or hung
/// provider never holds up the fan-out for the rest of the conversation.
const PUSH_SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ChatHub {
    pool: PgPool,
    bus: FanoutBus,
    push_provider: Arc<dyn PushProvider>,
    clients: Arc<RwLock<HashMap<Uuid, ClientHandle>>>,
    conversation_members: Arc<RwLock<HashMap<Uuid, HashSet<Uuid>>>>,
    subscriptions: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
    connection_count: Arc<AtomicUsize>,
    max_connections: usize,
    client_buffer: usize,
}

impl ChatHub {
    pub fn new(
        pool: PgPool,
        bus: FanoutBus,
        push_provider: Arc<dyn PushProvider>,
        max_connections: usize,
        client_buffer: usize,
    ) -> Self {
        ChatHub {
            pool,
            bus,
            push_provider,
            clients: Arc::new(RwLock::new(HashMap::new())),
            conversation_members: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connection_count: Arc::new(AtomicUsize::new(0)),
            max_connections,
            client_buffer,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    pub async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Appends the message with a 5 s timeout and publishes it to the bus.
    /// A publish failure is logged and swallowed: the message is already
    /// durably stored, so the send itself does not fail (§4.5 send path).
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        conversation_id: Uuid,
        content: Vec<u8>,
        encrypted: bool,
        message_type: MessageType,
    ) -> AppResult<ChatEnvelope> {
        if !self.is_member(conversation_id, sender_id).await? {
            return Err(AppError::Forbidden("not a participant in this conversation".into()));
        }

        let message = message_store::append_message(
            &self.pool,
            conversation_id,
            sender_id,
            content,
            encrypted,
            message_type,
        )
        .await?;

        let envelope = ChatEnvelope {
            event_type: ChatEventType::Message,
            message_id: message.message_id,
            sender_id: message.sender_id,
            conversation_id: message.conversation_id,
            content: base64::engine::general_purpose::STANDARD.encode(&message.content),
            encrypted: message.encrypted,
            message_type: message.message_type,
            created_at: message.created_at,
        };

        if let Ok(payload) = serde_json::to_string(&envelope) {
            if let Err(e) = self.bus.publish(&channels::chat(conversation_id), &payload).await {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "chat envelope publish failed");
            }
        }

        self.dispatch_push(conversation_id, sender_id).await;

        Ok(envelope)
    }

    async fn participant_ids(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM conversation_participants WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn locally_connected_users(&self, conversation_id: Uuid) -> HashSet<Uuid> {
        let members = self.conversation_members.read().await;
        let conn_ids: Vec<Uuid> = members.get(&conversation_id).into_iter().flatten().copied().collect();
        drop(members);

        let clients = self.clients.read().await;
        conn_ids
            .into_iter()
            .filter_map(|conn_id| clients.get(&conn_id).map(|c| c.user_id))
            .collect()
    }

    /// Fans out a best-effort push notification to every conversation member
    /// who is not currently holding a local WebSocket for this conversation,
    /// per §4.5. Each send is spawned independently under `PUSH_SEND_TIMEOUT`
    /// so one slow recipient never delays the others or the caller.
    async fn dispatch_push(&self, conversation_id: Uuid, sender_id: Uuid) {
        let participants = match self.participant_ids(conversation_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to load conversation participants for push fan-out");
                return;
            }
        };
        let connected = self.locally_connected_users(conversation_id).await;

        for recipient_id in participants.into_iter().filter(|id| *id != sender_id && !connected.contains(id)) {
            let provider = self.push_provider.clone();
            let notification = PushNotification {
                recipient_id,
                title: "New message".to_string(),
                preview: "You have a new message".to_string(),
            };
            tokio::spawn(async move {
                let provider_name = provider.provider_name();
                let outcome = match tokio::time::timeout(PUSH_SEND_TIMEOUT, provider.send(&notification)).await {
                    Ok(Ok(())) => "success",
                    Ok(Err(e)) => {
                        tracing::warn!(recipient_id = %recipient_id, error = %e, "push send failed");
                        "error"
                    }
                    Err(_) => {
                        tracing::warn!(recipient_id = %recipient_id, "push send timed out");
                        "timeout"
                    }
                };
                crate::observability::increment_push_send(provider_name, outcome);
            });
        }
    }

    /// Registers a newly upgraded connection. Enforces the process-wide
    /// connection ceiling and verifies conversation membership before
    /// admitting the client; starts the conversation's bus subscription if
    /// this is the first local client for it.
    async fn register(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<(Uuid, mpsc::Receiver<WsMessage>)> {
        if self.connection_count.load(Ordering::Relaxed) >= self.max_connections {
            return Err(AppError::Capacity("connection limit reached".into()));
        }
        if !self.is_member(conversation_id, user_id).await? {
            return Err(AppError::Forbidden("not a participant in this conversation".into()));
        }

        let (tx, rx) = mpsc::channel(self.client_buffer);
        let conn_id = Uuid::new_v4();

        self.clients.write().await.insert(
            conn_id,
            ClientHandle {
                conversation_id,
                user_id,
                outbound: tx,
            },
        );
        self.connection_count.fetch_add(1, Ordering::Relaxed);

        let mut members = self.conversation_members.write().await;
        let set = members.entry(conversation_id).or_default();
        let first_client = set.is_empty();
        set.insert(conn_id);
        drop(members);

        if first_client {
            self.start_subscription(conversation_id).await;
        }

        Ok((conn_id, rx))
    }

    async fn start_subscription(&self, conversation_id: Uuid) {
        let mut bus_rx = match self.bus.subscribe(&channels::chat(conversation_id)).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to subscribe to chat channel");
                return;
            }
        };

        let clients = self.clients.clone();
        let conversation_members = self.conversation_members.clone();
        let handle = tokio::spawn(async move {
            while let Some(payload) = bus_rx.recv().await {
                let members = conversation_members.read().await;
                let Some(conn_ids) = members.get(&conversation_id) else {
                    continue;
                };
                let conn_ids: Vec<Uuid> = conn_ids.iter().copied().collect();
                drop(members);

                let clients = clients.read().await;
                for conn_id in conn_ids {
                    if let Some(client) = clients.get(&conn_id) {
                        // Non-blocking: a full outbound channel disconnects
                        // the client rather than stalling other recipients.
                        let _ = client.outbound.try_send(WsMessage::Text(payload.clone()));
                    }
                }
            }
        });

        self.subscriptions.write().await.insert(conversation_id, handle);
    }

    async fn unregister(&self, conn_id: Uuid) {
        let conversation_id = {
            let mut clients = self.clients.write().await;
            clients.remove(&conn_id).map(|c| c.conversation_id)
        };
        self.connection_count.fetch_sub(1, Ordering::Relaxed);

        let Some(conversation_id) = conversation_id else {
            return;
        };

        let mut members = self.conversation_members.write().await;
        let mut now_empty = false;
        if let Some(set) = members.get_mut(&conversation_id) {
            set.remove(&conn_id);
            now_empty = set.is_empty();
            if now_empty {
                members.remove(&conversation_id);
            }
        }
        drop(members);

        if now_empty {
            if let Some(handle) = self.subscriptions.write().await.remove(&conversation_id) {
                handle.abort();
            }
        }
    }

    /// Drives a single accepted WebSocket connection end to end: registers
    /// the client, pumps outbound frames with a write deadline, reads
    /// inbound frames (chat has no client-initiated writes besides
    /// ping/pong, so these are logged at debug level), and unregisters on
    /// disconnect either direction triggers.
    pub async fn handle_socket(&self, socket: WebSocket, conversation_id: Uuid, user_id: Uuid) {
        let (conn_id, mut outbound_rx) = match self.register(conversation_id, user_id).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, user_id = %user_id, error = %e, "chat connection rejected");
                return;
            }
        };

        let (mut sender, mut receiver) = futures::StreamExt::split(socket);

        let write_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if tokio::time::timeout(Duration::from_secs(10), futures::SinkExt::send(&mut sender, msg))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let read_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = futures::StreamExt::next(&mut receiver).await {
                if matches!(msg, WsMessage::Close(_)) {
                    break;
                }
                tracing::debug!(?msg, "chat client frame received");
            }
        });

        tokio::select! {
            _ = write_task => {}
            _ = read_task => {}
        }

        self.unregister(conn_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_envelope_serializes_content_as_base64() {
        let envelope = ChatEnvelope {
            event_type: ChatEventType::Message,
            message_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            content: base64::engine::general_purpose::STANDARD.encode(b"hello"),
            encrypted: false,
            message_type: MessageType::Text,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["content"], base64::engine::general_purpose::STANDARD.encode(b"hello"));
    }

    #[test]
    fn chat_envelope_carries_a_message_type_discriminator() {
        let envelope = ChatEnvelope {
            event_type: ChatEventType::Message,
            message_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            content: base64::engine::general_purpose::STANDARD.encode(b"hello"),
            encrypted: false,
            message_type: MessageType::Text,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "message");
    }
}
