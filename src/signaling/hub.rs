use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{channels, FanoutBus};
use crate::error::{AppError, AppResult};
use crate::models::CallStatus;

/// Default mesh cap per §4.6; callers may override from config.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    Join,
    Leave,
    MuteAudio,
    MuteVideo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub from: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

struct ClientHandle {
    call_id: Uuid,
    user_id: Uuid,
    outbound: mpsc::Sender<WsMessage>,
}

/// Per-process WebSocket hub for call signaling, per §4.6 — identical shape
/// to [`crate::chat::hub::ChatHub`], keyed by `call_id` instead of
/// `conversation_id`, with join/leave driving call/participant state in the
/// relational store and a configurable mesh cap.
#[derive(Clone)]
pub struct SignalingHub {
    pool: PgPool,
    bus: FanoutBus,
    clients: Arc<RwLock<HashMap<Uuid, ClientHandle>>>,
    call_members: Arc<RwLock<HashMap<Uuid, HashSet<Uuid>>>>,
    subscriptions: Arc<RwLock<HashMap<Uuid, JoinHandle<()>>>>,
    connection_count: Arc<AtomicUsize>,
    max_connections: usize,
    client_buffer: usize,
    max_participants: usize,
}

impl SignalingHub {
    pub fn new(
        pool: PgPool,
        bus: FanoutBus,
        max_connections: usize,
        client_buffer: usize,
        max_participants: usize,
    ) -> Self {
        SignalingHub {
            pool,
            bus,
            clients: Arc::new(RwLock::new(HashMap::new())),
            call_members: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connection_count: Arc::new(AtomicUsize::new(0)),
            max_connections,
            client_buffer,
            max_participants,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    async fn active_participant_count(&self, call_id: Uuid) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM call_participants WHERE call_id = $1 AND left_at IS NULL",
        )
        .bind(call_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn call_status(&self, call_id: Uuid) -> AppResult<CallStatus> {
        let (status,): (CallStatus,) = sqlx::query_as("SELECT status FROM calls WHERE id = $1")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("call not found".into()))?;
        Ok(status)
    }

    /// `join`: verifies the call is joinable, enforces the mesh cap, and
    /// atomically records the participant. Flips `ringing` to `active` on
    /// the first join.
    async fn handle_join(&self, call_id: Uuid, user_id: Uuid) -> AppResult<()> {
        let status = self.call_status(call_id).await?;
        if !matches!(status, CallStatus::Ringing | CallStatus::Active) {
            return Err(AppError::Conflict("call is not joinable".into()));
        }

        let active = self.active_participant_count(call_id).await?;
        if active as usize >= self.max_participants {
            return Err(AppError::Capacity("call has reached its participant limit".into()));
        }

        sqlx::query(
            r#"
            INSERT INTO call_participants (call_id, user_id, joined_at)
            VALUES ($1, $2, now())
            ON CONFLICT (call_id, user_id) DO UPDATE SET joined_at = now(), left_at = NULL
            "#,
        )
        .bind(call_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE calls SET status = 'active' WHERE id = $1 AND status = 'ringing'")
            .bind(call_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// `leave` (explicit or on socket close): marks the participant as left;
    /// if no active participants remain, ends the call and publishes a
    /// final `leave` so any lingering subscribers observe the teardown.
    async fn handle_leave(&self, call_id: Uuid, user_id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE call_participants SET left_at = now() WHERE call_id = $1 AND user_id = $2 AND left_at IS NULL",
        )
        .bind(call_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let remaining = self.active_participant_count(call_id).await?;
        if remaining == 0 {
            sqlx::query(
                "UPDATE calls SET status = 'ended', ended_at = now(), duration_secs = EXTRACT(EPOCH FROM (now() - started_at))::bigint WHERE id = $1 AND status <> 'ended'",
            )
            .bind(call_id)
            .execute(&self.pool)
            .await?;

            let envelope = SignalEnvelope {
                signal_type: SignalType::Leave,
                from: user_id,
                to: None,
                payload: serde_json::json!({ "reason": "call_ended" }),
            };
            if let Ok(payload) = serde_json::to_string(&envelope) {
                let _ = self.bus.publish(&channels::call(call_id), &payload).await;
            }
        }

        Ok(())
    }

    /// Relays a signaling frame from one peer to the others in the call via
    /// the bus. `join`/`leave` additionally drive relational call state;
    /// all frame types, including those two, are also relayed so peers see
    /// the event in realtime.
    pub async fn relay(&self, call_id: Uuid, envelope: SignalEnvelope) -> AppResult<()> {
        match envelope.signal_type {
            SignalType::Join => self.handle_join(call_id, envelope.from).await?,
            SignalType::Leave => self.handle_leave(call_id, envelope.from).await?,
            _ => {}
        }

        if let Ok(payload) = serde_json::to_string(&envelope) {
            if let Err(e) = self.bus.publish(&channels::call(call_id), &payload).await {
                tracing::warn!(call_id = %call_id, error = %e, "signaling envelope publish failed");
            }
        }

        Ok(())
    }

    async fn register(&self, call_id: Uuid, user_id: Uuid) -> AppResult<(Uuid, mpsc::Receiver<WsMessage>)> {
        if self.connection_count.load(Ordering::Relaxed) >= self.max_connections {
            return Err(AppError::Capacity("connection limit reached".into()));
        }

        let (tx, rx) = mpsc::channel(self.client_buffer);
        let conn_id = Uuid::new_v4();

        self.clients.write().await.insert(
            conn_id,
            ClientHandle {
                call_id,
                user_id,
                outbound: tx,
            },
        );
        self.connection_count.fetch_add(1, Ordering::Relaxed);

        let mut members = self.call_members.write().await;
        let set = members.entry(call_id).or_default();
        let first_client = set.is_empty();
        set.insert(conn_id);
        drop(members);

        if first_client {
            self.start_subscription(call_id).await;
        }

        Ok((conn_id, rx))
    }

    async fn start_subscription(&self, call_id: Uuid) {
        let mut bus_rx = match self.bus.subscribe(&channels::call(call_id)).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "failed to subscribe to call channel");
                return;
            }
        };

        let clients = self.clients.clone();
        let call_members = self.call_members.clone();
        let handle = tokio::spawn(async move {
            while let Some(payload) = bus_rx.recv().await {
                let members = call_members.read().await;
                let Some(conn_ids) = members.get(&call_id) else {
                    continue;
                };
                let conn_ids: Vec<Uuid> = conn_ids.iter().copied().collect();
                drop(members);

                let clients = clients.read().await;
                for conn_id in conn_ids {
                    if let Some(client) = clients.get(&conn_id) {
                        let _ = client.outbound.try_send(WsMessage::Text(payload.clone()));
                    }
                }
            }
        });

        self.subscriptions.write().await.insert(call_id, handle);
    }

    async fn unregister(&self, conn_id: Uuid) {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(&conn_id)
        };
        self.connection_count.fetch_sub(1, Ordering::Relaxed);

        let Some(removed) = removed else {
            return;
        };

        if let Err(e) = self.handle_leave(removed.call_id, removed.user_id).await {
            tracing::warn!(call_id = %removed.call_id, user_id = %removed.user_id, error = %e, "leave-on-disconnect failed");
        }

        let mut members = self.call_members.write().await;
        let mut now_empty = false;
        if let Some(set) = members.get_mut(&removed.call_id) {
            set.remove(&conn_id);
            now_empty = set.is_empty();
            if now_empty {
                members.remove(&removed.call_id);
            }
        }
        drop(members);

        if now_empty {
            if let Some(handle) = self.subscriptions.write().await.remove(&removed.call_id) {
                handle.abort();
            }
        }
    }

    pub async fn handle_socket(&self, socket: WebSocket, call_id: Uuid, user_id: Uuid) {
        let (conn_id, mut outbound_rx) = match self.register(call_id, user_id).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(call_id = %call_id, user_id = %user_id, error = %e, "signaling connection rejected");
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

        let hub = self.clone();
        let read_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = futures::StreamExt::next(&mut receiver).await {
                match msg {
                    WsMessage::Close(_) => break,
                    WsMessage::Text(text) => match serde_json::from_str::<SignalEnvelope>(&text) {
                        Ok(envelope) => {
                            if let Err(e) = hub.relay(call_id, envelope).await {
                                tracing::warn!(call_id = %call_id, error = %e, "signaling relay failed");
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "malformed signaling frame"),
                    },
                    _ => {}
                }
            }
        });

        tokio::select! {
            _ = write_task => {}
            _ = read_task => {}
        }

        self.unregister(conn_id).await;
    }
}
