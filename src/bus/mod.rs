use futures::StreamExt;
use tokio::sync::mpsc;

use crate::cache::CacheClient;
use crate::error::{AppError, AppResult};

/// Publish/subscribe fan-out over the shared in-memory store, grounded on
/// the retrieval pack's Redis client for the publish half and wired
/// directly to `redis::Client`'s dedicated pubsub connection for
/// subscriptions (`ConnectionManager` does not expose pubsub).
///
/// Per §4.1's degrade path for "Pub/sub broadcast", a publish failure here
/// is logged and swallowed by the caller (the chat/signaling hub still
/// delivers to its own local clients) rather than failing the send.
#[derive(Clone)]
pub struct FanoutBus {
    cache: CacheClient,
    redis_client: redis::Client,
}

impl FanoutBus {
    pub fn new(cache: CacheClient, redis_url: &str) -> AppResult<Self> {
        let redis_client =
            redis::Client::open(redis_url).map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(FanoutBus { cache, redis_client })
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        self.cache.publish(channel, payload).await
    }

    /// Subscribes to `channel`, returning a receiver that yields each
    /// message payload as it arrives. The subscription task runs until the
    /// receiver is dropped, at which point the underlying connection is
    /// closed — this is the "cancel the bus subscription" half of the hub's
    /// last-client-unregisters lifecycle in §4.5/§4.6.
    pub async fn subscribe(&self, channel: &str) -> AppResult<mpsc::Receiver<String>> {
        let mut pubsub = self
            .redis_client
            .get_async_pubsub()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("pubsub connect failed: {e}")))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("pubsub subscribe failed: {e}")))?;

        let (tx, rx) = mpsc::channel(256);
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(channel = %channel_name, error = %e, "failed to decode pubsub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

pub mod channels {
    use uuid::Uuid;

    pub fn chat(conversation_id: Uuid) -> String {
        format!("chat:{conversation_id}")
    }

    pub fn call(call_id: Uuid) -> String {
        format!("call:{call_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::channels;
    use uuid::Uuid;

    #[test]
    fn chat_and_call_channels_use_expected_prefixes() {
        let id = Uuid::nil();
        assert_eq!(channels::chat(id), format!("chat:{id}"));
        assert_eq!(channels::call(id), format!("call:{id}"));
    }
}
