use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppResult;

/// Outbound push notification for a non-connected recipient. The server
/// never touches message plaintext on this path — `preview` is pre-redacted
/// by the caller (chat hub), since the payload may be E2EE-encrypted.
#[derive(Debug, Clone)]
pub struct PushNotification {
    pub recipient_id: Uuid,
    pub title: String,
    pub preview: String,
}

/// Best-effort push fan-out, per §4.1's fail-open policy for "push fan-out".
/// Providers run under the caller's 10 s derived deadline (§5); a provider
/// error is logged and never propagated to the send path.
#[async_trait]
pub trait PushProvider: Send + Sync {
    async fn send(&self, notification: &PushNotification) -> Result<(), String>;

    /// Label for the `push_send_total{provider}` metric; never user-facing.
    fn provider_name(&self) -> &'static str;
}

/// FCM/APNs-style provider stub. The retrieval pack carries no push SDK, so
/// this dispatches over `reqwest` (already a teacher dependency) to a
/// provider HTTP endpoint, matching the request/response shape FCM's HTTP v1
/// API and APNs' HTTP/2 API both reduce to: POST a JSON payload, treat a
/// non-2xx response as a delivery failure.
pub struct HttpPushProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpPushProvider {
    pub fn new(endpoint: String, api_key: String) -> Self {
        HttpPushProvider {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl PushProvider for HttpPushProvider {
    async fn send(&self, notification: &PushNotification) -> Result<(), String> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "recipient_id": notification.recipient_id,
                "title": notification.title,
                "body": notification.preview,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("push provider returned {}", response.status()));
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "http"
    }
}

/// Logs instead of dispatching. Config validation forbids this provider in
/// production (`PUSH_PROVIDER=mock is only permitted when ENV=development`),
/// enforced in `config::Config::from_env`.
pub struct MockPushProvider;

#[async_trait]
impl PushProvider for MockPushProvider {
    async fn send(&self, notification: &PushNotification) -> Result<(), String> {
        tracing::info!(recipient_id = %notification.recipient_id, title = %notification.title, "mock push notification");
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

pub fn build_provider(config: &Config) -> AppResult<std::sync::Arc<dyn PushProvider>> {
    match config.push_provider.as_str() {
        "mock" => Ok(std::sync::Arc::new(MockPushProvider)),
        other => {
            let endpoint = std::env::var("PUSH_API_ENDPOINT")
                .unwrap_or_else(|_| format!("https://push.example.com/{other}/send"));
            let api_key = std::env::var("PUSH_API_KEY").unwrap_or_default();
            Ok(std::sync::Arc::new(HttpPushProvider::new(endpoint, api_key)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_provider_always_succeeds() {
        let provider = MockPushProvider;
        let notification = PushNotification {
            recipient_id: Uuid::new_v4(),
            title: "New message".into(),
            preview: "...".into(),
        };
        assert!(provider.send(&notification).await.is_ok());
    }
}
