use crate::domain::models::NotificationAction;
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;
use url::Url;

/// Outbound message channel. Delivery is at-least-once from the caller's
/// side: an `Err` means the message should be retried later.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), InfraError>;

    async fn send_with_actions(
        &self,
        recipient: &str,
        text: &str,
        actions: &[NotificationAction],
    ) -> Result<(), InfraError>;
}

/// Writes notifications to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), InfraError> {
        info!(recipient, text, "notification");
        Ok(())
    }

    async fn send_with_actions(
        &self,
        recipient: &str,
        text: &str,
        actions: &[NotificationAction],
    ) -> Result<(), InfraError> {
        let actions = actions
            .iter()
            .map(|action| action.data.as_str())
            .collect::<Vec<_>>()
            .join(",");
        info!(recipient, text, %actions, "notification");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipient: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    actions: &'a [NotificationAction],
}

/// Posts each notification as JSON to a bot or relay endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    endpoint: Url,
}

impl WebhookNotifier {
    pub fn new(endpoint: &str) -> Result<Self, InfraError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid webhook url: {error}")))?;
        Ok(Self {
            client: Client::new(),
            endpoint,
        })
    }

    async fn post(&self, payload: &WebhookPayload<'_>) -> Result<(), InfraError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(payload)
            .send()
            .await
            .map_err(|error| {
                InfraError::Notifier(format!("network error while sending notification: {error}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InfraError::Notifier(format!(
                "webhook rejected notification: http {}; body={body}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), InfraError> {
        self.post(&WebhookPayload {
            recipient,
            text,
            actions: &[],
        })
        .await
    }

    async fn send_with_actions(
        &self,
        recipient: &str,
        text: &str,
        actions: &[NotificationAction],
    ) -> Result<(), InfraError> {
        self.post(&WebhookPayload {
            recipient,
            text,
            actions,
        })
        .await
    }
}
