use crate::error::DispatchError;
use crate::models::metrics::{Alert, ConditionCode};
use crate::utils::format::join_bullets;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Delivers one message to one recipient of the chat transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), DispatchError>;
}

pub struct TelegramTransport {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

const USER_AGENT: &str = concat!("potion-runner/", env!("CARGO_PKG_VERSION"));

impl TelegramTransport {
    pub fn new(api_base: &str, token: &str) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
        })
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?;
        let body: TelegramResponse = response.json().await?;
        if !body.ok {
            return Err(DispatchError::Rejected(
                body.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(())
    }
}

/// Fans messages out to every recipient. Never fails; errors are logged per recipient.
#[derive(Clone)]
pub struct AlertDispatcher {
    transport: Arc<dyn Transport>,
    recipients: Vec<i64>,
}

impl AlertDispatcher {
    pub fn new(transport: Arc<dyn Transport>, recipients: Vec<i64>) -> Self {
        Self {
            transport,
            recipients,
        }
    }

    /// Returns how many recipients received the message.
    pub async fn broadcast(&self, text: &str) -> usize {
        let sends = self.recipients.iter().map(|&chat_id| {
            let transport = Arc::clone(&self.transport);
            async move { (chat_id, transport.send(chat_id, text).await) }
        });

        let mut delivered = 0;
        for (chat_id, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(chat_id, error = %e, "Failed to deliver message"),
            }
        }
        debug!(delivered, total = self.recipients.len(), "Broadcast finished");
        delivered
    }

    /// Sends the trigger batch, then the recovery batch.
    pub async fn dispatch_tick(&self, triggered: &[Alert], recovered: &[ConditionCode], summary: &str) {
        if !triggered.is_empty() {
            self.broadcast(&alert_text(triggered, summary)).await;
        }
        if !recovered.is_empty() {
            self.broadcast(&recovery_text(recovered)).await;
        }
    }
}

pub fn alert_text(triggered: &[Alert], summary: &str) -> String {
    format!(
        "⚠️ Server alert!\n{}\n{}",
        join_bullets(triggered.iter().map(|alert| alert.message.as_str())),
        summary
    )
}

pub fn recovery_text(recovered: &[ConditionCode]) -> String {
    format!(
        "✅ Recovery\n{}",
        join_bullets(recovered.iter().map(ToString::to_string))
    )
}
