//! Instant messages to individual users.

use async_trait::async_trait;

use crate::error::{LarkError, Result};
use crate::lark::client::LarkClient;

/// Delivers one interactive card to one user.
#[async_trait]
pub trait CardSender: Send + Sync {
    /// Returns the `message_id` of the sent message.
    async fn send_card(&self, open_id: &str, card: &serde_json::Value) -> Result<String>;
}

#[derive(Clone)]
pub struct ImClient {
    client: LarkClient,
}

impl ImClient {
    pub fn new(client: LarkClient) -> Self {
        Self { client }
    }
}

/// Request body for an interactive card; `content` is the card serialized to a string.
pub(crate) fn card_message_body(open_id: &str, card: &serde_json::Value) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "receive_id": open_id,
        "msg_type": "interactive",
        "content": serde_json::to_string(card)?,
    }))
}

#[async_trait]
impl CardSender for ImClient {
    async fn send_card(&self, open_id: &str, card: &serde_json::Value) -> Result<String> {
        let body = card_message_body(open_id, card)?;
        let resp = self
            .client
            .post_json(
                "send message",
                "/im/v1/messages?receive_id_type=open_id",
                &body,
            )
            .await
            .map_err(|e| LarkError::DeliveryFailure {
                open_id: open_id.to_string(),
                reason: e
                    .upstream_message()
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string()),
            })?;
        let message_id = resp
            .pointer("/data/message_id")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        tracing::debug!(open_id, message_id = %message_id, "card delivered");
        Ok(message_id)
    }
}
