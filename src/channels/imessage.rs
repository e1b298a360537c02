//! iMessage bridge adapter
//!
//! Messages are handed to a local bridge service over HTTP; the bridge owns
//! the actual Messages.app integration.

use super::adapter::ChannelAdapter;
use super::message::OutboundMessage;
use crate::config::IMessageConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BridgeSendRequest<'a> {
    text: &'a str,
    chat_id: &'a str,
    sender: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    skip_queue: bool,
}

/// iMessage channel adapter
pub struct IMessageAdapter {
    config: IMessageConfig,
    client: reqwest::Client,
}

impl IMessageAdapter {
    pub fn new(config: IMessageConfig) -> Result<Self> {
        if config.send_url.trim().is_empty() {
            return Err(Error::Config("channels.imessage.send_url is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl ChannelAdapter for IMessageAdapter {
    fn name(&self) -> &str {
        "imessage"
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<()> {
        let body = BridgeSendRequest {
            text: &message.content,
            chat_id: &message.chat_id,
            sender: &message.sender,
            skip_queue: message.skip_queue,
        };

        let response = self
            .client
            .post(&self.config.send_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Channel(format!("iMessage bridge request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Channel(format!(
                "iMessage bridge returned {}: {}",
                status, text
            )));
        }

        tracing::debug!(chat_id = %message.chat_id, "Sent iMessage reply");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_request_shape() {
        let body = BridgeSendRequest {
            text: "[Nova] hi",
            chat_id: "c1",
            sender: "+100",
            skip_queue: false,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"text": "[Nova] hi", "chatId": "c1", "sender": "+100"})
        );

        let urgent = BridgeSendRequest {
            skip_queue: true,
            ..body
        };
        assert_eq!(serde_json::to_value(&urgent).unwrap()["skipQueue"], true);
    }

    #[test]
    fn test_empty_url_rejected() {
        let config = IMessageConfig {
            send_url: " ".to_string(),
            timeout_ms: 1000,
        };
        assert!(matches!(IMessageAdapter::new(config), Err(Error::Config(_))));
    }
}
