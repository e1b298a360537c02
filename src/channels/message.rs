//! Channel message types

use serde::{Deserialize, Serialize};

/// Message received from an external channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Conversation identifier on the channel
    pub chat_id: String,
    /// Sender identifier (phone number, handle, ...)
    #[serde(default)]
    pub sender: String,
    pub text: String,
}

/// Message to send to an external channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub sender: String,
    pub content: String,
    /// Deliver ahead of anything the bridge has queued
    pub skip_queue: bool,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender: sender.into(),
            content: content.into(),
            skip_queue: false,
        }
    }

    pub fn with_skip_queue(mut self, skip_queue: bool) -> Self {
        self.skip_queue = skip_queue;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_camel_case() {
        let msg: InboundMessage =
            serde_json::from_str(r#"{"chatId":"c1","sender":"+100","text":"nova hi"}"#).unwrap();
        assert_eq!(msg.chat_id, "c1");
        assert_eq!(msg.sender, "+100");

        let no_sender: InboundMessage =
            serde_json::from_str(r#"{"chatId":"c1","text":"hi"}"#).unwrap();
        assert!(no_sender.sender.is_empty());
    }
}
