//! Channel adapter trait

use super::message::OutboundMessage;
use crate::error::Result;
use async_trait::async_trait;

/// Outbound side of an external messaging channel
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name (e.g. "imessage")
    fn name(&self) -> &str;

    /// Deliver a message to the channel
    async fn send_message(&self, message: OutboundMessage) -> Result<()>;
}
