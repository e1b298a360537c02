//! Reply delivery and background fan-out
//!
//! Task replies go back to whoever asked: the external channel for
//! `imessage` tasks, the originating socket for `web` tasks. Final replies
//! are also offered to passive web observers through a background
//! broadcast.

pub mod hub;

pub use hub::{HubEvent, WebHub};

use crate::agent::AgentRuntime;
use crate::channels::{ChannelAdapter, OutboundMessage};
use crate::config::ReplyPrefixMode;
use crate::task::{ReplyDelivery, ReplyTarget};
use serde::Serialize;
use std::sync::Arc;

/// A final reply offered to passive observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundReply {
    pub agent_id: String,
    pub agent_name: String,
    pub text: String,
    /// Socket that submitted the task; it already has the reply
    #[serde(skip)]
    pub origin: Option<String>,
}

/// Receives replies for passive observers
pub trait BackgroundBroadcast: Send + Sync {
    fn broadcast_background(&self, reply: BackgroundReply);
}

/// Reply frame written to a task's socket
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "reply", rename_all = "camelCase")]
struct SocketReply<'a> {
    agent_id: &'a str,
    agent_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
    text: &'a str,
}

/// Prefix a reply with the agent's display name unless the agent opted out
pub fn format_reply(agent: &AgentRuntime, text: &str) -> String {
    if text.is_empty() || agent.reply_prefix_mode() == ReplyPrefixMode::Never {
        return text.to_string();
    }
    format!("[{}] {}", agent.name(), text)
}

/// Delivers task replies and background broadcasts
#[derive(Clone, Default)]
pub struct Notifier {
    channel: Option<Arc<dyn ChannelAdapter>>,
    background: Option<Arc<dyn BackgroundBroadcast>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: Arc<dyn ChannelAdapter>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_background(mut self, background: Arc<dyn BackgroundBroadcast>) -> Self {
        self.background = Some(background);
        self
    }

    /// Deliver a message to a task's requester.
    ///
    /// Empty text is ignored. Delivery failures are logged and swallowed so
    /// the caller can always go on to complete the task.
    pub async fn notify_task_message(
        &self,
        agent: &AgentRuntime,
        delivery: ReplyDelivery,
        skip_queue: bool,
    ) {
        if delivery.text.trim().is_empty() {
            return;
        }

        let text = format_reply(agent, &delivery.text);

        if let Some(tx) = delivery.on_reply {
            // Waiter may have given up
            let _ = tx.send(text.clone());
        }

        match delivery.target {
            ReplyTarget::Channel { chat_id, sender } => {
                let Some(channel) = &self.channel else {
                    tracing::warn!(
                        agent_id = %agent.id(),
                        chat_id = %chat_id,
                        "No channel adapter configured; dropping reply"
                    );
                    return;
                };
                let message = OutboundMessage::new(channel.name(), chat_id, sender, text)
                    .with_skip_queue(skip_queue);
                if let Err(e) = channel.send_message(message).await {
                    tracing::error!(
                        agent_id = %agent.id(),
                        task_id = ?delivery.task_id,
                        error = %e,
                        "Failed to deliver channel reply"
                    );
                }
            }
            ReplyTarget::Socket { client_id, tx } => {
                let frame = SocketReply {
                    agent_id: agent.id(),
                    agent_name: agent.name(),
                    task_id: delivery.task_id.as_deref(),
                    text: &text,
                };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if tx.send(json).is_err() {
                            tracing::debug!(client_id = %client_id, "Socket closed before reply");
                        }
                    }
                    Err(e) => tracing::error!("Failed to serialize reply: {}", e),
                }
            }
            ReplyTarget::Detached => {}
        }
    }

    /// Offer a final reply to passive web observers
    pub fn notify_background_web_clients(
        &self,
        agent: &AgentRuntime,
        reply: &str,
        origin: Option<&str>,
    ) {
        let Some(background) = &self.background else {
            return;
        };
        background.broadcast_background(BackgroundReply {
            agent_id: agent.id().to_string(),
            agent_name: agent.name().to_string(),
            text: format_reply(agent, reply),
            origin: origin.map(str::to_string),
        });
    }
}
