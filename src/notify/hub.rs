//! Broadcast hub for web observers
//!
//! Every connected socket subscribes to the event channel; the protocol log
//! viewer subscribes to the line channel. Slow subscribers lag and drop
//! messages rather than blocking agents.

use super::{BackgroundBroadcast, BackgroundReply};
use crate::agent::AgentRuntime;
use crate::task::UiRequestHandler;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Event pushed to every connected web client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// Final reply from an agent
    BackgroundReply(BackgroundReply),
    /// Extension UI request, forwarded verbatim
    #[serde(rename_all = "camelCase")]
    UiRequest { agent_id: String, payload: Value },
    /// Raw line read from an agent's stdout
    #[serde(rename_all = "camelCase")]
    ProtocolLine { agent_id: String, line: String },
}

impl HubEvent {
    /// Socket that should not receive this event
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::BackgroundReply(reply) => reply.origin.as_deref(),
            _ => None,
        }
    }
}

/// Broadcast fan-out to web clients
pub struct WebHub {
    events: broadcast::Sender<HubEvent>,
    lines: broadcast::Sender<HubEvent>,
}

impl WebHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (lines, _) = broadcast::channel(capacity);
        Self { events, lines }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_lines(&self) -> broadcast::Receiver<HubEvent> {
        self.lines.subscribe()
    }

    /// Publish a raw protocol line for the log viewer
    pub fn publish_line(&self, agent_id: &str, line: &str) {
        if self.lines.receiver_count() == 0 {
            return;
        }
        let _ = self.lines.send(HubEvent::ProtocolLine {
            agent_id: agent_id.to_string(),
            line: line.to_string(),
        });
    }

    fn publish_event(&self, event: HubEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

impl BackgroundBroadcast for WebHub {
    fn broadcast_background(&self, reply: BackgroundReply) {
        self.publish_event(HubEvent::BackgroundReply(reply));
    }
}

impl UiRequestHandler for WebHub {
    fn forward_ui_request(&self, agent: &AgentRuntime, payload: &Value) {
        self.publish_event(HubEvent::UiRequest {
            agent_id: agent.id().to_string(),
            payload: payload.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ReplyPrefixMode};
    use serde_json::json;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let hub = WebHub::new(8);
        let mut rx = hub.subscribe_events();
        let agent = AgentRuntime::new(AgentConfig::new("nova"), ReplyPrefixMode::Always);

        hub.forward_ui_request(&agent, &json!({"type": "extension_ui_request", "id": "u1"}));
        hub.broadcast_background(BackgroundReply {
            agent_id: "nova".to_string(),
            agent_name: "nova".to_string(),
            text: "[nova] hi".to_string(),
            origin: Some("ws-1".to_string()),
        });

        let first = serde_json::to_value(rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "ui_request");
        assert_eq!(first["agentId"], "nova");
        assert_eq!(first["payload"]["id"], "u1");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.origin(), Some("ws-1"));
        let value = serde_json::to_value(&second).unwrap();
        assert_eq!(value["type"], "background_reply");
        assert_eq!(value["text"], "[nova] hi");
        assert!(value.get("origin").is_none());
    }

    #[tokio::test]
    async fn test_lines_are_separate() {
        let hub = WebHub::new(8);
        let mut events = hub.subscribe_events();
        let mut lines = hub.subscribe_lines();

        hub.publish_line("nova", r#"{"type":"agent_start"}"#);
        match lines.recv().await.unwrap() {
            HubEvent::ProtocolLine { agent_id, line } => {
                assert_eq!(agent_id, "nova");
                assert!(line.contains("agent_start"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }
}
