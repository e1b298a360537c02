//! Line protocol types for agent process communication
//!
//! Agents read one JSON command per line on stdin and write one JSON payload
//! per line on stdout. Payloads are either correlated responses
//! (`type: "response"`) or asynchronous events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Agent → Gateway events
// =============================================================================

/// Event emitted by an agent process (everything that is not a response)
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Extension asks the UI for input; forwarded verbatim
    ExtensionUiRequest(Value),
    /// The agent began working on the current prompt
    AgentStart,
    /// One model turn finished
    TurnEnd(TurnEndEvent),
    /// The agent finished the prompt
    AgentEnd(AgentEndEvent),
    /// Any event type this gateway does not act on
    Unknown(String),
}

impl AgentEvent {
    /// Classify a decoded payload by its `type` tag.
    ///
    /// Known types with a malformed body degrade to `Unknown` so one bad
    /// event cannot take down the reader loop.
    pub fn from_payload(payload: &Value) -> Self {
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        match event_type {
            "extension_ui_request" => Self::ExtensionUiRequest(payload.clone()),
            "agent_start" => Self::AgentStart,
            "turn_end" => match serde_json::from_value(payload.clone()) {
                Ok(ev) => Self::TurnEnd(ev),
                Err(e) => {
                    tracing::debug!("Malformed turn_end event: {}", e);
                    Self::Unknown(event_type.to_string())
                }
            },
            "agent_end" => match serde_json::from_value(payload.clone()) {
                Ok(ev) => Self::AgentEnd(ev),
                Err(e) => {
                    tracing::debug!("Malformed agent_end event: {}", e);
                    Self::Unknown(event_type.to_string())
                }
            },
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// `turn_end` event body
#[derive(Debug, Clone, Deserialize)]
pub struct TurnEndEvent {
    #[serde(default)]
    pub message: Option<AgentMessage>,
}

/// `agent_end` event body
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEndEvent {
    #[serde(default)]
    pub messages: Vec<AgentMessage>,
}

impl AgentEndEvent {
    /// Text of the most recent assistant message, or empty if there is none
    pub fn final_reply(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_assistant())
            .map(AgentMessage::text)
            .unwrap_or_default()
    }
}

/// A conversation message as reported by the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(rename = "stopReason", default)]
    pub stop_reason: Option<String>,
}

impl AgentMessage {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    /// Whether the turn stopped to run tools (the agent keeps working)
    pub fn is_tool_use(&self) -> bool {
        self.stop_reason.as_deref() == Some("toolUse")
    }

    /// Concatenated `text` / `input_text` content, trimmed
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.trim().to_string(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<String>()
                .trim()
                .to_string(),
        }
    }
}

/// Message content: either a bare string or a list of typed blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

/// Content block within a message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    InputText {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl ContentBlock {
    fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::InputText { text } => Some(text),
            Self::Other => None,
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// View over a `type: "response"` payload
///
/// Fields are read one by one so a response with an unexpected shape still
/// correlates by id.
#[derive(Debug, Clone, Default)]
pub struct ResponsePayload {
    pub id: Option<String>,
    pub command: Option<String>,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<Value>,
}

impl ResponsePayload {
    /// View a payload if it is a response; other payloads yield `None`
    pub fn from_payload(payload: &Value) -> Option<Self> {
        if payload.get("type").and_then(Value::as_str) != Some("response") {
            return None;
        }
        let text = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        let present = |key: &str| payload.get(key).filter(|v| !v.is_null()).cloned();

        Some(Self {
            id: text("id"),
            command: text("command"),
            success: payload.get("success").and_then(Value::as_bool).unwrap_or(false),
            data: present("data"),
            error: present("error"),
        })
    }

    /// Error reported by the agent, as display text
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::String(message) => Some(message.clone()),
            other => Some(
                other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            ),
        }
    }

    /// Correlation id, if present and non-empty
    pub fn correlation_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// Session file reported by a successful `get_state`
    pub fn session_file(&self) -> Option<&str> {
        if !self.success || self.command.as_deref() != Some("get_state") {
            return None;
        }
        self.data
            .as_ref()?
            .get("sessionFile")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
    }
}

// =============================================================================
// Gateway → Agent commands
// =============================================================================

/// Build a prompt command
pub fn prompt_command(message: &str) -> Value {
    serde_json::json!({ "type": "prompt", "message": message })
}

/// Build an abort command
pub fn abort_command() -> Value {
    serde_json::json!({ "type": "abort" })
}

/// Build a get_state command
pub fn get_state_command() -> Value {
    serde_json::json!({ "type": "get_state" })
}

/// Build a new_session command
pub fn new_session_command() -> Value {
    serde_json::json!({ "type": "new_session" })
}

/// Command type of an outbound payload, for error messages
pub fn command_type(command: &Value) -> String {
    command
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_known_events() {
        assert!(matches!(
            AgentEvent::from_payload(&json!({"type": "agent_start"})),
            AgentEvent::AgentStart
        ));
        assert!(matches!(
            AgentEvent::from_payload(&json!({"type": "extension_ui_request", "id": "x"})),
            AgentEvent::ExtensionUiRequest(_)
        ));
        match AgentEvent::from_payload(&json!({"type": "message_update"})) {
            AgentEvent::Unknown(t) => assert_eq!(t, "message_update"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_turn_end_is_unknown() {
        let ev = AgentEvent::from_payload(&json!({"type": "turn_end", "message": 42}));
        assert!(matches!(ev, AgentEvent::Unknown(_)));
    }

    #[test]
    fn test_message_text_concatenates_text_blocks() {
        let msg: AgentMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Hello "},
                {"type": "tool_call", "name": "bash"},
                {"type": "input_text", "text": "world"}
            ],
            "stopReason": "stop"
        }))
        .unwrap();
        assert_eq!(msg.text(), "Hello world");
        assert!(!msg.is_tool_use());
    }

    #[test]
    fn test_message_text_plain_string() {
        let msg: AgentMessage =
            serde_json::from_value(json!({"role": "user", "content": " hi "})).unwrap();
        assert_eq!(msg.text(), "hi");
    }

    #[test]
    fn test_final_reply_picks_last_assistant() {
        let ev: AgentEndEvent = serde_json::from_value(json!({
            "type": "agent_end",
            "messages": [
                {"role": "assistant", "content": [{"type": "text", "text": "first"}]},
                {"role": "user", "content": [{"type": "text", "text": "again"}]},
                {"role": "assistant", "content": [{"type": "text", "text": "second"}]},
                {"role": "toolResult", "content": [{"type": "text", "text": "out"}]}
            ]
        }))
        .unwrap();
        assert_eq!(ev.final_reply(), "second");

        let empty: AgentEndEvent = serde_json::from_value(json!({"type": "agent_end"})).unwrap();
        assert_eq!(empty.final_reply(), "");
    }

    #[test]
    fn test_response_session_file() {
        let resp = ResponsePayload::from_payload(&json!({
            "type": "response",
            "id": "a-1",
            "command": "get_state",
            "success": true,
            "data": {"sessionFile": "/tmp/s.jsonl"}
        }))
        .unwrap();
        assert_eq!(resp.correlation_id(), Some("a-1"));
        assert_eq!(resp.session_file(), Some("/tmp/s.jsonl"));

        let failed = ResponsePayload::from_payload(&json!({
            "type": "response",
            "command": "get_state",
            "success": false,
            "data": {"sessionFile": "/tmp/s.jsonl"}
        }))
        .unwrap();
        assert_eq!(failed.session_file(), None);
        assert_eq!(failed.correlation_id(), None);

        assert!(ResponsePayload::from_payload(&json!({"type": "agent_start"})).is_none());
    }

    #[test]
    fn test_response_with_structured_error() {
        let resp = ResponsePayload::from_payload(&json!({
            "type": "response",
            "id": "nova-1",
            "command": 7,
            "success": false,
            "error": {"message": "boom", "code": 3}
        }))
        .unwrap();
        assert_eq!(resp.correlation_id(), Some("nova-1"));
        assert_eq!(resp.command, None);
        assert_eq!(resp.error_message().as_deref(), Some("boom"));

        let plain = ResponsePayload::from_payload(&json!({
            "type": "response", "id": "nova-2", "success": false, "error": "nope"
        }))
        .unwrap();
        assert_eq!(plain.error_message().as_deref(), Some("nope"));

        let bare = ResponsePayload::from_payload(&json!({
            "type": "response", "id": "nova-3", "error": ["x"]
        }))
        .unwrap();
        assert_eq!(bare.error_message().as_deref(), Some(r#"["x"]"#));
    }
}
