//! Session index
//!
//! Agents report the transcript file they are writing in `get_state`
//! responses. The index keeps the latest file per agent so the transport
//! layer can list sessions without asking each agent.

use crate::agent::AgentRuntime;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// Receives session file updates reported by agents
pub trait SessionIndex: Send + Sync {
    /// Called whenever an agent reports its current session file
    fn on_session_file(&self, agent: &AgentRuntime, path: &str, payload: &Value);

    /// Known sessions, most recently updated first
    fn list(&self) -> Vec<SessionEntry>;
}

/// One known agent session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub agent_id: String,
    pub agent_name: String,
    pub session_file: String,
    pub session_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory session index keyed by agent id
#[derive(Default)]
pub struct InMemorySessionIndex {
    entries: RwLock<HashMap<String, SessionEntry>>,
}

impl InMemorySessionIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionIndex for InMemorySessionIndex {
    fn on_session_file(&self, agent: &AgentRuntime, path: &str, payload: &Value) {
        let session_id = payload
            .pointer("/data/sessionId")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let changed = entries
            .get(agent.id())
            .map(|e| e.session_file != path)
            .unwrap_or(true);

        entries.insert(
            agent.id().to_string(),
            SessionEntry {
                agent_id: agent.id().to_string(),
                agent_name: agent.name().to_string(),
                session_file: path.to_string(),
                session_id,
                updated_at: Utc::now(),
            },
        );

        if changed {
            tracing::info!(
                agent_id = %agent.id(),
                session_file = %path,
                "Agent session file updated"
            );
        }
    }

    fn list(&self) -> Vec<SessionEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<SessionEntry> = entries.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ReplyPrefixMode};
    use serde_json::json;

    #[test]
    fn test_index_keeps_latest_file_per_agent() {
        let index = InMemorySessionIndex::new();
        let nova = AgentRuntime::new(
            AgentConfig::new("nova").with_name("Nova"),
            ReplyPrefixMode::Always,
        );
        let atlas = AgentRuntime::new(AgentConfig::new("atlas"), ReplyPrefixMode::Always);

        index.on_session_file(&nova, "/s/1.jsonl", &json!({}));
        index.on_session_file(&atlas, "/s/2.jsonl", &json!({}));
        index.on_session_file(
            &nova,
            "/s/3.jsonl",
            &json!({"data": {"sessionId": "abc"}}),
        );

        let list = index.list();
        assert_eq!(list.len(), 2);
        let nova_entry = list.iter().find(|e| e.agent_id == "nova").unwrap();
        assert_eq!(nova_entry.session_file, "/s/3.jsonl");
        assert_eq!(nova_entry.session_id.as_deref(), Some("abc"));
        assert_eq!(nova_entry.agent_name, "Nova");
    }
}
