//! Request/response correlation
//!
//! Every request written to an agent carries an id of the form
//! `"{agentId}-{n}"`. The matching `type: "response"` payload settles the
//! caller's future. A per-request timer races the response; whichever side
//! removes the pending entry first settles it and the other becomes a no-op.

use crate::agent::runtime::{AgentRuntime, PendingRequest};
use crate::agent::types::{command_type, ResponsePayload};
use crate::error::{Error, Result};
use crate::session::SessionIndex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Default request timeout
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Options for a single agent request
#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    /// Timeout in milliseconds; 0 disables the timeout
    pub timeout_ms: u64,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl RequestOptions {
    pub fn with_timeout_ms(timeout_ms: u64) -> Self {
        Self { timeout_ms }
    }

    pub fn no_timeout() -> Self {
        Self { timeout_ms: 0 }
    }
}

/// Matches agent responses to outstanding requests
pub struct ResponseCorrelator {
    session_index: Arc<dyn SessionIndex>,
}

impl ResponseCorrelator {
    pub fn new(session_index: Arc<dyn SessionIndex>) -> Self {
        Self { session_index }
    }

    /// Try to settle a pending request with `payload`.
    ///
    /// Returns `true` when the payload answered an outstanding request. A
    /// successful `get_state` response updates the agent's session file
    /// whether or not anything was waiting for it.
    pub fn handle(&self, agent: &AgentRuntime, payload: &Value) -> bool {
        let Some(response) = ResponsePayload::from_payload(payload) else {
            return false;
        };

        if let Some(path) = response.session_file() {
            agent.set_current_session_file(path);
            self.session_index.on_session_file(agent, path, payload);
        }

        let Some(id) = response.correlation_id() else {
            return false;
        };

        match agent.take_pending(id) {
            Some(pending) => {
                tracing::debug!(
                    agent_id = %agent.id(),
                    request_id = %id,
                    command = %pending.command,
                    success = response.success,
                    "Agent response correlated"
                );
                pending.settle(Ok(payload.clone()));
                true
            }
            None => false,
        }
    }

    /// Send a command and wait for its response.
    ///
    /// Fails immediately if the agent is offline. Otherwise the command is
    /// written with a fresh id and the returned future settles exactly once:
    /// with the response payload, or with `Error::Timeout` naming the
    /// command type.
    pub async fn send(
        &self,
        agent: &Arc<AgentRuntime>,
        command: Value,
        options: RequestOptions,
    ) -> Result<Value> {
        if agent.is_offline() {
            return Err(Error::AgentOffline(agent.id().to_string()));
        }

        let Value::Object(mut fields) = command else {
            return Err(Error::Agent("agent command must be a JSON object".to_string()));
        };

        let command_name = command_type(&Value::Object(fields.clone()));
        let id = agent.next_request_id();
        fields.insert("id".to_string(), Value::String(id.clone()));

        let (tx, rx) = oneshot::channel();
        {
            // Timer is spawned under the lock so it cannot observe the
            // table before its own entry exists.
            let mut pending = agent.pending();
            let timer = (options.timeout_ms > 0).then(|| {
                spawn_timeout(
                    agent.clone(),
                    id.clone(),
                    command_name.clone(),
                    Duration::from_millis(options.timeout_ms),
                )
            });
            pending.insert(
                id.clone(),
                PendingRequest {
                    command: command_name.clone(),
                    tx,
                    timer,
                },
            );
        }

        if let Err(e) = agent.write_payload(&Value::Object(fields)) {
            if let Some(pending) = agent.take_pending(&id) {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
            }
            return Err(e);
        }

        tracing::debug!(
            agent_id = %agent.id(),
            request_id = %id,
            command = %command_name,
            "Agent request sent"
        );

        rx.await
            .map_err(|_| Error::Agent(format!("request {} was dropped", id)))?
    }

    /// Write a payload without waiting for any response
    pub fn send_to_agent(&self, agent: &AgentRuntime, payload: &Value) -> Result<()> {
        agent.write_payload(payload)
    }
}

fn spawn_timeout(
    agent: Arc<AgentRuntime>,
    id: String,
    command: String,
    timeout: Duration,
) -> tokio::task::AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(pending) = agent.take_pending(&id) {
            tracing::warn!(
                agent_id = %agent.id(),
                request_id = %id,
                command = %command,
                timeout_ms = timeout.as_millis() as u64,
                "Agent request timed out"
            );
            // Settle without aborting ourselves first
            let _ = pending.tx.send(Err(Error::Timeout { command }));
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::runtime::testing::online_agent;
    use crate::agent::runtime::AgentRuntime;
    use crate::config::{AgentConfig, ReplyPrefixMode};
    use crate::session::InMemorySessionIndex;
    use serde_json::json;

    fn correlator() -> (ResponseCorrelator, Arc<InMemorySessionIndex>) {
        let index = Arc::new(InMemorySessionIndex::new());
        (ResponseCorrelator::new(index.clone()), index)
    }

    #[tokio::test]
    async fn test_offline_send_rejects_without_pending() {
        let (correlator, _) = correlator();
        let agent = Arc::new(AgentRuntime::new(AgentConfig::new("nova"), ReplyPrefixMode::Always));

        let err = correlator
            .send(&agent, json!({"type": "get_state"}), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentOffline(_)));
        assert_eq!(agent.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_resolves_request() {
        let correlator = Arc::new(correlator().0);
        let (agent, process) = online_agent(AgentConfig::new("nova"));

        let send = {
            let agent = agent.clone();
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send(&agent, json!({"type": "get_state"}), RequestOptions::default())
                    .await
            })
        };

        while agent.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let written = process.written();
        assert_eq!(written[0]["type"], "get_state");
        assert_eq!(written[0]["id"], "nova-1");

        let response = json!({"type": "response", "id": "nova-1", "success": true});
        assert!(correlator.handle(&agent, &response));
        assert_eq!(send.await.unwrap().unwrap(), response);
        assert_eq!(agent.pending_count(), 0);

        // A second copy of the same response matches nothing
        assert!(!correlator.handle(&agent, &response));
    }

    #[tokio::test]
    async fn test_structured_error_response_settles_request() {
        let correlator = Arc::new(correlator().0);
        let (agent, _process) = online_agent(AgentConfig::new("nova"));

        let send = {
            let agent = agent.clone();
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send(&agent, json!({"type": "compact"}), RequestOptions::default())
                    .await
            })
        };
        while agent.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let response = json!({
            "type": "response",
            "id": "nova-1",
            "success": false,
            "error": {"message": "boom"}
        });
        assert!(correlator.handle(&agent, &response));
        assert_eq!(agent.pending_count(), 0);
        assert_eq!(send.await.unwrap().unwrap(), response);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_with_command_name() {
        let (correlator, _) = correlator();
        let (agent, _process) = online_agent(AgentConfig::new("nova"));

        let err = correlator
            .send(&agent, json!({"type": "compact"}), RequestOptions::with_timeout_ms(50))
            .await
            .unwrap_err();
        match err {
            Error::Timeout { command } => assert_eq!(command, "compact"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(agent.pending_count(), 0);

        // Late response is a no-op
        assert!(!correlator.handle(&agent, &json!({"type": "response", "id": "nova-1"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_exactly_once_under_race() {
        let (agent, _process) = online_agent(AgentConfig::new("nova"));
        let correlator = Arc::new(correlator().0);

        for round in 0..20u64 {
            let task = {
                let agent = agent.clone();
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    correlator
                        .send(&agent, json!({"type": "ping"}), RequestOptions::with_timeout_ms(10))
                        .await
                })
            };
            while agent.pending_count() == 0 {
                tokio::task::yield_now().await;
            }
            let id = format!("nova-{}", round + 1);

            // Alternate between answering before and after the deadline
            if round % 2 == 0 {
                tokio::time::advance(Duration::from_millis(10)).await;
            }
            let matched = correlator.handle(&agent, &json!({"type": "response", "id": id}));
            let outcome = task.await.unwrap();

            assert_eq!(matched, outcome.is_ok(), "round {}", round);
            assert_eq!(agent.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_zero_timeout_waits_for_response() {
        let (correlator, _) = correlator();
        let correlator = Arc::new(correlator);
        let (agent, _process) = online_agent(AgentConfig::new("nova"));

        let task = {
            let agent = agent.clone();
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send(&agent, json!({"type": "prompt"}), RequestOptions::no_timeout())
                    .await
            })
        };
        while agent.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        {
            let pending = agent.pending();
            assert!(pending.get("nova-1").unwrap().timer.is_none());
        }
        assert!(correlator.handle(&agent, &json!({"type": "response", "id": "nova-1"})));
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_get_state_updates_session_file_without_pending() {
        let (correlator, index) = correlator();
        let agent = AgentRuntime::new(AgentConfig::new("nova"), ReplyPrefixMode::Always);

        let matched = correlator.handle(
            &agent,
            &json!({
                "type": "response",
                "id": "nova-9",
                "command": "get_state",
                "success": true,
                "data": {"sessionFile": "/sessions/nova.jsonl"}
            }),
        );
        assert!(!matched);
        assert_eq!(
            agent.current_session_file().as_deref(),
            Some("/sessions/nova.jsonl")
        );
        assert_eq!(index.list().len(), 1);
    }

    #[test]
    fn test_non_response_payloads_are_unmatched() {
        let (correlator, _) = correlator();
        let agent = AgentRuntime::new(AgentConfig::new("nova"), ReplyPrefixMode::Always);
        assert!(!correlator.handle(&agent, &json!({"type": "agent_start"})));
        assert!(!correlator.handle(&agent, &json!({"type": "response", "id": ""})));
        assert!(!correlator.handle(&agent, &json!({"type": "response"})));
    }

    #[test]
    fn test_rejects_non_object_command() {
        let (correlator, _) = correlator();
        let (agent, _process) = online_agent(AgentConfig::new("nova"));
        let err = tokio_test::block_on(correlator.send(
            &agent,
            json!("prompt"),
            RequestOptions::default(),
        ))
        .unwrap_err();
        assert!(matches!(err, Error::Agent(_)));
    }
}
