//! Gateway server implementation
//!
//! The `Gateway` ties the agents together: it reads agent output through the
//! decoder, settles requests through the correlator, drives tasks through the
//! lifecycle handler and routes inbound text to agents.

use crate::agent::commands::{self, GatewayCommand};
use crate::agent::router::{self, RouterResult};
use crate::agent::types::{get_state_command, new_session_command, ResponsePayload};
use crate::agent::{
    AgentLauncher, AgentListEntry, AgentRegistry, AgentRuntime, LineDecoder, LineHandler,
    ProcessEvents, RequestOptions, ResponseCorrelator,
};
use crate::channels::{ChannelAdapter, IMessageAdapter};
use crate::config::MulticlawConfig;
use crate::error::{Error, Result};
use crate::notify::{Notifier, WebHub};
use crate::session::{InMemorySessionIndex, SessionEntry, SessionIndex};
use crate::task::{
    LifecycleSettings, ReplyDelivery, ReplyTarget, SubagentReplies, SubmitOutcome, Task,
    TaskLifecycle, TaskSource,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Agent supervisors running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// Text arriving from a user, before routing
#[derive(Debug)]
pub struct InboundText {
    /// Key identifying the conversation (one socket, one chat)
    pub conversation: String,
    pub source: TaskSource,
    pub target: ReplyTarget,
    pub text: String,
    /// Receives the formatted reply (or notice) for this text
    pub on_reply: Option<oneshot::Sender<String>>,
}

impl InboundText {
    pub fn new(
        conversation: impl Into<String>,
        source: TaskSource,
        target: ReplyTarget,
        text: impl Into<String>,
    ) -> Self {
        Self {
            conversation: conversation.into(),
            source,
            target,
            text: text.into(),
            on_reply: None,
        }
    }

    pub fn with_on_reply(mut self, tx: oneshot::Sender<String>) -> Self {
        self.on_reply = Some(tx);
        self
    }

    fn notice(self, text: impl Into<String>) -> ReplyDelivery {
        ReplyDelivery::standalone(self.source, self.target, self.on_reply, text)
    }
}

/// What `dispatch` did with inbound text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Blank input
    Empty,
    /// No agent is registered under the current or default id
    NoAgent,
    /// A keyword with nothing after it; the conversation now talks to `agent_id`
    Switched { agent_id: String },
    /// The agent started a new session, optionally with a first task
    NewSession {
        agent_id: String,
        task: Option<SubmitOutcome>,
    },
    /// A task was submitted to `agent_id`
    Submitted {
        agent_id: String,
        outcome: SubmitOutcome,
    },
}

/// Live status of one agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    #[serde(flatten)]
    pub entry: AgentListEntry,
    pub online: bool,
    pub default: bool,
    pub current_task: Option<String>,
    pub queued_tasks: usize,
    pub session_file: Option<String>,
}

/// Gateway status information
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub state: GatewayState,
    pub default_agent: String,
    pub agents: usize,
    pub online_agents: usize,
    pub channels: Vec<String>,
}

/// Multiclaw gateway
pub struct Gateway {
    config: MulticlawConfig,
    state: RwLock<GatewayState>,
    registry: AgentRegistry,
    decoder: LineDecoder,
    correlator: ResponseCorrelator,
    lifecycle: Arc<TaskLifecycle>,
    hub: Arc<WebHub>,
    sessions: Arc<dyn SessionIndex>,
    channel: Option<Arc<dyn ChannelAdapter>>,
    /// Active agent id per conversation
    conversations: Mutex<HashMap<String, String>>,
    shutdown: CancellationToken,
    supervisors: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// Create a gateway with the channel adapters named in `config`
    pub fn new(config: MulticlawConfig) -> Result<Self> {
        GatewayBuilder::new().config(config).build()
    }

    pub fn state(&self) -> GatewayState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: GatewayState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Launch a supervised process for every agent
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() != GatewayState::Stopped {
            return Err(Error::Gateway("Gateway already running".to_string()));
        }

        tracing::info!(agents = self.registry.agents().len(), "Starting Multiclaw gateway");

        let launcher = AgentLauncher::new(self.clone(), self.shutdown.clone());
        let handles = launcher.spawn_all(self.registry.agents());
        self.supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);

        self.set_state(GatewayState::Running);
        Ok(())
    }

    /// Stop every agent process and wait for the supervisors to exit
    pub async fn stop(&self) {
        if self.state() != GatewayState::Running {
            return;
        }
        self.set_state(GatewayState::ShuttingDown);
        tracing::info!("Stopping Multiclaw gateway");

        self.shutdown.cancel();
        let handles: Vec<_> = self
            .supervisors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Agent supervisor ended abnormally: {}", e);
            }
        }

        self.set_state(GatewayState::Stopped);
        tracing::info!("Multiclaw gateway stopped");
    }

    pub fn config(&self) -> &MulticlawConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<WebHub> {
        &self.hub
    }

    pub fn lifecycle(&self) -> &Arc<TaskLifecycle> {
        &self.lifecycle
    }

    pub fn notifier(&self) -> &Notifier {
        self.lifecycle.notifier()
    }

    // =========================================================================
    // Facade
    // =========================================================================

    pub fn get_agent(&self, id: &str) -> Option<Arc<AgentRuntime>> {
        self.registry.get(id).cloned()
    }

    /// Route `text` given the conversation's current agent
    pub fn resolve_agent_from_text(
        &self,
        text: &str,
        current_agent_id: Option<&str>,
    ) -> RouterResult {
        router::resolve(
            text,
            current_agent_id,
            self.registry.agents(),
            Some(self.registry.default_agent_id()),
        )
    }

    pub fn resolve_command(&self, text: &str) -> Option<GatewayCommand> {
        commands::resolve_command(text)
    }

    pub fn is_slash_command(&self, text: &str) -> bool {
        commands::is_slash_command(text)
    }

    /// Send a command and wait for the correlated response.
    ///
    /// `timeout_ms` overrides the configured request timeout; 0 waits forever.
    pub async fn send_agent_request(
        &self,
        agent: &Arc<AgentRuntime>,
        command: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value> {
        let timeout_ms = timeout_ms.unwrap_or(self.config.gateway.request_timeout_ms);
        self.correlator
            .send(agent, command, RequestOptions::with_timeout_ms(timeout_ms))
            .await
    }

    /// Write a payload to an agent without waiting for a response
    pub fn send_to_agent(&self, agent: &AgentRuntime, payload: &Value) -> Result<()> {
        self.correlator.send_to_agent(agent, payload)
    }

    pub async fn submit(&self, agent: &Arc<AgentRuntime>, task: Task) -> SubmitOutcome {
        self.lifecycle.submit(agent, task).await
    }

    /// Abort the current task of `agent_id`; `Ok(false)` when it is idle
    pub async fn abort_current_task(&self, agent_id: &str) -> Result<bool> {
        let agent = self
            .get_agent(agent_id)
            .ok_or_else(|| Error::Gateway(format!("Unknown agent: {}", agent_id)))?;
        self.lifecycle.abort_current(&agent).await
    }

    /// Start a fresh session on `agent` and refresh its session file
    pub async fn new_session(&self, agent: &Arc<AgentRuntime>) -> Result<Value> {
        let response = self.send_agent_request(agent, new_session_command(), None).await?;
        if let Some(parsed) = ResponsePayload::from_payload(&response) {
            if !parsed.success {
                return Err(Error::Agent(
                    parsed
                        .error_message()
                        .unwrap_or_else(|| "new_session was rejected".to_string()),
                ));
            }
        }

        tracing::info!(agent_id = %agent.id(), "New agent session started");

        if let Err(e) = self.send_agent_request(agent, get_state_command(), None).await {
            tracing::warn!(agent_id = %agent.id(), error = %e, "Failed to refresh agent state");
        }
        Ok(response)
    }

    /// Active agent of a conversation, if it has one
    pub fn active_agent(&self, conversation: &str) -> Option<String> {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(conversation)
            .cloned()
    }

    /// Make `agent_id` the active agent of a conversation
    pub fn set_active_agent(&self, conversation: &str, agent_id: &str) -> Result<()> {
        if self.registry.get(agent_id).is_none() {
            return Err(Error::Gateway(format!("Unknown agent: {}", agent_id)));
        }
        self.remember_agent(conversation, agent_id);
        Ok(())
    }

    fn remember_agent(&self, conversation: &str, agent_id: &str) {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conversation.to_string(), agent_id.to_string());
    }

    /// Forget a conversation (socket closed)
    pub fn end_conversation(&self, conversation: &str) {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conversation);
    }

    /// Route inbound text and act on it.
    ///
    /// Keyword prefixes switch the conversation's active agent; `new` starts
    /// a new session; anything else becomes a task for the active agent.
    pub async fn dispatch(&self, inbound: InboundText) -> Result<DispatchOutcome> {
        if inbound.text.trim().is_empty() {
            return Ok(DispatchOutcome::Empty);
        }

        let current = self.active_agent(&inbound.conversation);
        let routed = self.resolve_agent_from_text(&inbound.text, current.as_deref());
        let Some(agent) = routed.agent else {
            tracing::warn!(conversation = %inbound.conversation, "No agent available for message");
            return Ok(DispatchOutcome::NoAgent);
        };

        self.remember_agent(&inbound.conversation, agent.id());
        if routed.switched {
            tracing::info!(
                conversation = %inbound.conversation,
                agent_id = %agent.id(),
                "Conversation switched agent"
            );
        }

        if let Some(GatewayCommand::NewSession { remainder }) =
            self.resolve_command(&routed.remainder)
        {
            return self.dispatch_new_session(&agent, inbound, remainder).await;
        }

        if routed.remainder.is_empty() {
            let notice = inbound.notice(format!("Now talking to {}.", agent.name()));
            self.notifier().notify_task_message(&agent, notice, false).await;
            return Ok(DispatchOutcome::Switched {
                agent_id: agent.id().to_string(),
            });
        }

        let mut task = Task::new(inbound.source, inbound.target, routed.remainder);
        if let Some(tx) = inbound.on_reply {
            task = task.with_on_reply(tx);
        }
        let outcome = self.submit(&agent, task).await;
        Ok(DispatchOutcome::Submitted {
            agent_id: agent.id().to_string(),
            outcome,
        })
    }

    async fn dispatch_new_session(
        &self,
        agent: &Arc<AgentRuntime>,
        inbound: InboundText,
        remainder: String,
    ) -> Result<DispatchOutcome> {
        if let Err(e) = self.new_session(agent).await {
            let notice = inbound.notice(format!("Failed to start a new session: {}", e));
            self.notifier().notify_task_message(agent, notice, false).await;
            return Err(e);
        }

        let agent_id = agent.id().to_string();
        if remainder.is_empty() {
            let notice = inbound.notice("New session started.");
            self.notifier().notify_task_message(agent, notice, false).await;
            return Ok(DispatchOutcome::NewSession { agent_id, task: None });
        }

        let mut task = Task::new(inbound.source, inbound.target, remainder);
        if let Some(tx) = inbound.on_reply {
            task = task.with_on_reply(tx);
        }
        let outcome = self.submit(agent, task).await;
        Ok(DispatchOutcome::NewSession {
            agent_id,
            task: Some(outcome),
        })
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn list_agents(&self) -> Vec<AgentStatus> {
        let default_id = self.registry.default_agent_id();
        self.registry
            .agents()
            .iter()
            .zip(self.registry.list_entries())
            .map(|(agent, entry)| AgentStatus {
                online: !agent.is_offline(),
                default: agent.id() == default_id,
                current_task: agent.current_task_id(),
                queued_tasks: agent.queued_tasks(),
                session_file: agent.current_session_file(),
                entry,
            })
            .collect()
    }

    pub fn list_sessions(&self) -> Vec<SessionEntry> {
        self.sessions.list()
    }

    pub async fn restart_agent_processes(&self) -> usize {
        self.registry.restart_agent_processes().await
    }

    pub fn status(&self) -> GatewayStatus {
        GatewayStatus {
            state: self.state(),
            default_agent: self.registry.default_agent_id().to_string(),
            agents: self.registry.agents().len(),
            online_agents: self
                .registry
                .agents()
                .iter()
                .filter(|a| !a.is_offline())
                .count(),
            channels: self.channel.iter().map(|c| c.name().to_string()).collect(),
        }
    }
}

#[async_trait]
impl LineHandler for Gateway {
    async fn handle_line(&self, agent: &Arc<AgentRuntime>, raw: &str) {
        let Some(decoded) = self.decoder.decode(raw) else {
            return;
        };

        if !self.correlator.handle(agent, &decoded.payload) {
            if ResponsePayload::from_payload(&decoded.payload).is_some() {
                tracing::debug!(agent_id = %agent.id(), "Uncorrelated agent response");
            } else {
                self.lifecycle.handle_event(agent, &decoded.payload).await;
            }
        }

        // Observers see a line only after it has been acted on
        self.hub.publish_line(agent.id(), &decoded.line);
    }
}

#[async_trait]
impl ProcessEvents for Gateway {
    async fn on_spawned(&self, agent: &Arc<AgentRuntime>) {
        self.lifecycle.resume_queue(agent).await;
        if let Err(e) = self.send_agent_request(agent, get_state_command(), None).await {
            tracing::warn!(agent_id = %agent.id(), error = %e, "Initial get_state failed");
        }
    }

    async fn on_exited(&self, agent: &Arc<AgentRuntime>) {
        self.lifecycle.on_process_exit(agent).await;
    }
}

/// Builder for Gateway
pub struct GatewayBuilder {
    config: MulticlawConfig,
    channel: Option<Arc<dyn ChannelAdapter>>,
    sessions: Option<Arc<dyn SessionIndex>>,
    subagents: Option<Arc<dyn SubagentReplies>>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: MulticlawConfig::default(),
            channel: None,
            sessions: None,
            subagents: None,
        }
    }

    pub fn config(mut self, config: MulticlawConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.gateway.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.gateway.port = port;
        self
    }

    /// Use `channel` instead of the adapter configured in `[channels]`
    pub fn channel(mut self, channel: Arc<dyn ChannelAdapter>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn session_index(mut self, sessions: Arc<dyn SessionIndex>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn subagent_replies(mut self, subagents: Arc<dyn SubagentReplies>) -> Self {
        self.subagents = Some(subagents);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let config = self.config;
        let registry = AgentRegistry::init_agents(&config)
            .ok_or_else(|| Error::Config("no usable agents configured".to_string()))?;

        let channel = match (self.channel, &config.channels.imessage) {
            (Some(channel), _) => Some(channel),
            (None, Some(imessage)) => {
                Some(Arc::new(IMessageAdapter::new(imessage.clone())?) as Arc<dyn ChannelAdapter>)
            }
            (None, None) => None,
        };

        let hub = Arc::new(WebHub::new(config.gateway.broadcast_capacity));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(InMemorySessionIndex::new()) as Arc<dyn SessionIndex>);

        let mut notifier = Notifier::new().with_background(hub.clone());
        if let Some(channel) = &channel {
            notifier = notifier.with_channel(channel.clone());
        }

        let mut lifecycle = TaskLifecycle::new(notifier, LifecycleSettings::from(&config.gateway))
            .with_ui_requests(hub.clone());
        if let Some(subagents) = self.subagents {
            lifecycle = lifecycle.with_subagent_replies(subagents);
        }

        Ok(Gateway {
            decoder: LineDecoder::new(config.gateway.log_protocol_errors),
            correlator: ResponseCorrelator::new(sessions.clone()),
            lifecycle: Arc::new(lifecycle),
            state: RwLock::new(GatewayState::Stopped),
            conversations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            supervisors: Mutex::new(Vec::new()),
            registry,
            hub,
            sessions,
            channel,
            config,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::agent::runtime::testing::RecordingProcess;
    use crate::config::AgentConfig;
    use crate::notify::testing::RecordingChannel;

    pub struct TestGateway {
        pub gateway: Arc<Gateway>,
        pub nova: Arc<RecordingProcess>,
        pub atlas: Arc<RecordingProcess>,
        pub channel: Arc<RecordingChannel>,
    }

    /// Gateway with two online agents backed by recording processes
    pub fn test_gateway() -> TestGateway {
        let mut config = MulticlawConfig::default();
        config.agents = vec![
            AgentConfig::new("nova").with_name("Nova").with_keywords(["nova"]),
            AgentConfig::new("atlas").with_name("Atlas").with_keywords(["atlas", "at"]),
        ];
        config.gateway.default_agent = Some("nova".to_string());

        let channel = Arc::new(RecordingChannel::default());
        let gateway = GatewayBuilder::new()
            .config(config)
            .channel(channel.clone())
            .build()
            .unwrap();

        let nova = Arc::new(RecordingProcess::default());
        let atlas = Arc::new(RecordingProcess::default());
        gateway.get_agent("nova").unwrap().attach_process(nova.clone());
        gateway.get_agent("atlas").unwrap().attach_process(atlas.clone());

        TestGateway {
            gateway: Arc::new(gateway),
            nova,
            atlas,
            channel,
        }
    }

    /// Answer the next request written to `process` once it appears
    pub async fn answer_next(
        gateway: &Gateway,
        agent_id: &str,
        process: &RecordingProcess,
        index: usize,
        data: Value,
    ) -> Value {
        loop {
            if let Some(request) = process.written().get(index).cloned() {
                let response = serde_json::json!({
                    "type": "response",
                    "id": request["id"],
                    "command": request["type"],
                    "success": true,
                    "data": data,
                });
                let agent = gateway.get_agent(agent_id).unwrap();
                gateway.handle_line(&agent, &response.to_string()).await;
                return request;
            }
            tokio::task::yield_now().await;
        }
    }
}
