//! Task lifecycle driven by agent events
//!
//! The reader loop feeds every non-response payload to `handle_event`.
//! Events only ever act on the agent's current task; completing a task
//! detaches it and starts the next queued one.

use super::{ReplyDelivery, Task, TaskInfo, TaskSource, TaskState};
use crate::agent::commands::is_slash_command;
use crate::agent::runtime::TaskSlot;
use crate::agent::types::{
    abort_command, prompt_command, AgentEndEvent, AgentEvent, TurnEndEvent,
};
use crate::agent::AgentRuntime;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::notify::Notifier;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Reply delivered when a slash command produces no agent activity
pub const SLASH_COMMAND_FALLBACK: &str = "Command sent.";

/// Timer settings for tasks
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    /// 0 disables the task timeout
    pub task_timeout_ms: u64,
    /// 0 disables the slash-command fallback
    pub slash_command_grace_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            task_timeout_ms: 600_000,
            slash_command_grace_ms: 2_000,
        }
    }
}

impl From<&GatewayConfig> for LifecycleSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            task_timeout_ms: config.task_timeout_ms,
            slash_command_grace_ms: config.slash_command_grace_ms,
        }
    }
}

/// Reply text offered to the subagent collaborator
#[derive(Debug, Clone)]
pub struct SubagentReply {
    pub reply_text: String,
    pub payload: Option<Value>,
}

/// Receives replies of tasks that may belong to a subagent run
#[async_trait]
pub trait SubagentReplies: Send + Sync {
    async fn deliver_subagent_direct_reply(
        &self,
        agent: &AgentRuntime,
        task: &TaskInfo,
        reply: SubagentReply,
    );
}

/// Receives `extension_ui_request` payloads
pub trait UiRequestHandler: Send + Sync {
    fn forward_ui_request(&self, agent: &AgentRuntime, payload: &Value);
}

/// Result of submitting a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The prompt was written to the agent
    Started { task_id: String },
    /// The agent is busy; the task waits at `position` (1-based)
    Queued { task_id: String, position: usize },
    /// The prompt could not be written; the requester was told why
    Failed { task_id: String },
}

impl SubmitOutcome {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Started { task_id }
            | Self::Queued { task_id, .. }
            | Self::Failed { task_id } => task_id,
        }
    }
}

enum Completion {
    /// `task_id` was not the current task
    NotCurrent,
    /// Completed with nothing queued
    Idle,
    /// Completed and the next task was activated
    Next { task_id: String, prompt: String },
}

/// Drives tasks from submission to completion
pub struct TaskLifecycle {
    notifier: Notifier,
    subagents: Option<Arc<dyn SubagentReplies>>,
    ui_requests: Option<Arc<dyn UiRequestHandler>>,
    settings: LifecycleSettings,
}

impl TaskLifecycle {
    pub fn new(notifier: Notifier, settings: LifecycleSettings) -> Self {
        Self {
            notifier,
            subagents: None,
            ui_requests: None,
            settings,
        }
    }

    pub fn with_subagent_replies(mut self, subagents: Arc<dyn SubagentReplies>) -> Self {
        self.subagents = Some(subagents);
        self
    }

    pub fn with_ui_requests(mut self, handler: Arc<dyn UiRequestHandler>) -> Self {
        self.ui_requests = Some(handler);
        self
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // =========================================================================
    // Submission and completion
    // =========================================================================

    /// Start `task` on the agent, or queue it behind the current task
    pub async fn submit(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        task: Task,
    ) -> SubmitOutcome {
        let task_id = task.id.clone();
        let prompt = {
            let mut slot = agent.task_slot();
            if slot.current.is_some() {
                slot.queue.push_back(task);
                let position = slot.queue.len();
                tracing::info!(agent_id = %agent.id(), task_id = %task_id, position, "Task queued");
                return SubmitOutcome::Queued { task_id, position };
            }
            self.activate(agent, &mut slot, task)
        };

        let failed = self.write_prompt(agent, &task_id, &prompt).await;
        match failed {
            None => SubmitOutcome::Started { task_id },
            Some(next) => {
                self.run_prompts(agent, next).await;
                SubmitOutcome::Failed { task_id }
            }
        }
    }

    /// Detach `task_id` if it is still current and start the next queued task.
    ///
    /// Returns `false` when the task was not current (already completed).
    pub async fn complete_task(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        task_id: &str,
    ) -> bool {
        match self.finish_current(agent, task_id) {
            Completion::NotCurrent => false,
            Completion::Idle => true,
            Completion::Next { task_id, prompt } => {
                self.run_prompts(agent, Some((task_id, prompt))).await;
                true
            }
        }
    }

    /// Abort the agent's current task at the user's request.
    ///
    /// Returns `Ok(false)` when the agent is idle. An offline agent cannot
    /// acknowledge the abort, so its task completes immediately.
    pub async fn abort_current(self: &Arc<Self>, agent: &Arc<AgentRuntime>) -> Result<bool> {
        let Some(task_id) = agent.with_current_task(|t| {
            t.aborted = true;
            t.state = TaskState::Aborted;
            t.timers.cancel_all();
            t.id.clone()
        }) else {
            return Ok(false);
        };

        tracing::info!(agent_id = %agent.id(), task_id = %task_id, "Aborting task");

        if agent.is_offline() {
            self.complete_task(agent, &task_id).await;
            return Ok(true);
        }

        if let Err(e) = agent.write_payload(&abort_command()) {
            self.complete_task(agent, &task_id).await;
            return Err(e);
        }
        Ok(true)
    }

    /// The agent's process exited.
    ///
    /// A new process never finishes the old run, so the current task is
    /// aborted, its requester told, and the task completed. Queued tasks stay
    /// queued until `resume_queue` runs on the next process. Returns the
    /// aborted task's id.
    pub async fn on_process_exit(self: &Arc<Self>, agent: &Arc<AgentRuntime>) -> Option<String> {
        let message = format!("Agent {} stopped; task aborted.", agent.name());
        let (task_id, notice) = agent.with_current_task(|t| {
            t.aborted = true;
            t.state = TaskState::Aborted;
            t.timers.cancel_all();
            let notice = (!t.reply_sent).then(|| t.notice(&message));
            (t.id.clone(), notice)
        })?;

        tracing::warn!(agent_id = %agent.id(), task_id = %task_id, "Agent exited during task");
        if let Some(notice) = notice {
            self.notifier.notify_task_message(agent, notice, true).await;
        }

        let mut slot = agent.task_slot();
        detach_current(agent, &mut slot, &task_id);
        Some(task_id)
    }

    /// Start the next queued task if the agent is idle.
    ///
    /// Called when a fresh process is attached. Returns the started task's id.
    pub async fn resume_queue(self: &Arc<Self>, agent: &Arc<AgentRuntime>) -> Option<String> {
        let (task_id, prompt) = {
            let mut slot = agent.task_slot();
            if slot.current.is_some() {
                return None;
            }
            let task = slot.queue.pop_front()?;
            let task_id = task.id.clone();
            let prompt = self.activate(agent, &mut slot, task);
            (task_id, prompt)
        };

        tracing::info!(agent_id = %agent.id(), task_id = %task_id, "Resuming queued task");
        self.run_prompts(agent, Some((task_id.clone(), prompt))).await;
        Some(task_id)
    }

    /// Make `task` current and arm its timers; returns the prompt to write
    fn activate(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        slot: &mut TaskSlot,
        mut task: Task,
    ) -> String {
        let grace = self.settings.slash_command_grace_ms;
        if grace > 0 && is_slash_command(&task.prompt) {
            task.timers.slash_command = Some(self.spawn_slash_timer(
                agent.clone(),
                task.id.clone(),
                Duration::from_millis(grace),
            ));
        }

        let timeout = self.settings.task_timeout_ms;
        if timeout > 0 {
            task.timers.timeout = Some(self.spawn_task_timeout(
                agent.clone(),
                task.id.clone(),
                Duration::from_millis(timeout),
            ));
        }

        tracing::info!(
            agent_id = %agent.id(),
            task_id = %task.id,
            source = %task.source,
            "Task started"
        );

        let prompt = task.prompt.clone();
        slot.current = Some(task);
        prompt
    }

    fn finish_current(self: &Arc<Self>, agent: &Arc<AgentRuntime>, task_id: &str) -> Completion {
        let mut slot = agent.task_slot();
        if !detach_current(agent, &mut slot, task_id) {
            return Completion::NotCurrent;
        }

        match slot.queue.pop_front() {
            None => Completion::Idle,
            Some(next) => {
                let task_id = next.id.clone();
                let prompt = self.activate(agent, &mut slot, next);
                Completion::Next { task_id, prompt }
            }
        }
    }

    /// Write the prompt of an activated task.
    ///
    /// On failure the requester is told, the task is completed, and the next
    /// activated task (if any) is returned for the caller to start.
    async fn write_prompt(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        task_id: &str,
        prompt: &str,
    ) -> Option<Option<(String, String)>> {
        let err = match agent.write_payload(&prompt_command(prompt)) {
            Ok(()) => return None,
            Err(e) => e,
        };

        tracing::warn!(
            agent_id = %agent.id(),
            task_id = %task_id,
            error = %err,
            "Failed to send prompt"
        );

        let notice = agent.with_task(task_id, |t| t.notice(&err.to_string()));
        if let Some(delivery) = notice {
            self.notifier.notify_task_message(agent, delivery, true).await;
        }

        Some(match self.finish_current(agent, task_id) {
            Completion::Next { task_id, prompt } => Some((task_id, prompt)),
            _ => None,
        })
    }

    async fn run_prompts(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        mut next: Option<(String, String)>,
    ) {
        while let Some((task_id, prompt)) = next.take() {
            next = self.write_prompt(agent, &task_id, &prompt).await.flatten();
        }
    }

    /// Complete without awaiting; used from drop guards
    fn complete_detached(self: &Arc<Self>, agent: &Arc<AgentRuntime>, task_id: &str) {
        if let Completion::Next { task_id, prompt } = self.finish_current(agent, task_id) {
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                tracing::warn!(
                    agent_id = %agent.id(),
                    task_id = %task_id,
                    "No runtime to start queued task"
                );
                return;
            };
            let lifecycle = self.clone();
            let agent = agent.clone();
            handle.spawn(async move {
                lifecycle.run_prompts(&agent, Some((task_id, prompt))).await;
            });
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Apply one agent event payload to the agent's current task
    pub async fn handle_event(self: &Arc<Self>, agent: &Arc<AgentRuntime>, payload: &Value) {
        match AgentEvent::from_payload(payload) {
            AgentEvent::ExtensionUiRequest(request) => {
                if let Some(handler) = &self.ui_requests {
                    handler.forward_ui_request(agent, &request);
                }
            }
            AgentEvent::AgentStart => {
                agent.with_current_task(|t| {
                    t.agent_started = true;
                    if t.state == TaskState::Queued {
                        t.state = TaskState::Started;
                    }
                    t.timers.cancel_slash_command();
                });
            }
            AgentEvent::TurnEnd(event) => self.on_turn_end(agent, event, payload).await,
            AgentEvent::AgentEnd(event) => self.on_agent_end(agent, event, payload).await,
            AgentEvent::Unknown(event_type) => {
                if event_type.starts_with("message_") {
                    agent.with_current_task(|t| {
                        if t.state == TaskState::Started {
                            t.state = TaskState::Streaming;
                        }
                    });
                }
            }
        }
    }

    async fn on_turn_end(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        event: TurnEndEvent,
        payload: &Value,
    ) {
        let Some(message) = event.message.filter(|m| m.is_assistant()) else {
            return;
        };
        if message.is_tool_use() {
            return;
        }

        let Some(info) = agent
            .with_current_task(|t| t.accepts_reply().then(|| t.info()))
            .flatten()
        else {
            return;
        };

        let text = message.text();
        self.offer_subagent_reply(agent, &info, &text, payload).await;

        // The task stays current until agent_end so a trailing agent_end
        // cannot complete the next queued task.
        let delivery = agent.with_task(&info.id, |t| t.take_reply(&text)).flatten();
        if let Some(delivery) = delivery {
            tracing::debug!(
                agent_id = %agent.id(),
                task_id = %info.id,
                "Reply resolved at turn_end"
            );
            self.notifier
                .notify_task_message(agent, delivery, agent.is_offline())
                .await;
        }
    }

    async fn on_agent_end(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        event: AgentEndEvent,
        payload: &Value,
    ) {
        let reply = event.final_reply();
        let background = |origin: Option<String>| {
            (!reply.trim().is_empty()).then(|| Background {
                text: reply.clone(),
                origin,
            })
        };

        let snapshot = agent.with_current_task(|t| {
            t.timers.cancel_all();
            (t.info(), t.aborted, t.target.client_id().map(str::to_string))
        });

        match snapshot {
            None => {
                if let Some(background) = background(None) {
                    self.broadcast(agent, background);
                }
            }
            Some((info, true, _)) => {
                self.complete_task(agent, &info.id).await;
            }
            Some((info, false, origin)) => {
                self.offer_subagent_reply(agent, &info, &reply, payload).await;
                let delivery = agent.with_task(&info.id, |t| t.take_reply(&reply)).flatten();
                self.deliver_and_complete(agent, &info, delivery, background(origin))
                    .await;
            }
        }
    }

    fn broadcast(&self, agent: &AgentRuntime, background: Background) {
        self.notifier.notify_background_web_clients(
            agent,
            &background.text,
            background.origin.as_deref(),
        );
    }

    /// Deliver the final reply, complete the task, then broadcast
    async fn deliver_and_complete(
        self: &Arc<Self>,
        agent: &Arc<AgentRuntime>,
        info: &TaskInfo,
        delivery: Option<ReplyDelivery>,
        background: Option<Background>,
    ) {
        if info.source != TaskSource::IMessage {
            if let Some(delivery) = delivery {
                self.notifier
                    .notify_task_message(agent, delivery, agent.is_offline())
                    .await;
            }
            self.complete_task(agent, &info.id).await;
            if let Some(background) = background {
                self.broadcast(agent, background);
            }
            return;
        }

        // Channel delivery may be slow; it must not hold up the reader loop.
        let guard = CompletionGuard {
            lifecycle: self.clone(),
            agent: agent.clone(),
            task_id: info.id.clone(),
        };
        tokio::spawn(async move {
            let lifecycle = guard.lifecycle.clone();
            let agent = guard.agent.clone();
            if let Some(delivery) = delivery {
                lifecycle
                    .notifier
                    .notify_task_message(&agent, delivery, agent.is_offline())
                    .await;
            }
            drop(guard);
            if let Some(background) = background {
                lifecycle.broadcast(&agent, background);
            }
        });
    }

    async fn offer_subagent_reply(
        &self,
        agent: &AgentRuntime,
        info: &TaskInfo,
        text: &str,
        payload: &Value,
    ) {
        let Some(subagents) = &self.subagents else {
            return;
        };
        if text.is_empty() {
            return;
        }
        subagents
            .deliver_subagent_direct_reply(
                agent,
                info,
                SubagentReply {
                    reply_text: text.to_string(),
                    payload: Some(payload.clone()),
                },
            )
            .await;
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn spawn_slash_timer(
        self: &Arc<Self>,
        agent: Arc<AgentRuntime>,
        task_id: String,
        grace: Duration,
    ) -> tokio::task::AbortHandle {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let delivery = agent
                .with_task(&task_id, |t| {
                    // Release our own handle so completion does not abort us
                    drop(t.timers.slash_command.take());
                    if t.agent_started {
                        return None;
                    }
                    t.take_reply(SLASH_COMMAND_FALLBACK)
                })
                .flatten();

            let Some(delivery) = delivery else {
                return;
            };
            tracing::debug!(
                agent_id = %agent.id(),
                task_id = %task_id,
                "Slash command not acknowledged"
            );
            lifecycle
                .notifier
                .notify_task_message(&agent, delivery, false)
                .await;
            lifecycle.complete_task(&agent, &task_id).await;
        })
        .abort_handle()
    }

    fn spawn_task_timeout(
        self: &Arc<Self>,
        agent: Arc<AgentRuntime>,
        task_id: String,
        timeout: Duration,
    ) -> tokio::task::AbortHandle {
        let lifecycle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let message = format!(
                "Task timed out after {}s; aborting.",
                timeout.as_millis().div_ceil(1000)
            );
            let notice = agent
                .with_task(&task_id, |t| {
                    drop(t.timers.timeout.take());
                    if t.aborted {
                        return None;
                    }
                    t.aborted = true;
                    t.state = TaskState::Aborted;
                    t.timers.cancel_slash_command();
                    Some(t.notice(&message))
                })
                .flatten();

            let Some(notice) = notice else {
                return;
            };
            tracing::warn!(
                agent_id = %agent.id(),
                task_id = %task_id,
                timeout_ms = timeout.as_millis() as u64,
                "Task timed out"
            );
            lifecycle
                .notifier
                .notify_task_message(&agent, notice, true)
                .await;

            if agent.is_offline() || agent.write_payload(&abort_command()).is_err() {
                lifecycle.complete_task(&agent, &task_id).await;
            }
        })
        .abort_handle()
    }
}

/// Final reply queued for passive observers
struct Background {
    text: String,
    origin: Option<String>,
}

/// Remove `task_id` from the slot if it is current
fn detach_current(agent: &AgentRuntime, slot: &mut TaskSlot, task_id: &str) -> bool {
    if slot.current.as_ref().map(|t| t.id.as_str()) != Some(task_id) {
        return false;
    }
    if let Some(done) = slot.current.take() {
        tracing::info!(
            agent_id = %agent.id(),
            task_id = %done.id,
            reply_sent = done.reply_sent,
            aborted = done.aborted,
            elapsed_ms = (chrono::Utc::now() - done.created_at).num_milliseconds(),
            "Task completed"
        );
    }
    true
}

/// Completes a task when dropped, whether delivery finished or panicked
struct CompletionGuard {
    lifecycle: Arc<TaskLifecycle>,
    agent: Arc<AgentRuntime>,
    task_id: String,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.lifecycle.complete_detached(&self.agent, &self.task_id);
    }
}
