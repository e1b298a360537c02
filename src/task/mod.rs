//! Conversational tasks assigned to agents
//!
//! A task is one prompt submitted to one agent together with where its reply
//! must go. Each agent runs at most one task at a time; the rest wait in the
//! agent's queue.

pub mod lifecycle;

pub use lifecycle::{
    LifecycleSettings, SubagentReplies, SubagentReply, SubmitOutcome, TaskLifecycle,
    UiRequestHandler,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Where a task came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    /// Browser over WebSocket or HTTP
    Web,
    /// External iMessage channel
    #[serde(rename = "imessage")]
    IMessage,
    /// Anything else (scheduler, subagent runs, ...)
    #[serde(untagged)]
    Other(String),
}

impl TaskSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Web => "web",
            Self::IMessage => "imessage",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for TaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery handle for a task's reply.
///
/// Handles are owned by the transport layer; the task only holds a clone.
#[derive(Debug, Clone)]
pub enum ReplyTarget {
    /// A connected WebSocket client
    Socket {
        client_id: String,
        tx: mpsc::UnboundedSender<String>,
    },
    /// A conversation on the external messaging channel
    Channel { chat_id: String, sender: String },
    /// No live destination (only `on_reply`, if any)
    Detached,
}

impl ReplyTarget {
    /// Client id of a socket target, used to skip it in background broadcasts
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Self::Socket { client_id, .. } => Some(client_id),
            _ => None,
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Assigned but not yet acknowledged by the agent
    Queued,
    /// The agent emitted `agent_start`
    Started,
    /// Assistant content is arriving
    Streaming,
    /// Reply resolved
    Completed,
    /// Aborted by timeout or user
    Aborted,
}

/// Cancellable timers guarding a task
#[derive(Debug, Default)]
pub(crate) struct TaskTimers {
    pub(crate) slash_command: Option<AbortHandle>,
    pub(crate) timeout: Option<AbortHandle>,
}

impl TaskTimers {
    pub(crate) fn cancel_slash_command(&mut self) {
        if let Some(timer) = self.slash_command.take() {
            timer.abort();
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        self.cancel_slash_command();
        if let Some(timer) = self.timeout.take() {
            timer.abort();
        }
    }
}

impl Drop for TaskTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// One unit of conversational work
#[derive(Debug)]
pub struct Task {
    pub id: String,
    pub source: TaskSource,
    pub target: ReplyTarget,
    pub prompt: String,
    /// Set when the task runs on behalf of a subagent invocation
    pub subagent_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: TaskState,
    pub reply_sent: bool,
    pub aborted: bool,
    pub agent_started: bool,
    on_reply: Option<oneshot::Sender<String>>,
    pub(crate) timers: TaskTimers,
}

impl Task {
    pub fn new(source: TaskSource, target: ReplyTarget, prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            target,
            prompt: prompt.into(),
            subagent_run_id: None,
            created_at: Utc::now(),
            state: TaskState::Queued,
            reply_sent: false,
            aborted: false,
            agent_started: false,
            on_reply: None,
            timers: TaskTimers::default(),
        }
    }

    /// Receive the formatted reply through a oneshot channel
    pub fn with_on_reply(mut self, tx: oneshot::Sender<String>) -> Self {
        self.on_reply = Some(tx);
        self
    }

    pub fn with_subagent_run(mut self, run_id: impl Into<String>) -> Self {
        self.subagent_run_id = Some(run_id.into());
        self
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            source: self.source.clone(),
            subagent_run_id: self.subagent_run_id.clone(),
            prompt: self.prompt.clone(),
        }
    }

    /// Whether this task may still deliver a reply
    pub fn accepts_reply(&self) -> bool {
        !self.reply_sent && !self.aborted
    }

    /// Claim the reply for delivery.
    ///
    /// Returns `None` when a reply was already sent, the task was aborted or
    /// `text` is blank; otherwise marks the reply as sent so later callers
    /// get `None`.
    pub fn take_reply(&mut self, text: &str) -> Option<ReplyDelivery> {
        if !self.accepts_reply() || text.trim().is_empty() {
            return None;
        }
        self.reply_sent = true;
        self.state = TaskState::Completed;
        Some(self.delivery(text))
    }

    /// Delivery for a notice that does not count as the task's reply
    pub fn notice(&mut self, text: &str) -> ReplyDelivery {
        self.delivery(text)
    }

    fn delivery(&mut self, text: &str) -> ReplyDelivery {
        ReplyDelivery {
            task_id: Some(self.id.clone()),
            source: self.source.clone(),
            target: self.target.clone(),
            on_reply: self.on_reply.take(),
            text: text.to_string(),
        }
    }
}

/// Snapshot of task identity handed to collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub source: TaskSource,
    pub subagent_run_id: Option<String>,
    pub prompt: String,
}

/// A message ready to be delivered to a task's requester
#[derive(Debug)]
pub struct ReplyDelivery {
    pub task_id: Option<String>,
    pub source: TaskSource,
    pub target: ReplyTarget,
    pub on_reply: Option<oneshot::Sender<String>>,
    pub text: String,
}

impl ReplyDelivery {
    /// Delivery that is not tied to a task (switch notices and the like)
    pub fn standalone(
        source: TaskSource,
        target: ReplyTarget,
        on_reply: Option<oneshot::Sender<String>>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            task_id: None,
            source,
            target,
            on_reply,
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_reply_is_at_most_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut task = Task::new(TaskSource::Web, ReplyTarget::Detached, "hi").with_on_reply(tx);

        assert!(task.take_reply("   ").is_none());
        let delivery = task.take_reply("hello").unwrap();
        assert_eq!(delivery.text, "hello");
        assert_eq!(delivery.task_id.as_deref(), Some(task.id.as_str()));
        assert!(delivery.on_reply.is_some());
        assert!(rx.try_recv().is_err());

        assert!(task.reply_sent);
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.take_reply("again").is_none());
    }

    #[test]
    fn test_aborted_task_rejects_reply() {
        let mut task = Task::new(TaskSource::IMessage, ReplyTarget::Detached, "hi");
        task.aborted = true;
        assert!(!task.accepts_reply());
        assert!(task.take_reply("late").is_none());
    }

    #[test]
    fn test_source_serde() {
        assert_eq!(serde_json::to_string(&TaskSource::IMessage).unwrap(), "\"imessage\"");
        assert_eq!(serde_json::to_string(&TaskSource::Web).unwrap(), "\"web\"");
        let other: TaskSource = serde_json::from_str("\"cron\"").unwrap();
        assert_eq!(other, TaskSource::Other("cron".to_string()));
        assert_eq!(other.to_string(), "cron");
    }

    #[tokio::test]
    async fn test_dropping_task_cancels_timers() {
        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        let mut task = Task::new(TaskSource::Web, ReplyTarget::Detached, "hi");
        task.timers.timeout = Some(timer.abort_handle());
        drop(task);
        assert!(timer.await.unwrap_err().is_cancelled());
    }
}
