//! Per-agent runtime state
//!
//! An `AgentRuntime` owns everything that belongs to one configured agent:
//! its process handle, the table of in-flight requests and the task slot.
//! Nothing here is shared across agents.

use crate::config::{AgentConfig, ReplyPrefixMode};
use crate::error::{Error, Result};
use crate::task::Task;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// Handle to a running agent process.
///
/// Writes are line-oriented and non-blocking; the implementation owns any
/// buffering between the gateway and the process's stdin.
#[async_trait]
pub trait AgentProcess: Send + Sync {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    /// Queue one line (without trailing newline) for the process's stdin
    fn write_line(&self, line: String) -> Result<()>;

    /// Ask the process to terminate; a supervisor is expected to restart it
    async fn terminate(&self) -> Result<()>;
}

/// Display projection of an agent, captured at registration
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentListEntry {
    pub id: String,
    pub name: String,
    pub keywords: Vec<String>,
    pub pid: Option<u32>,
}

/// Correlation record for one outbound request
pub(crate) struct PendingRequest {
    pub(crate) command: String,
    pub(crate) tx: oneshot::Sender<Result<Value>>,
    pub(crate) timer: Option<AbortHandle>,
}

impl PendingRequest {
    /// Settle the request, cancelling its timer
    pub(crate) fn settle(self, outcome: Result<Value>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // Receiver may have been dropped by a cancelled caller
        let _ = self.tx.send(outcome);
    }
}

/// The current task plus tasks waiting for the agent to become free
#[derive(Default)]
pub struct TaskSlot {
    pub current: Option<Task>,
    pub queue: VecDeque<Task>,
}

/// One configured, possibly running agent
pub struct AgentRuntime {
    config: AgentConfig,
    name: String,
    reply_prefix_mode: ReplyPrefixMode,
    process: RwLock<Option<Arc<dyn AgentProcess>>>,
    offline: AtomicBool,
    request_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
    tasks: Mutex<TaskSlot>,
    current_session_file: RwLock<Option<String>>,
    list_entry: OnceLock<AgentListEntry>,
}

impl AgentRuntime {
    /// Create a runtime from a validated configuration.
    ///
    /// The agent starts offline until a process is attached.
    pub fn new(config: AgentConfig, reply_prefix_mode: ReplyPrefixMode) -> Self {
        let name = config.display_name().to_string();
        Self {
            config,
            name,
            reply_prefix_mode,
            process: RwLock::new(None),
            offline: AtomicBool::new(true),
            request_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            tasks: Mutex::new(TaskSlot::default()),
            current_session_file: RwLock::new(None),
            list_entry: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keywords(&self) -> &[String] {
        &self.config.keywords
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn reply_prefix_mode(&self) -> ReplyPrefixMode {
        self.reply_prefix_mode
    }

    // =========================================================================
    // Process handle
    // =========================================================================

    /// Attach a live process and mark the agent online
    pub fn attach_process(&self, process: Arc<dyn AgentProcess>) {
        *self.process.write().unwrap_or_else(|e| e.into_inner()) = Some(process);
        self.offline.store(false, Ordering::SeqCst);
        tracing::info!(agent_id = %self.id(), "Agent process attached");
    }

    /// Drop the process handle and mark the agent offline
    pub fn detach_process(&self) {
        self.offline.store(true, Ordering::SeqCst);
        *self.process.write().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::info!(agent_id = %self.id(), "Agent process detached");
    }

    pub fn process(&self) -> Option<Arc<dyn AgentProcess>> {
        self.process
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process().and_then(|p| p.pid())
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Serialize a payload and write it to the process as one line
    pub fn write_payload(&self, payload: &Value) -> Result<()> {
        let process = self
            .process()
            .filter(|_| !self.is_offline())
            .ok_or_else(|| Error::AgentOffline(self.id().to_string()))?;
        process.write_line(serde_json::to_string(payload)?)
    }

    // =========================================================================
    // Request correlation table
    // =========================================================================

    /// Allocate the next request id (`"{agentId}-{n}"`)
    pub fn next_request_id(&self) -> String {
        let n = self.request_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.id(), n)
    }

    pub(crate) fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove a pending entry; whoever removes it settles it
    pub(crate) fn take_pending(&self, id: &str) -> Option<PendingRequest> {
        self.pending().remove(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Reject every in-flight request, e.g. when the process exits
    pub fn fail_all_pending(&self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = self.pending().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for request in drained {
            let command = request.command.clone();
            request.settle(Err(Error::Agent(format!("{} ({})", reason, command))));
        }
        if count > 0 {
            tracing::warn!(agent_id = %self.id(), count, reason, "Rejected pending requests");
        }
        count
    }

    // =========================================================================
    // Task slot
    // =========================================================================

    pub(crate) fn task_slot(&self) -> MutexGuard<'_, TaskSlot> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the current task, if any
    pub fn with_current_task<R>(&self, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.task_slot().current.as_mut().map(f)
    }

    /// Run `f` against the current task only if it is still `task_id`
    pub fn with_task<R>(&self, task_id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        self.task_slot()
            .current
            .as_mut()
            .filter(|t| t.id == task_id)
            .map(f)
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.task_slot().current.as_ref().map(|t| t.id.clone())
    }

    pub fn queued_tasks(&self) -> usize {
        self.task_slot().queue.len()
    }

    // =========================================================================
    // Session file and display entry
    // =========================================================================

    pub fn current_session_file(&self) -> Option<String> {
        self.current_session_file
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_current_session_file(&self, path: &str) {
        *self
            .current_session_file
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(path.to_string());
    }

    /// Capture the display entry; only the first call has an effect
    pub(crate) fn attach_list_entry(&self) -> &AgentListEntry {
        self.list_entry.get_or_init(|| AgentListEntry {
            id: self.id().to_string(),
            name: self.name.clone(),
            keywords: self.config.keywords.clone(),
            pid: self.pid(),
        })
    }

    pub fn list_entry(&self) -> Option<&AgentListEntry> {
        self.list_entry.get()
    }
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("offline", &self.is_offline())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Process handle that records written lines
    #[derive(Default)]
    pub struct RecordingProcess {
        pub lines: Mutex<Vec<String>>,
        pub terminated: AtomicU64,
        pub fail_terminate: bool,
    }

    impl RecordingProcess {
        pub fn written(&self) -> Vec<Value> {
            self.lines
                .lock()
                .unwrap()
                .iter()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl AgentProcess for RecordingProcess {
        fn pid(&self) -> Option<u32> {
            Some(4242)
        }

        fn write_line(&self, line: String) -> Result<()> {
            self.lines.lock().unwrap().push(line);
            Ok(())
        }

        async fn terminate(&self) -> Result<()> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            if self.fail_terminate {
                return Err(Error::Agent("kill failed".to_string()));
            }
            Ok(())
        }
    }

    /// Online agent backed by a recording process
    pub fn online_agent(config: AgentConfig) -> (Arc<AgentRuntime>, Arc<RecordingProcess>) {
        let agent = Arc::new(AgentRuntime::new(config, ReplyPrefixMode::Always));
        let process = Arc::new(RecordingProcess::default());
        agent.attach_process(process.clone());
        (agent, process)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_new_agent_is_offline() {
        let agent = AgentRuntime::new(AgentConfig::new("nova"), ReplyPrefixMode::Always);
        assert!(agent.is_offline());
        assert!(agent.process().is_none());
        let err = agent.write_payload(&serde_json::json!({"type": "prompt"})).unwrap_err();
        assert!(matches!(err, Error::AgentOffline(id) if id == "nova"));
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let agent = AgentRuntime::new(AgentConfig::new("nova"), ReplyPrefixMode::Always);
        assert_eq!(agent.next_request_id(), "nova-1");
        assert_eq!(agent.next_request_id(), "nova-2");
    }

    #[test]
    fn test_attach_and_detach() {
        let (agent, process) = online_agent(AgentConfig::new("nova"));
        assert!(!agent.is_offline());
        assert_eq!(agent.pid(), Some(4242));

        agent.write_payload(&serde_json::json!({"type": "abort"})).unwrap();
        assert_eq!(process.written()[0]["type"], "abort");

        agent.detach_process();
        assert!(agent.is_offline());
        assert!(agent.pid().is_none());
    }

    #[tokio::test]
    async fn test_fail_all_pending() {
        let agent = AgentRuntime::new(AgentConfig::new("nova"), ReplyPrefixMode::Always);
        let (tx, rx) = oneshot::channel();
        agent.pending().insert(
            "nova-1".to_string(),
            PendingRequest {
                command: "get_state".to_string(),
                tx,
                timer: None,
            },
        );
        assert_eq!(agent.fail_all_pending("process exited"), 1);
        assert_eq!(agent.pending_count(), 0);
        assert!(rx.await.unwrap().is_err());
    }

    #[test]
    fn test_list_entry_captured_once() {
        let (agent, _process) =
            online_agent(AgentConfig::new("nova").with_name("Nova").with_keywords(["nova"]));
        assert!(agent.list_entry().is_none());
        let entry = agent.attach_list_entry().clone();
        assert_eq!(entry.pid, Some(4242));

        agent.detach_process();
        assert_eq!(agent.attach_list_entry(), &entry);
        assert_eq!(agent.list_entry().unwrap().name, "Nova");
    }
}
