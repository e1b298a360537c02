//! Agent process lifecycle management
//!
//! Each agent gets one supervisor task: spawn the configured command with
//! piped stdio, pump its stdout through the gateway, and relaunch it with
//! exponential backoff when it exits. While no process is attached the agent
//! is offline and every pending request has been rejected.

use crate::agent::decoder::{pump_lines, LineHandler};
use crate::agent::runtime::{AgentProcess, AgentRuntime};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, Command};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// First relaunch delay
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// Relaunch delay ceiling; a process that stays up this long resets the backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// How long to wait for stdout to drain after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Callbacks from the supervisor into the gateway
#[async_trait]
pub trait ProcessEvents: LineHandler {
    /// A fresh process was attached to `agent`
    async fn on_spawned(&self, _agent: &Arc<AgentRuntime>) {}

    /// `agent`'s process exited; it is already detached and its pending
    /// requests rejected
    async fn on_exited(&self, _agent: &Arc<AgentRuntime>) {}
}

/// Handle to a spawned agent process
struct ChildProcess {
    agent_id: String,
    pid: Option<u32>,
    stdin_tx: mpsc::UnboundedSender<String>,
    kill: Arc<Notify>,
}

#[async_trait]
impl AgentProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write_line(&self, line: String) -> Result<()> {
        self.stdin_tx
            .send(line)
            .map_err(|_| Error::AgentOffline(self.agent_id.clone()))
    }

    async fn terminate(&self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SIGTERM lets the agent flush its session before exiting
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            return Ok(());
        }

        self.kill.notify_one();
        Ok(())
    }
}

/// Next relaunch delay after `current`
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Spawns and supervises agent processes
pub struct AgentLauncher<E: ProcessEvents + 'static> {
    events: Arc<E>,
    shutdown: CancellationToken,
}

impl<E: ProcessEvents + 'static> AgentLauncher<E> {
    pub fn new(events: Arc<E>, shutdown: CancellationToken) -> Self {
        Self { events, shutdown }
    }

    /// Start a supervisor task for every agent
    pub fn spawn_all(&self, agents: &[Arc<AgentRuntime>]) -> Vec<tokio::task::JoinHandle<()>> {
        agents.iter().map(|agent| self.spawn_supervisor(agent.clone())).collect()
    }

    /// Keep `agent`'s process running until shutdown
    pub fn spawn_supervisor(&self, agent: Arc<AgentRuntime>) -> tokio::task::JoinHandle<()> {
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                if shutdown.is_cancelled() {
                    break;
                }

                let started = Instant::now();
                match run_once(&agent, &events, &shutdown).await {
                    Ok(status) => tracing::warn!(
                        agent_id = %agent.id(),
                        status = %status,
                        uptime_ms = started.elapsed().as_millis() as u64,
                        "Agent process exited"
                    ),
                    Err(e) => tracing::error!(
                        agent_id = %agent.id(),
                        error = %e,
                        "Failed to run agent process"
                    ),
                }

                if shutdown.is_cancelled() {
                    break;
                }
                if started.elapsed() >= MAX_BACKOFF {
                    backoff = INITIAL_BACKOFF;
                }

                tracing::info!(
                    agent_id = %agent.id(),
                    delay_ms = backoff.as_millis() as u64,
                    "Relaunching agent process"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = next_backoff(backoff);
            }
            tracing::debug!(agent_id = %agent.id(), "Agent supervisor stopped");
        })
    }
}

/// Spawn the agent's command once and wait for it to exit
async fn run_once<E: ProcessEvents + 'static>(
    agent: &Arc<AgentRuntime>,
    events: &Arc<E>,
    shutdown: &CancellationToken,
) -> Result<ExitStatus> {
    let config = agent.config();

    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }

    tracing::info!(
        agent_id = %agent.id(),
        command = %config.command,
        args = ?config.args,
        "Spawning agent process"
    );

    let mut child = command.spawn().map_err(|e| {
        Error::Agent(format!("Failed to spawn '{}': {}", config.command, e))
    })?;

    let missing = |pipe: &str| Error::Internal(format!("agent {} has no {}", agent.id(), pipe));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    let kill = Arc::new(Notify::new());
    let process = Arc::new(ChildProcess {
        agent_id: agent.id().to_string(),
        pid: child.id(),
        stdin_tx,
        kill: kill.clone(),
    });

    let writer = tokio::spawn(write_stdin(agent.id().to_string(), stdin, stdin_rx));
    let reader = tokio::spawn(pump_lines(stdout, agent.clone(), events.clone()));
    let stderr_logger = tokio::spawn(log_stderr(agent.id().to_string(), stderr));

    agent.attach_process(process);
    {
        let events = events.clone();
        let agent = agent.clone();
        tokio::spawn(async move { events.on_spawned(&agent).await });
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.notified() => {
            let _ = child.start_kill();
            child.wait().await
        }
        _ = shutdown.cancelled() => {
            tracing::info!(agent_id = %agent.id(), "Stopping agent process");
            let _ = child.start_kill();
            child.wait().await
        }
    };

    agent.detach_process();
    agent.fail_all_pending("agent process exited");
    events.on_exited(agent).await;

    if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
        tracing::debug!(agent_id = %agent.id(), "Agent stdout did not close after exit");
    }
    writer.abort();
    stderr_logger.abort();

    Ok(status?)
}

async fn write_stdin(
    agent_id: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::warn!(agent_id = %agent_id, error = %e, "Failed to write to agent stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::warn!(agent_id = %agent_id, error = %e, "Failed to flush agent stdin");
            break;
        }
    }
}

async fn log_stderr(agent_id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(agent_id = %agent_id, "stderr: {}", line);
    }
}
