// Agent router: runs one agent subprocess per query and streams its output
//
// Frames go to the caller through an mpsc channel. Every call ends with
// exactly one `done` frame, whatever happened before it. Spawn and runtime
// failures become `error` frames; `route` itself never fails.

use super::agents::{AgentConfig, AgentRegistry, ContextInjection};
use super::protocol::DaemonResponse;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time a cancelled agent gets to exit after SIGTERM before SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(3);

/// How long to keep reading pipes held open by leftovers after the agent exits
const DRAIN_GRACE: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Environment variable carrying the context block for `mcp` injection
pub const CONTEXT_ENV: &str = "AMBIENT_CONTEXT";

/// One query as the router sees it
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub prompt: String,
    pub agent_name: String,
    /// Pre-rendered shell context; may be empty
    pub context_block: String,
    /// Append the agent's `continueArgs`
    pub continue_session: bool,
}

/// How a routed query ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    UnknownAgent,
    SpawnFailed,
    /// The agent exited on its own; `None` when killed by a signal
    Completed { exit_code: Option<i32> },
    /// Cancelled by the caller or the frame consumer went away
    Cancelled,
}

/// Wrap the prompt with the shell context block
pub fn enrich_prompt(prompt: &str, context_block: &str) -> String {
    if context_block.is_empty() {
        prompt.to_string()
    } else {
        format!("[Shell Context]\n{}\n\n[Task]\n{}", context_block, prompt)
    }
}

#[derive(Debug, Clone)]
pub struct AgentRouter {
    registry: AgentRegistry,
}

impl AgentRouter {
    pub fn new(registry: AgentRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Run `request` and stream its frames into `frames`.
    ///
    /// `cancel` stops the agent with SIGTERM (SIGKILL after a grace period).
    /// Dropping the receiving side of `frames` has the same effect.
    pub async fn route(
        &self,
        request: RouteRequest,
        frames: mpsc::Sender<DaemonResponse>,
        cancel: CancellationToken,
    ) -> RouteOutcome {
        let outcome = self.run(&request, &frames, cancel.child_token()).await;
        debug!(agent = %request.agent_name, ?outcome, "route finished");
        let _ = frames.send(DaemonResponse::done("")).await;
        outcome
    }

    async fn run(
        &self,
        request: &RouteRequest,
        frames: &mpsc::Sender<DaemonResponse>,
        cancel: CancellationToken,
    ) -> RouteOutcome {
        let Some(agent) = self.registry.get(&request.agent_name) else {
            let message = format!(
                "Unknown agent \"{}\". Available agents: {}",
                request.agent_name,
                self.registry.names().join(", ")
            );
            warn!(agent = %request.agent_name, "unknown agent requested");
            let _ = frames.send(DaemonResponse::error(message)).await;
            return RouteOutcome::UnknownAgent;
        };

        let (mut command, stdin_prompt) = build_command(&agent, request);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(agent = %agent.name, command = %agent.command, error = %err, "agent spawn failed");
                let message = format!(
                    "Failed to start agent \"{}\" (command: {}): {}",
                    agent.name, agent.command, err
                );
                let _ = frames.send(DaemonResponse::error(message)).await;
                return RouteOutcome::SpawnFailed;
            }
        };

        let mut terminator = ChildTerminator::new(child.id());
        info!(agent = %agent.name, pid = ?child.id(), "agent started");

        if let (Some(prompt), Some(mut stdin)) = (stdin_prompt, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %err, "agent closed stdin early");
                }
                // stdin is dropped (closed) here
            });
        }

        let (status, cancelled) = stream_child(&mut child, &mut terminator, frames, &cancel).await;

        if cancelled {
            info!(agent = %agent.name, "agent cancelled");
            return RouteOutcome::Cancelled;
        }

        match status {
            Ok(status) => {
                let exit_code = status.code();
                if let Some(code) = exit_code.filter(|code| *code != 0) {
                    let message = format!("Agent \"{}\" exited with code {}", agent.name, code);
                    let _ = frames.send(DaemonResponse::error(message)).await;
                }
                info!(agent = %agent.name, ?exit_code, "agent exited");
                RouteOutcome::Completed { exit_code }
            }
            Err(err) => {
                let message = format!("Failed waiting for agent \"{}\": {}", agent.name, err);
                let _ = frames.send(DaemonResponse::error(message)).await;
                RouteOutcome::Completed { exit_code: None }
            }
        }
    }
}

/// Build the subprocess command. Returns the prompt to feed on stdin, if any.
fn build_command(agent: &AgentConfig, request: &RouteRequest) -> (Command, Option<String>) {
    let mut command = Command::new(&agent.command);
    command.args(&agent.args);
    if request.continue_session {
        if let Some(extra) = &agent.continue_args {
            command.args(extra);
        }
    }

    let enriched = enrich_prompt(&request.prompt, &request.context_block);
    let stdin_prompt = match agent.context_injection {
        ContextInjection::PromptPrefix => {
            command.arg(enriched).stdin(Stdio::null());
            None
        }
        ContextInjection::Stdin => {
            command.stdin(Stdio::piped());
            Some(enriched)
        }
        ContextInjection::Mcp => {
            command
                .arg(&request.prompt)
                .env(CONTEXT_ENV, &request.context_block)
                .stdin(Stdio::null());
            None
        }
    };

    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so termination reaches the agent's children too
    #[cfg(unix)]
    command.process_group(0);

    (command, stdin_prompt)
}

/// Pump stdout/stderr into `chunk` frames until the child exits and its pipes close.
///
/// Returns the exit status and whether the run was cancelled.
async fn stream_child(
    child: &mut Child,
    terminator: &mut ChildTerminator,
    frames: &mpsc::Sender<DaemonResponse>,
    cancel: &CancellationToken,
) -> (std::io::Result<ExitStatus>, bool) {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_open = stdout.is_some();
    let mut err_open = stderr.is_some();
    let mut out_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut err_buf = vec![0u8; READ_BUFFER_SIZE];
    let mut out_text = Utf8Chunker::default();
    let mut err_text = Utf8Chunker::default();

    let mut status: Option<std::io::Result<ExitStatus>> = None;
    let mut cancelled = false;
    let mut kill_at: Option<Instant> = None;
    let mut drain_until: Option<Instant> = None;
    let far_future = Instant::now() + Duration::from_secs(60 * 60 * 24 * 365);

    loop {
        if status.is_some() && !out_open && !err_open {
            break;
        }

        tokio::select! {
            read = read_pipe(&mut stdout, &mut out_buf), if out_open => {
                let text = match read {
                    Some(n) => out_text.push(&out_buf[..n]),
                    None => {
                        out_open = false;
                        out_text.finish()
                    }
                };
                if !send_chunk(frames, text).await {
                    cancel.cancel();
                }
            }
            read = read_pipe(&mut stderr, &mut err_buf), if err_open => {
                let text = match read {
                    Some(n) => err_text.push(&err_buf[..n]),
                    None => {
                        err_open = false;
                        err_text.finish()
                    }
                };
                if !send_chunk(frames, text).await {
                    cancel.cancel();
                }
            }
            exit = child.wait(), if status.is_none() => {
                terminator.release();
                if out_open || err_open {
                    drain_until = Some(Instant::now() + DRAIN_GRACE);
                }
                status = Some(exit);
            }
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                if terminator.terminate() {
                    kill_at = Some(Instant::now() + KILL_GRACE);
                }
            }
            _ = tokio::time::sleep_until(kill_at.unwrap_or(far_future)), if kill_at.is_some() => {
                kill_at = None;
                terminator.kill();
            }
            _ = tokio::time::sleep_until(drain_until.unwrap_or(far_future)), if drain_until.is_some() => {
                drain_until = None;
                out_open = false;
                err_open = false;
            }
        }
    }

    let status = status.unwrap_or_else(|| {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "agent status unavailable",
        ))
    });
    (status, cancelled)
}

/// Read once from an optional pipe. `None` means EOF or a read error.
async fn read_pipe<R: AsyncReadExt + Unpin>(pipe: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    let reader = pipe.as_mut()?;
    match reader.read(buf).await {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(err) => {
            debug!(error = %err, "agent pipe read failed");
            None
        }
    }
}

/// Returns false once the frame consumer is gone
async fn send_chunk(frames: &mpsc::Sender<DaemonResponse>, text: String) -> bool {
    if text.is_empty() {
        return !frames.is_closed();
    }
    frames.send(DaemonResponse::chunk(text)).await.is_ok()
}

/// Single-fire termination handle for one agent process (group).
///
/// Created when the agent starts and released when it exits; signals sent
/// after release, or a second SIGTERM, are no-ops.
#[derive(Debug)]
pub struct ChildTerminator {
    pid: Option<u32>,
    signalled: bool,
}

impl ChildTerminator {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            signalled: false,
        }
    }

    /// Send SIGTERM once. Returns true if a signal was sent.
    pub fn terminate(&mut self) -> bool {
        if self.signalled {
            return false;
        }
        let Some(pid) = self.pid else {
            return false;
        };
        self.signalled = true;
        signal_group(pid, Signal::Terminate)
    }

    /// Force-kill the agent if it is still running
    pub fn kill(&mut self) {
        if let Some(pid) = self.pid {
            signal_group(pid, Signal::Kill);
        }
    }

    /// The agent has exited; further signals would hit a reused PID
    pub fn release(&mut self) {
        self.pid = None;
    }

    pub fn is_released(&self) -> bool {
        self.pid.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let signal = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative PID addresses the process group created at spawn
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        // Group may be gone already; fall back to the leader itself
        return unsafe { libc::kill(pid, signal) } == 0;
    }
    true
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) -> bool {
    false
}

/// Incremental UTF-8 decoding that holds back a trailing partial character
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_string();
                self.pending.clear();
                text
            }
            Err(err) if err.error_len().is_none() => {
                // Incomplete sequence at the end; emit the valid prefix
                let valid = err.valid_up_to();
                let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                text
            }
            Err(_) => self.finish(),
        }
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
