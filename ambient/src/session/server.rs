// Daemon server: accepts connections and answers one request per connection
//
// Queries are handed to the agent router; its frames are forwarded to the
// client until the first terminal frame. A client that disconnects mid-query
// cancels the agent.

use super::agents::AgentConfig;
use super::config::Config;
use super::context::ShellContext;
use super::protocol::{
    serialize_message, ContextUpdatePayload, DaemonRequest, DaemonResponse, FrameDecoder,
    FrameError, NewSessionPayload, QueryPayload, MAX_REQUEST_FRAME_SIZE,
};
use super::router::{AgentRouter, RouteRequest};
use super::settings::Settings;
use super::state::{SessionState, SessionStore};
use anyhow::{Context, Result};
use serde::Serialize;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames buffered between the router and a connection
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Time a client gets to send its request after connecting
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Time in-flight connections get to wind down on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How often a client that stopped sending is checked for a hang-up
const HANGUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Reply to a `status` request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub pid: u32,
    pub uptime_secs: u64,
    pub in_flight: usize,
    pub default_agent: String,
    pub socket_path: String,
    pub session: Option<SessionState>,
}

/// One entry of the reply to an `agents` request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub name: String,
    pub command: String,
    pub default: bool,
}

impl AgentSummary {
    fn new(agent: &AgentConfig, default_agent: &str) -> Self {
        Self {
            name: agent.name.clone(),
            command: agent.command.clone(),
            default: agent.name == default_agent,
        }
    }
}

/// Daemon state shared across all client connections
pub struct DaemonServer {
    config: Config,
    settings: Settings,
    router: AgentRouter,
    sessions: SessionStore,
    context: Mutex<ShellContext>,
    shutdown: CancellationToken,
    started_at: Instant,
    in_flight: AtomicUsize,
}

impl DaemonServer {
    pub fn new(config: Config, settings: Settings) -> Self {
        let router = AgentRouter::new(settings.registry());
        let context = ShellContext::new(settings.max_recent_commands, settings.privacy.clone());
        Self {
            config,
            router,
            sessions: SessionStore::new(),
            context: Mutex::new(context),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            in_flight: AtomicUsize::new(0),
            settings,
        }
    }

    /// Cancelled when the daemon should stop; cancelling it stops `serve`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Number of queries currently running an agent
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Accept connections until the shutdown token fires
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let server = Arc::clone(&self);
                            connections.spawn(async move {
                                if let Err(e) = server.handle_client(stream).await {
                                    warn!(error = %format!("{:#}", e), "client error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept error");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = self.shutdown.cancelled() => {
                    info!("shutting down listener");
                    break;
                }
            }
        }

        // In-flight queries hold child tokens of `shutdown`, so their agents are already stopping
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("connections still open after shutdown grace; aborting");
            connections.abort_all();
        }
        Ok(())
    }

    /// Handle a single client connection
    pub async fn handle_client(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let request = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request(&mut reader)).await {
            Ok(Ok(Some(request))) => request,
            // Client left before sending anything
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                let response = DaemonResponse::error(format!("Invalid request: {}", e));
                write_frame(&mut writer, &response).await?;
                return Ok(());
            }
            Err(_) => {
                let response = DaemonResponse::error("Timed out waiting for request");
                write_frame(&mut writer, &response).await?;
                return Ok(());
            }
        };

        debug!(kind = request.kind(), "request received");

        match request {
            DaemonRequest::Query(payload) => self.handle_query(payload, reader, &mut writer).await?,
            DaemonRequest::Shutdown => {
                write_frame(&mut writer, &DaemonResponse::done("shutting down")).await?;
                info!("shutdown requested by client");
                self.shutdown.cancel();
            }
            other => {
                let response = self.handle_request(other).await;
                write_frame(&mut writer, &response).await?;
            }
        }

        writer.shutdown().await.ok();
        Ok(())
    }

    /// Answer requests that do not involve an agent
    async fn handle_request(&self, request: DaemonRequest) -> DaemonResponse {
        match request {
            DaemonRequest::Ping => DaemonResponse::done("pong"),
            DaemonRequest::Status => to_json_frame(&self.status_report().await),
            DaemonRequest::Agents => {
                let default_agent = &self.settings.default_agent;
                let agents: Vec<_> = self
                    .router
                    .registry()
                    .iter()
                    .map(|agent| AgentSummary::new(agent, default_agent))
                    .collect();
                to_json_frame(&agents)
            }
            DaemonRequest::NewSession(NewSessionPayload { cwd }) => {
                let session = self.sessions.replace(&self.settings.default_agent, cwd).await;
                info!(agent = %session.agent_name, "new session");
                DaemonResponse::done(format!("New session started with {}", session.agent_name))
            }
            DaemonRequest::ContextUpdate(update) => {
                self.apply_context(update).await;
                DaemonResponse::done("")
            }
            DaemonRequest::Query(_) | DaemonRequest::Shutdown => {
                DaemonResponse::error("request must be handled by the connection loop")
            }
        }
    }

    async fn apply_context(&self, update: ContextUpdatePayload) {
        self.context.lock().await.apply(update);
    }

    pub async fn status_report(&self) -> StatusReport {
        StatusReport {
            pid: std::process::id(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            in_flight: self.in_flight(),
            default_agent: self.settings.default_agent.clone(),
            socket_path: self.config.socket_path.display().to_string(),
            session: self.sessions.snapshot().await,
        }
    }

    /// Run a query and forward its frames until the first terminal frame
    async fn handle_query(
        &self,
        payload: QueryPayload,
        mut reader: OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        let prompt = with_pipe_input(&payload.prompt, payload.pipe_input.as_deref());
        let context_block = self.context.lock().await.format_block();

        // An unknown agent fails this request only; the session is left as it was
        let (request, ticket) = match payload.agent.as_deref() {
            Some(name) if self.router.registry().get(name).is_none() => {
                debug!(agent = %name, "query for unknown agent");
                let request = RouteRequest {
                    prompt,
                    agent_name: name.to_string(),
                    context_block,
                    continue_session: false,
                };
                (request, None)
            }
            requested => {
                if payload.new_session == Some(true) {
                    let agent = requested.unwrap_or(&self.settings.default_agent);
                    self.sessions.replace(agent, Some(payload.cwd.clone())).await;
                }
                let ticket = self
                    .sessions
                    .begin_query(requested, &self.settings.default_agent, &payload.cwd)
                    .await;
                let request = RouteRequest {
                    prompt,
                    agent_name: ticket.agent_name.clone(),
                    context_block,
                    continue_session: ticket.continues,
                };
                (request, Some(ticket))
            }
        };
        info!(agent = %request.agent_name, continues = request.continue_session, "query started");

        let (tx, mut rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let cancel = self.shutdown.child_token();
        // Dropping this connection (e.g. on a write error) stops the agent
        let _cancel_on_exit = cancel.clone().drop_guard();

        let route = {
            let router = self.router.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { router.route(request, tx, cancel).await })
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let mut output = String::new();
        let mut terminal_sent = false;
        let mut client_open = true;
        // Cleared once the client has finished sending (EOF on our read side)
        let mut client_sending = true;
        let mut hangup_check = tokio::time::interval(HANGUP_POLL_INTERVAL);
        hangup_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discard = [0u8; 256];

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let DaemonResponse::Chunk { data } = &frame {
                        output.push_str(data);
                    }
                    if terminal_sent || !client_open {
                        continue;
                    }
                    if let Err(e) = write_frame(writer, &frame).await {
                        debug!(error = %e, "client went away mid-stream");
                        client_open = false;
                        cancel.cancel();
                        continue;
                    }
                    terminal_sent = frame.is_terminal();
                }
                read = reader.read(&mut discard), if client_open && client_sending && !terminal_sent => {
                    match read {
                        Ok(0) => {
                            // Half-close and full close both read as EOF; only a hang-up cancels
                            client_sending = false;
                            if peer_hung_up(writer) {
                                debug!("client disconnected; cancelling agent");
                                client_open = false;
                                cancel.cancel();
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "client connection failed; cancelling agent");
                            client_open = false;
                            cancel.cancel();
                        }
                    }
                }
                _ = hangup_check.tick(), if client_open && !client_sending && !terminal_sent => {
                    if peer_hung_up(writer) {
                        debug!("client disconnected; cancelling agent");
                        client_open = false;
                        cancel.cancel();
                    }
                }
            }
        }

        match route.await {
            Ok(outcome) => debug!(?outcome, "query finished"),
            Err(e) => warn!(error = %e, "router task failed"),
        }
        if let Some(ticket) = ticket {
            if !self.sessions.complete_query(&ticket, output).await {
                debug!("session replaced while the query ran; result not recorded");
            }
        }
        // Counted until the session is updated
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// True once the peer has closed both directions of the connection.
///
/// A client that only shut down its write side is still reading and does not
/// count as gone.
fn peer_hung_up(writer: &OwnedWriteHalf) -> bool {
    let stream: &UnixStream = writer.as_ref();
    let mut fd = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: 0,
        revents: 0,
    };
    let ready = unsafe { libc::poll(&mut fd, 1, 0) };
    ready > 0 && fd.revents & (libc::POLLHUP | libc::POLLERR) != 0
}

/// Append piped stdin to the prompt
fn with_pipe_input(prompt: &str, pipe_input: Option<&str>) -> String {
    match pipe_input {
        Some(input) if !input.trim().is_empty() => format!("{}\n\n[Input]\n{}", prompt, input),
        _ => prompt.to_string(),
    }
}

fn to_json_frame<T: Serialize>(value: &T) -> DaemonResponse {
    match serde_json::to_string(value) {
        Ok(json) => DaemonResponse::done(json),
        Err(e) => DaemonResponse::error(format!("Failed to encode response: {}", e)),
    }
}

/// Read the single request frame of a connection. `None` if the client hung up first.
async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<DaemonRequest>, FrameError> {
    let mut decoder = FrameDecoder::new(MAX_REQUEST_FRAME_SIZE);
    let mut buf = [0u8; 4096];
    loop {
        if let Some(request) = decoder.next_frame::<DaemonRequest>()? {
            return Ok(Some(request));
        }
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return Ok(None),
            Ok(n) => decoder.push(&buf[..n]),
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &DaemonResponse) -> Result<()> {
    let bytes = serialize_message(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Bind the daemon socket with owner-only permissions
pub fn bind_socket(config: &Config) -> Result<UnixListener> {
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to bind socket: {}", config.socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!(
                    "Failed to set socket permissions: {}",
                    config.socket_path.display()
                )
            })?;
    }

    Ok(listener)
}
