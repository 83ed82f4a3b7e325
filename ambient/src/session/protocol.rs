// Session protocol - shared structs for daemon <-> CLI communication
// Uses newline-delimited JSON frames over Unix sockets, one request per connection

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum size of a request frame (1MB)
pub const MAX_REQUEST_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum size of a response frame (10MB)
pub const MAX_RESPONSE_FRAME_SIZE: usize = 10 * 1024 * 1024;

// ============================================================================
// Client -> Daemon requests
// ============================================================================

/// Shell hook that produced a context update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellEvent {
    /// About to run a command
    Preexec,
    /// Command finished, prompt about to be drawn
    Precmd,
    /// Working directory changed
    Chpwd,
}

impl std::str::FromStr for ShellEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preexec" => Ok(ShellEvent::Preexec),
            "precmd" => Ok(ShellEvent::Precmd),
            "chpwd" => Ok(ShellEvent::Chpwd),
            _ => Err(format!("Unknown shell event: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    pub prompt: String,
    /// Agent to use (defaults to the session's agent, then `defaultAgent`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Data piped into the CLI on stdin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_input: Option<String>,
    pub cwd: String,
    /// Start a fresh session before running the query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdatePayload {
    pub event: ShellEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_dirty: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Request message from CLI to daemon
///
/// Serialized as `{"type": "...", "payload": {...}}`. Payload-less kinds
/// accept a missing, null or empty payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    try_from = "RequestFrame"
)]
pub enum DaemonRequest {
    /// Ask an agent something
    Query(QueryPayload),
    /// Shell hook event feeding the ambient context
    ContextUpdate(ContextUpdatePayload),
    /// Replace the current session
    NewSession(NewSessionPayload),
    /// Check the daemon is alive
    Ping,
    /// Request daemon to shut down gracefully
    Shutdown,
    /// Daemon and session summary
    Status,
    /// List configured agents
    Agents,
}

impl DaemonRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            DaemonRequest::Query(_) => "query",
            DaemonRequest::ContextUpdate(_) => "context-update",
            DaemonRequest::NewSession(_) => "new-session",
            DaemonRequest::Ping => "ping",
            DaemonRequest::Shutdown => "shutdown",
            DaemonRequest::Status => "status",
            DaemonRequest::Agents => "agents",
        }
    }
}

/// Loose wire shape used to decode requests
#[derive(Debug, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// Why a request frame could not be turned into a `DaemonRequest`
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unknown request type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TryFrom<RequestFrame> for DaemonRequest {
    type Error = RequestError;

    fn try_from(frame: RequestFrame) -> Result<Self, Self::Error> {
        fn payload<T: for<'de> Deserialize<'de>>(
            kind: &str,
            value: Value,
        ) -> Result<T, RequestError> {
            serde_json::from_value(value).map_err(|source| RequestError::InvalidPayload {
                kind: kind.to_string(),
                source,
            })
        }

        let RequestFrame { kind, payload: body } = frame;
        match kind.as_str() {
            "query" => Ok(DaemonRequest::Query(payload(&kind, body)?)),
            "context-update" => Ok(DaemonRequest::ContextUpdate(payload(&kind, body)?)),
            "new-session" => {
                let body = if body.is_null() {
                    Value::Object(Default::default())
                } else {
                    body
                };
                Ok(DaemonRequest::NewSession(payload(&kind, body)?))
            }
            "ping" => Ok(DaemonRequest::Ping),
            "shutdown" => Ok(DaemonRequest::Shutdown),
            "status" => Ok(DaemonRequest::Status),
            "agents" => Ok(DaemonRequest::Agents),
            _ => Err(RequestError::UnknownType(kind)),
        }
    }
}

// ============================================================================
// Daemon -> Client responses
// ============================================================================

/// Response frame from daemon to CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    /// Progress text, concatenated into the result like a chunk
    Status { data: String },
    /// A piece of agent output
    Chunk { data: String },
    /// Terminal failure
    Error { data: String },
    /// Terminal success
    Done {
        #[serde(default)]
        data: String,
    },
}

impl DaemonResponse {
    pub fn status(data: impl Into<String>) -> Self {
        DaemonResponse::Status { data: data.into() }
    }

    pub fn chunk(data: impl Into<String>) -> Self {
        DaemonResponse::Chunk { data: data.into() }
    }

    pub fn error(data: impl Into<String>) -> Self {
        DaemonResponse::Error { data: data.into() }
    }

    pub fn done(data: impl Into<String>) -> Self {
        DaemonResponse::Done { data: data.into() }
    }

    /// `done` and `error` end a response stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, DaemonResponse::Error { .. } | DaemonResponse::Done { .. })
    }

    pub fn data(&self) -> &str {
        match self {
            DaemonResponse::Status { data }
            | DaemonResponse::Chunk { data }
            | DaemonResponse::Error { data }
            | DaemonResponse::Done { data } => data,
        }
    }
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a message to JSON bytes with newline delimiter
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Deserialize a message from JSON bytes (strips trailing newline)
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, serde_json::Error> {
    let trimmed = if bytes.last() == Some(&b'\n') {
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    };
    serde_json::from_slice(trimmed)
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("unexpected frame: {0}")]
    Unexpected(#[source] serde_json::Error),
}

/// Incremental decoder for newline-delimited JSON frames.
///
/// Bytes are appended as they arrive from the socket. A line that does not
/// yet parse as JSON is kept and joined with the following line(s), so a
/// frame split across reads is decoded exactly once. The pending data is
/// bounded by `max_frame_size`.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Offset up to which `buffer` has been scanned for a newline
    scanned: usize,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_size,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if any.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Valid JSON that is not a
    /// `T` is reported as `FrameError::Unexpected` and consumed.
    pub fn next_frame<T: for<'de> Deserialize<'de>>(&mut self) -> Result<Option<T>, FrameError> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buffer.len();
                return self.check_size().map(|_| None);
            };
            let end = self.scanned + offset + 1;
            let candidate = &self.buffer[..end];

            if candidate.iter().all(u8::is_ascii_whitespace) {
                self.consume(end);
                continue;
            }

            match serde_json::from_slice::<Value>(candidate) {
                Ok(value) => {
                    self.consume(end);
                    return serde_json::from_value(value)
                        .map(Some)
                        .map_err(FrameError::Unexpected);
                }
                Err(_) => {
                    // Not a complete JSON document yet; keep it and look further
                    self.scanned = end;
                    self.check_size()?;
                }
            }
        }
    }

    fn consume(&mut self, end: usize) {
        self.buffer.drain(..end);
        self.scanned = 0;
    }

    fn check_size(&self) -> Result<(), FrameError> {
        if self.buffer.len() > self.max_frame_size {
            Err(FrameError::TooLarge {
                size: self.buffer.len(),
                max: self.max_frame_size,
            })
        } else {
            Ok(())
        }
    }
}
