// Daemon client used by the CLI
// Sends one request over the Unix socket and folds the framed response stream into a single result

use super::config::Config;
use super::protocol::{
    serialize_message, DaemonRequest, DaemonResponse, FrameDecoder, FrameError,
    MAX_RESPONSE_FRAME_SIZE,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Timeout applied to a whole request/response exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Why a request did not produce a result.
///
/// The display strings are the reasons reported to users and in `--json` output.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon-not-running")]
    DaemonNotRunning,
    #[error("timeout")]
    Timeout,
    /// The daemon answered with an `error` frame
    #[error("{0}")]
    Daemon(String),
    #[error("daemon closed the connection before finishing the response")]
    ConnectionClosed,
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serializable outcome of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResult {
    pub ok: bool,
    pub data: Option<String>,
    pub error: Option<String>,
}

impl From<Result<Option<String>, ClientError>> for ClientResult {
    fn from(result: Result<Option<String>, ClientError>) -> Self {
        match result {
            Ok(data) => ClientResult {
                ok: true,
                data,
                error: None,
            },
            Err(e) => ClientResult {
                ok: false,
                data: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    config: Config,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Send a request and wait for its aggregated result
    pub async fn send(&self, request: &DaemonRequest) -> Result<Option<String>, ClientError> {
        self.send_streaming(request, |_| {}).await
    }

    /// Send a request, calling `on_frame` for every frame as it arrives.
    ///
    /// Resolves on the first terminal frame: `error` fails with its text, `done`
    /// succeeds with the accumulated `status`/`chunk` text, falling back to the
    /// `done` payload, falling back to `None`.
    pub async fn send_streaming<F>(
        &self,
        request: &DaemonRequest,
        on_frame: F,
    ) -> Result<Option<String>, ClientError>
    where
        F: FnMut(&DaemonResponse),
    {
        if !self.config.is_alive() {
            return Err(ClientError::DaemonNotRunning);
        }

        match tokio::time::timeout(self.timeout, self.exchange(request, on_frame)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn exchange<F>(
        &self,
        request: &DaemonRequest,
        mut on_frame: F,
    ) -> Result<Option<String>, ClientError>
    where
        F: FnMut(&DaemonResponse),
    {
        let mut stream = UnixStream::connect(&self.config.socket_path).await?;
        stream.write_all(&serialize_message(request)?).await?;
        stream.flush().await?;

        let mut decoder = FrameDecoder::new(MAX_RESPONSE_FRAME_SIZE);
        let mut output = String::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            loop {
                let frame = match decoder.next_frame::<DaemonResponse>() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(FrameError::Unexpected(e)) => {
                        debug!(error = %e, "skipping unrecognized frame");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                on_frame(&frame);
                match frame {
                    DaemonResponse::Status { data } | DaemonResponse::Chunk { data } => {
                        output.push_str(&data);
                    }
                    DaemonResponse::Error { data } => return Err(ClientError::Daemon(data)),
                    DaemonResponse::Done { data } => {
                        return Ok(if !output.is_empty() {
                            Some(output)
                        } else if !data.is_empty() {
                            Some(data)
                        } else {
                            None
                        });
                    }
                }
            }

            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
            decoder.push(&buf[..n]);
        }
    }
}

/// Send a single request with the given timeout
pub async fn send_request(
    config: &Config,
    request: &DaemonRequest,
    timeout: Duration,
) -> Result<Option<String>, ClientError> {
    DaemonClient::new(config.clone())
        .with_timeout(timeout)
        .send(request)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;
    use tokio::task::JoinHandle;

    /// Config whose PID file names this (live) test process
    fn live_config(temp_dir: &TempDir) -> Config {
        let config = Config::with_home(temp_dir.path().to_path_buf())
            .with_socket_path(temp_dir.path().join("ambient-test.sock"));
        config.write_pid().unwrap();
        config
    }

    /// Accept one connection, read the request line, then write each part with a pause
    fn fake_daemon(config: &Config, parts: Vec<&'static str>) -> JoinHandle<String> {
        let listener = UnixListener::bind(&config.socket_path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while stream.read(&mut byte).await.unwrap() == 1 && byte[0] != b'\n' {
                request.push(byte[0]);
            }
            for part in parts {
                stream.write_all(part.as_bytes()).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            String::from_utf8(request).unwrap()
        })
    }

    #[tokio::test]
    async fn test_not_running_skips_connect() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::with_home(temp_dir.path().to_path_buf())
            .with_socket_path(temp_dir.path().join("ambient-test.sock"));
        let listener = UnixListener::bind(&config.socket_path).unwrap();

        let result = send_request(&config, &DaemonRequest::Ping, DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(ClientError::DaemonNotRunning)));
        assert_eq!(ClientResult::from(result).error.as_deref(), Some("daemon-not-running"));

        let accepted = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(accepted.is_err(), "client must not connect");
    }

    #[tokio::test]
    async fn test_split_frames_yield_one_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let config = live_config(&temp_dir);
        let server = fake_daemon(
            &config,
            vec!["{\"type\":\"chunk\",\"data\":\"A\"}\n{\"type\":\"d", "one\",\"data\":\"\"}\n"],
        );

        let mut frames = Vec::new();
        let result = DaemonClient::new(config)
            .send_streaming(&DaemonRequest::Ping, |frame| frames.push(frame.clone()))
            .await
            .unwrap();

        assert_eq!(result.as_deref(), Some("A"));
        assert_eq!(frames, vec![DaemonResponse::chunk("A"), DaemonResponse::done("")]);

        let request = server.await.unwrap();
        assert_eq!(request, r#"{"type":"ping"}"#);
    }

    #[tokio::test]
    async fn test_done_payload_used_when_no_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let config = live_config(&temp_dir);
        fake_daemon(&config, vec!["{\"type\":\"done\",\"data\":\"pong\"}\n"]);
        let result = send_request(&config, &DaemonRequest::Ping, DEFAULT_TIMEOUT).await;
        assert_eq!(result.unwrap().as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_empty_done_resolves_to_none() {
        let temp_dir = TempDir::new().unwrap();
        let config = live_config(&temp_dir);
        fake_daemon(&config, vec!["{\"type\":\"done\"}\n"]);
        let result = send_request(&config, &DaemonRequest::Ping, DEFAULT_TIMEOUT).await;
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn test_status_frames_are_accumulated() {
        let temp_dir = TempDir::new().unwrap();
        let config = live_config(&temp_dir);
        fake_daemon(
            &config,
            vec![
                "{\"type\":\"status\",\"data\":\"thinking... \"}\n",
                "{\"type\":\"chunk\",\"data\":\"answer\"}\n",
                "{\"type\":\"done\",\"data\":\"ignored\"}\n",
            ],
        );
        let result = send_request(&config, &DaemonRequest::Ping, DEFAULT_TIMEOUT).await;
        assert_eq!(result.unwrap().as_deref(), Some("thinking... answer"));
    }

    #[tokio::test]
    async fn test_error_frame_fails_with_its_text() {
        let temp_dir = TempDir::new().unwrap();
        let config = live_config(&temp_dir);
        fake_daemon(
            &config,
            vec![
                "{\"type\":\"chunk\",\"data\":\"partial\"}\n",
                "{\"type\":\"error\",\"data\":\"Agent \\\"claude\\\" exited with code 2\"}\n",
                "{\"type\":\"done\",\"data\":\"\"}\n",
            ],
        );

        let result = send_request(&config, &DaemonRequest::Ping, DEFAULT_TIMEOUT).await;
        assert_eq!(
            ClientResult::from(result),
            ClientResult {
                ok: false,
                data: None,
                error: Some("Agent \"claude\" exited with code 2".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_without_terminal_frame() {
        let temp_dir = TempDir::new().unwrap();
        let config = live_config(&temp_dir);
        let listener = UnixListener::bind(&config.socket_path).unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without answering
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let result = send_request(&config, &DaemonRequest::Ping, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(ClientResult::from(result).error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_connection_closed_before_terminal_frame() {
        let temp_dir = TempDir::new().unwrap();
        let config = live_config(&temp_dir);
        fake_daemon(&config, vec!["{\"type\":\"chunk\",\"data\":\"A\"}\n"]);

        let result = send_request(&config, &DaemonRequest::Ping, DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_missing_socket_is_transport_error() {
        let temp_dir = TempDir::new().unwrap();
        let config = live_config(&temp_dir);
        let result = send_request(&config, &DaemonRequest::Ping, DEFAULT_TIMEOUT).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }
}
