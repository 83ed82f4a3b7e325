//! Integration test: the compiled `ambient-daemon` and `ambient` binaries
//!
//! This test exercises the full flow:
//! 1. Start the daemon binary in an isolated home directory
//! 2. Query it through the library client and the CLI
//! 3. Stop it with a shutdown request and check it cleans up
//!
//! Run with: cargo test --test daemon_process

mod helpers;

use ambient_lib::session::daemon_client::DaemonClient;
use ambient_lib::session::protocol::{DaemonRequest, QueryPayload};
use helpers::daemon_guard::{daemon_command, DaemonGuard};
use helpers::polling::wait_for;
use helpers::{stub_config, write_stub_config};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tempfile::TempDir;

const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

fn start(temp_dir: &TempDir) -> DaemonGuard {
    write_stub_config(temp_dir.path(), &[("claude", "printf hello")]);
    DaemonGuard::start(temp_dir.path()).expect("daemon should start")
}

/// Run the `ambient` CLI against the daemon in `temp_dir`
fn ambient(temp_dir: &TempDir, args: &[&str]) -> Output {
    // socketPath in the config file points the CLI at the test socket
    let config_file = temp_dir.path().join("cli-config.json");
    let socket = temp_dir.path().join(helpers::daemon_guard::SOCKET_NAME);
    std::fs::write(
        &config_file,
        serde_json::json!({ "socketPath": socket }).to_string(),
    )
    .unwrap();

    Command::new(env!("CARGO_BIN_EXE_ambient"))
        .arg("--config")
        .arg(&config_file)
        .args(args)
        .env("AMBIENT_HOME", temp_dir.path())
        .stdin(Stdio::null())
        .output()
        .expect("Failed to run ambient")
}

#[tokio::test]
async fn test_daemon_answers_and_shuts_down() {
    let temp_dir = TempDir::new().unwrap();
    let mut daemon = start(&temp_dir);
    let config = daemon.config();
    assert!(config.is_alive());

    let client = DaemonClient::new(config.clone()).with_timeout(Duration::from_secs(10));
    assert_eq!(
        client.send(&DaemonRequest::Ping).await.unwrap().as_deref(),
        Some("pong")
    );

    let answer = client
        .send(&DaemonRequest::Query(QueryPayload {
            prompt: "hi".to_string(),
            agent: None,
            pipe_input: None,
            cwd: "/tmp".to_string(),
            new_session: None,
        }))
        .await
        .unwrap();
    assert_eq!(answer.as_deref(), Some("hello"));

    let reply = client.send(&DaemonRequest::Shutdown).await.unwrap();
    assert_eq!(reply.as_deref(), Some("shutting down"));

    let status = daemon.wait_for_exit(EXIT_TIMEOUT).expect("daemon should exit");
    assert!(status.success());
    assert!(!config.pid_file.exists(), "PID file should be removed");
    assert!(!config.socket_exists(), "socket should be removed");
}

#[test]
fn test_second_daemon_refuses_to_start() {
    let temp_dir = TempDir::new().unwrap();
    let _daemon = start(&temp_dir);

    let output = daemon_command(temp_dir.path())
        .stdout(Stdio::null())
        .output()
        .expect("Failed to run second daemon");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("already running"));
}

#[test]
fn test_stale_socket_is_replaced() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join(helpers::daemon_guard::SOCKET_NAME);
    std::fs::write(&socket, "").unwrap();

    let daemon = start(&temp_dir);
    assert_eq!(daemon.config().read_pid(), Some(daemon.pid()));
}

#[test]
fn test_cli_ping_status_and_ask() {
    let temp_dir = TempDir::new().unwrap();
    let _daemon = start(&temp_dir);

    let output = ambient(&temp_dir, &["ping"]);
    assert!(output.status.success(), "{:?}", output);
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "pong");

    let output = ambient(&temp_dir, &["ask", "--json", "say", "hello"]);
    assert!(output.status.success(), "{:?}", output);
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        result,
        serde_json::json!({ "ok": true, "data": "hello", "error": null })
    );

    // The session is updated just after the reply is flushed
    let status = wait_for("query to be recorded", EXIT_TIMEOUT, || {
        let output = ambient(&temp_dir, &["status", "--json"]);
        let result: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        let status: serde_json::Value = serde_json::from_str(result["data"].as_str()?).ok()?;
        (status["session"]["queryCount"] == 1).then_some(status)
    })
    .unwrap();
    assert_eq!(status["defaultAgent"], "claude");
}

#[test]
fn test_cli_reports_daemon_not_running() {
    let temp_dir = TempDir::new().unwrap();

    let output = ambient(&temp_dir, &["ping", "--json"]);
    assert!(!output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        result,
        serde_json::json!({ "ok": false, "data": null, "error": "daemon-not-running" })
    );

    // Hooks stay silent and succeed so the prompt is never disturbed
    let output = ambient(&temp_dir, &["hook", "precmd", "--cwd", "/tmp", "--exit-code", "0"]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn test_ask_starts_daemon_with_cli_config() {
    let temp_dir = TempDir::new().unwrap();
    // Only the explicit config file defines the stub agent
    let mut settings = stub_config(&[("claude", "printf custom")]);
    settings["socketPath"] = serde_json::json!(temp_dir.path().join(helpers::daemon_guard::SOCKET_NAME));
    let config_file = temp_dir.path().join("custom.json");
    std::fs::write(&config_file, settings.to_string()).unwrap();

    let run = |args: &[&str]| {
        Command::new(env!("CARGO_BIN_EXE_ambient"))
            .arg("--config")
            .arg(&config_file)
            .args(args)
            .env("AMBIENT_HOME", temp_dir.path())
            .stdin(Stdio::null())
            .output()
            .expect("Failed to run ambient")
    };

    let output = run(&["ask", "--json", "hi"]);
    let stopped = run(&["stop"]);

    assert!(output.status.success(), "{:?}", output);
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["data"], "custom");
    assert!(stopped.status.success(), "{:?}", stopped);
}
