// ambient-daemon: long-lived process that routes shell queries to coding agents
//
// Listens on a Unix socket, keeps the session and shell context in memory, and
// streams agent output back to short-lived `ambient` clients.

use ambient_lib::session::{
    config::Config,
    server::{bind_socket, DaemonServer},
    settings::Settings,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding a tracing filter that overrides `logLevel`
const LOG_ENV: &str = "AMBIENT_LOG";

#[derive(Parser)]
#[command(name = "ambient-daemon")]
#[command(version)]
#[command(about = "Background daemon that routes shell queries to coding agents")]
struct Cli {
    /// Configuration file path (defaults to ~/.ambient/config.json)
    #[arg(short, long, env = "AMBIENT_CONFIG")]
    config: Option<PathBuf>,

    /// Socket path, overriding `socketPath` from the config file
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env();
    let config_file = cli.config.unwrap_or_else(|| config.config_file.clone());
    let settings = Settings::load(&config_file)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
                let level = &settings.log_level;
                format!("ambient_lib={},ambient_daemon={}", level, level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = settings.apply_paths(config);
    if let Some(socket) = cli.socket {
        config = config.with_socket_path(socket);
    }

    config
        .ensure_dirs()
        .context("Failed to create data directory")?;

    // Clean up stale socket if exists
    if config.socket_exists() {
        if config.is_alive() {
            error!(pid = ?config.read_pid(), "daemon already running");
            std::process::exit(1);
        }
        config
            .remove_socket()
            .context("Failed to remove stale socket")?;
    }

    let listener = bind_socket(&config)?;

    // The PID file is the readiness signal, so it is written once the socket accepts
    config.write_pid().context("Failed to write PID file")?;

    info!(
        socket = %config.socket_path.display(),
        pid = std::process::id(),
        default_agent = %settings.default_agent,
        "daemon listening"
    );

    let server = Arc::new(DaemonServer::new(config.clone(), settings));

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        shutdown.cancel();
    });

    let result = server.serve(listener).await;

    // Cleanup
    config.remove_pid().ok();
    config.remove_socket().ok();

    info!("daemon stopped");
    result
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_signal() {
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
