use super::polling::{wait_for, WaitError};
use ambient_lib::session::config::{Config, HOME_ENV};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket file name used inside the test home directory
pub const SOCKET_NAME: &str = "ambient.sock";

/// Config matching a daemon started by `DaemonGuard::start` in `home`
pub fn test_config(home: &Path) -> Config {
    Config::with_home(home.to_path_buf()).with_socket_path(home.join(SOCKET_NAME))
}

/// Command for the compiled daemon, isolated inside `home`
pub fn daemon_command(home: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ambient-daemon"));
    command
        .arg("--config")
        .arg(home.join("config.json"))
        .arg("--socket")
        .arg(home.join(SOCKET_NAME))
        .env(HOME_ENV, home)
        .env("AMBIENT_LOG", "ambient_lib=debug,ambient_daemon=debug")
        .stdin(Stdio::null());
    command
}

/// RAII wrapper that ensures the daemon process is cleaned up.
pub struct DaemonGuard {
    child: Child,
    home: PathBuf,
}

impl DaemonGuard {
    /// Start the compiled daemon and wait for its PID file.
    pub fn start(home: &Path) -> Result<Self, DaemonError> {
        let child = daemon_command(home)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(DaemonError::SpawnFailed)?;

        let guard = Self {
            child,
            home: home.to_path_buf(),
        };
        guard.wait_for_ready().map_err(DaemonError::ReadyTimeout)?;
        Ok(guard)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn config(&self) -> Config {
        test_config(&self.home)
    }

    /// Wait for the process to exit on its own
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Result<std::process::ExitStatus, WaitError> {
        let child = &mut self.child;
        wait_for("daemon to exit", timeout, || child.try_wait().ok().flatten())
    }

    fn wait_for_ready(&self) -> Result<(), WaitError> {
        let config = self.config();
        let pid = self.pid();
        wait_for("daemon PID file", READY_TIMEOUT, || {
            (config.read_pid() == Some(pid) && config.socket_exists()).then_some(())
        })
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        if let Err(err) = self.child.kill() {
            eprintln!(
                "Failed to terminate ambient-daemon pid {}: {}",
                self.child.id(),
                err
            );
            return;
        }

        let _ = self.child.wait();
    }
}

/// Errors that can occur when starting the daemon for tests.
#[derive(Debug)]
pub enum DaemonError {
    SpawnFailed(std::io::Error),
    ReadyTimeout(WaitError),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpawnFailed(err) => write!(f, "failed to spawn daemon: {}", err),
            Self::ReadyTimeout(err) => write!(f, "daemon never became ready: {}", err),
        }
    }
}

impl std::error::Error for DaemonError {}
