// Environment configuration helpers for the daemon
// Resolves the socket, PID file and config file locations, and hosts the liveness probe

use std::path::PathBuf;

/// Environment variable overriding the `~/.ambient` home directory
pub const HOME_ENV: &str = "AMBIENT_HOME";

/// Paths shared by the daemon and its clients
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the PID file, config file and daemon log
    pub home_dir: PathBuf,
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Path to the daemon PID file
    pub pid_file: PathBuf,
    /// Path to the optional user config file
    pub config_file: PathBuf,
}

impl Config {
    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        Self::with_home(Self::default_home_dir())
    }

    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        match std::env::var_os(HOME_ENV) {
            Some(dir) if !dir.is_empty() => Self::with_home(PathBuf::from(dir)),
            _ => Self::default_paths(),
        }
    }

    /// Paths rooted at `home_dir`, with the socket in the runtime directory
    pub fn with_home(home_dir: PathBuf) -> Self {
        Self {
            socket_path: default_socket_path(),
            pid_file: home_dir.join("daemon.pid"),
            config_file: home_dir.join("config.json"),
            home_dir,
        }
    }

    /// Replace the socket location (the `socketPath` setting)
    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.socket_path = socket_path;
        self
    }

    fn default_home_dir() -> PathBuf {
        // ~/.ambient (or <tmp>/.ambient if home unavailable)
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".ambient")
    }

    /// Log file used when the daemon is started in the background
    pub fn log_file(&self) -> PathBuf {
        self.home_dir.join("daemon.log")
    }

    /// Ensure the home directory exists with owner-only permissions
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.home_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.home_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(())
    }

    /// Write the daemon PID to the PID file
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    /// Read the daemon PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the PID file
    pub fn remove_pid(&self) -> std::io::Result<()> {
        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file)
        } else {
            Ok(())
        }
    }

    /// Remove the socket file
    pub fn remove_socket(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
        } else {
            Ok(())
        }
    }

    /// Check if the daemon socket exists (the daemon may still be dead)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Liveness probe: is the process recorded in the PID file signal-reachable?
    ///
    /// This only proves that *some* process owns that PID. It does not check
    /// that the process is an ambient daemon.
    #[cfg(unix)]
    pub fn is_alive(&self) -> bool {
        match self.read_pid() {
            Some(pid) => pid_is_alive(pid),
            None => false,
        }
    }

    #[cfg(not(unix))]
    pub fn is_alive(&self) -> bool {
        self.socket_exists()
    }
}

/// Signal 0 probe. Permission errors count as "not alive".
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

/// `$XDG_RUNTIME_DIR/ambient-<uid>.sock`, or the temp dir when XDG is unset
pub fn default_socket_path() -> PathBuf {
    let dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    };
    dir.join(socket_file_name(current_uid()))
}

fn socket_file_name(uid: Option<u32>) -> String {
    match uid {
        Some(uid) => format!("ambient-{}.sock", uid),
        None => "ambient-default.sock".to_string(),
    }
}

#[cfg(unix)]
fn current_uid() -> Option<u32> {
    Some(unsafe { libc::getuid() })
}

#[cfg(not(unix))]
fn current_uid() -> Option<u32> {
    None
}
