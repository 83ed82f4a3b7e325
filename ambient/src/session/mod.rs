// Daemon, client and agent routing for ambient
// This module is shared between the daemon and CLI binaries

pub mod agents;
pub mod config;
pub mod context;
pub mod protocol;
pub mod settings;
pub mod shell_integration;
pub mod state;

// Socket and process handling (Unix only)
#[cfg(unix)]
pub mod daemon_client;
#[cfg(unix)]
pub mod router;
#[cfg(unix)]
pub mod server;
