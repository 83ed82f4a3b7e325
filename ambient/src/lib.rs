// Library shared by the `ambient` CLI and the `ambient-daemon` binary

// Session management module (daemon, client, router)
pub mod session;

// Polling helpers for async and integration tests
pub mod test_utils;

pub use session::config::Config;
pub use session::settings::Settings;
