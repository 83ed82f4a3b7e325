use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

const INITIAL_DELAY_MS: u64 = 25;
const MAX_DELAY_MS: u64 = 500;

/// Error returned when a polled condition never held.
#[derive(Debug)]
pub struct WaitError {
    desc: String,
    attempts: u32,
    waited: Duration,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timed out after {} attempts over {:?} waiting for {}",
            self.attempts, self.waited, self.desc
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll `probe` with exponential backoff until it yields a value or `timeout` passes.
///
/// Blocking on purpose: callers watch other processes, not tasks on their own runtime.
pub fn wait_for<T, F>(desc: &str, timeout: Duration, mut probe: F) -> Result<T, WaitError>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);
    let mut attempts = 0;

    loop {
        attempts += 1;
        if let Some(value) = probe() {
            return Ok(value);
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(WaitError {
                desc: desc.to_string(),
                attempts,
                waited: start.elapsed(),
            });
        }

        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
    }
}
