//! Polling helpers for async daemon tests
//!
//! Used by unit tests and by the integration tests under `tests/`, where
//! the daemon runs in another task or process.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Assert that an async condition eventually becomes true within a timeout.
///
/// Retries `f` every `interval` until it returns `Ok`, panicking with `desc`
/// and the last error once `timeout` has elapsed. The `Ok` value is returned.
///
/// # Example
///
/// ```rust,ignore
/// # use std::time::Duration;
/// # async fn example() {
/// use ambient_lib::test_utils::assert_eventually;
///
/// // Wait up to 3 seconds for the query to be recorded, checking every 100ms
/// assert_eventually(
///     "query to complete",
///     Duration::from_secs(3),
///     Duration::from_millis(100),
///     || async {
///         match server.sessions().snapshot().await {
///             Some(session) if session.query_count == 1 => Ok(()),
///             Some(_) => Err("query still running"),
///             None => Err("no session yet"),
///         }
///     }
/// ).await;
/// # }
/// ```
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = std::time::Instant::now();
    let mut last_error = String::from("no attempts made");
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                last_error = e.to_string();

                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    panic!(
                        "Timeout waiting for {}\n\
                         Duration: {:?}\n\
                         Attempts: {}\n\
                         Last error: {}",
                        desc, elapsed, attempt, last_error
                    );
                }

                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Variant of `assert_eventually` that takes a simple boolean condition.
///

/// # Example
///
/// ```rust,ignore
/// # use std::time::Duration;
/// # async fn example() {
/// use ambient_lib::test_utils::assert_eventually_bool;
///
/// assert_eventually_bool(
///     "socket to appear",
///     Duration::from_secs(2),
///     Duration::from_millis(50),
///     || async { config.socket_exists() }
/// ).await;
/// # }
/// ```
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if f().await {
            return;
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            panic!(
                "Timeout waiting for {}\n\
                 Duration: {:?}\n\
                 Attempts: {}\n\
                 Condition never became true",
                desc, elapsed, attempt
            );
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_returns_value_once_condition_holds() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);

        let value = assert_eventually(
            "third poll",
            Duration::from_secs(2),
            Duration::from_millis(10),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        n if n >= 2 => Ok(n),
                        n => Err(format!("poll {}", n)),
                    }
                }
            },
        )
        .await;

        assert_eq!(value, 2);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[should_panic(expected = "Timeout waiting for daemon socket")]
    async fn test_panics_with_description_on_timeout() {
        assert_eventually(
            "daemon socket",
            Duration::from_millis(100),
            Duration::from_millis(20),
            || async { Err::<(), _>("socket missing") },
        )
        .await;
    }

    #[tokio::test]
    async fn test_bool_variant() {
        let flag = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flag);
        assert_eventually_bool(
            "flag to flip",
            Duration::from_secs(2),
            Duration::from_millis(10),
            move || {
                let counter = Arc::clone(&counter);
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 1 }
            },
        )
        .await;
    }
}
