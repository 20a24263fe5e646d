use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use schnellru::{ByLength, LruMap};

use crate::ephemeral::{log_at, LogLevel};
use crate::metrics::ManagerMetrics;
use crate::shutdown::Shutdown;

const MAX_TRACKED_ERRORS: u32 = 256;

/// The error returned when a retried operation is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// Shutdown was signalled before the operation succeeded.
    #[error("cancelled after {attempts} attempts, last error: {last_error}")]
    Cancelled {
        /// Number of attempts made.
        attempts: u64,
        /// Message of the last failure, if any attempt was made.
        last_error: String,
    },
}

impl RetryError {
    pub(crate) fn cancelled(attempts: u64, last_error: impl Into<String>) -> Self {
        RetryError::Cancelled {
            attempts,
            last_error: last_error.into(),
        }
    }
}

/// Substrings of error messages that are logged below the default level.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryLevels {
    /// Errors containing this are logged at info level.
    pub info: Option<&'static str>,
    /// Errors containing this are logged at warn level.
    pub warning: Option<&'static str>,
}

/// Runs fallible operations until they succeed or shutdown is signalled.
///
/// Every failure is logged. An error message seen for the first time is logged as a
/// warning, and is only escalated to an error once it has kept recurring for longer
/// than the grace window.
pub struct RetryRunner {
    interval: Duration,
    grace: Duration,
    first_seen: Mutex<LruMap<String, Instant>>,
    metrics: Arc<ManagerMetrics>,
}

impl RetryRunner {
    /// Creates a runner sleeping `interval` between attempts.
    pub fn new(interval: Duration, grace: Duration, metrics: Arc<ManagerMetrics>) -> Self {
        Self {
            interval,
            grace,
            first_seen: Mutex::new(LruMap::new(ByLength::new(MAX_TRACKED_ERRORS))),
            metrics,
        }
    }

    /// Calls `operation` until it succeeds.
    pub async fn until_succeeds<T, F, Fut>(
        &self,
        shutdown: &Shutdown,
        name: &str,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.until_succeeds_with(shutdown, name, RetryLevels::default(), operation)
            .await
    }

    /// Calls `operation` until it succeeds, logging known errors at the given levels.
    pub async fn until_succeeds_with<T, F, Fut>(
        &self,
        shutdown: &Shutdown,
        name: &str,
        levels: RetryLevels,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut shutdown = shutdown.clone();
        let mut attempts = 0u64;
        let mut last_error = String::from("shutdown before the first attempt");
        loop {
            if shutdown.is_shutdown() {
                return Err(RetryError::cancelled(attempts, last_error));
            }
            attempts += 1;
            let result = tokio::select! {
                result = operation() => result,
                _ = shutdown.wait() => return Err(RetryError::cancelled(attempts, last_error)),
            };
            let err = match result {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!(operation = name, attempts, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.metrics.inc_retries();
            last_error = format!("{:#}", err);
            let level = self.level_for(&last_error, levels);
            log_at!(
                level,
                operation = name,
                attempt = attempts,
                error = %last_error,
                "Could not succeed function after retries"
            );

            if !shutdown.sleep(self.interval).await {
                return Err(RetryError::cancelled(attempts, last_error));
            }
        }
    }

    fn level_for(&self, message: &str, levels: RetryLevels) -> LogLevel {
        if levels.info.map_or(false, |s| message.contains(s)) {
            return LogLevel::Info;
        }
        if levels.warning.map_or(false, |s| message.contains(s)) {
            return LogLevel::Warn;
        }
        let key = message.to_string();
        let mut first_seen = self.first_seen.lock();
        let now = Instant::now();
        let seen_at = match first_seen.peek(&key) {
            Some(seen_at) => *seen_at,
            None => {
                first_seen.insert(key, now);
                now
            }
        };
        if now.duration_since(seen_at) < self.grace {
            LogLevel::Warn
        } else {
            LogLevel::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::shutdown::shutdown_channel;

    fn runner(grace: Duration) -> RetryRunner {
        RetryRunner::new(
            Duration::from_millis(5),
            grace,
            Arc::new(ManagerMetrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (_handle, shutdown) = shutdown_channel();
        let retry = runner(Duration::from_secs(600));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let value = retry
            .until_succeeds(&shutdown, "flaky", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("not yet");
                }
                Ok(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(retry.metrics.retries(), 2);
    }

    #[tokio::test]
    async fn cancellation_returns_last_error() {
        let (handle, shutdown) = shutdown_channel();
        let retry = RetryRunner::new(
            Duration::from_secs(3600),
            Duration::from_secs(600),
            Arc::new(ManagerMetrics::new().unwrap()),
        );

        let task = tokio::spawn(async move {
            retry
                .until_succeeds(&shutdown, "broken", || async {
                    Err::<(), _>(anyhow::anyhow!("rpc unavailable"))
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            RetryError::Cancelled {
                attempts: 1,
                last_error: "rpc unavailable".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn does_not_run_after_shutdown() {
        let (handle, shutdown) = shutdown_channel();
        handle.shutdown();
        let retry = runner(Duration::from_secs(600));
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result = retry
            .until_succeeds(&shutdown, "never", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeated_errors_escalate_after_grace() {
        let retry = runner(Duration::ZERO);
        assert_eq!(
            retry.level_for("boom", RetryLevels::default()),
            LogLevel::Error
        );

        let retry = runner(Duration::from_secs(600));
        assert_eq!(retry.level_for("boom", RetryLevels::default()), LogLevel::Warn);
        assert_eq!(retry.level_for("boom", RetryLevels::default()), LogLevel::Warn);

        let levels = RetryLevels {
            info: Some("catching up"),
            warning: None,
        };
        assert_eq!(
            retry.level_for("chain catching up", levels),
            LogLevel::Info
        );
    }
}
