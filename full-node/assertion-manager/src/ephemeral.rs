use std::time::{Duration, Instant};

/// Transaction errors expected to resolve by themselves.
pub(crate) const TRANSIENT_TRANSACTION_ERRORS: [&str; 3] = [
    "posting this transaction will exceed max mempool size",
    "mempool is full",
    "gas estimation",
];

/// Severity picked at runtime for an error log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// `tracing::debug!`
    Debug,
    /// `tracing::info!`
    Info,
    /// `tracing::warn!`
    Warn,
    /// `tracing::error!`
    Error,
}

/// Emits a `tracing` event at a [`LogLevel`] only known at runtime.
macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            $crate::ephemeral::LogLevel::Debug => tracing::debug!($($arg)+),
            $crate::ephemeral::LogLevel::Info => tracing::info!($($arg)+),
            $crate::ephemeral::LogLevel::Warn => tracing::warn!($($arg)+),
            $crate::ephemeral::LogLevel::Error => tracing::error!($($arg)+),
        }
    };
}
pub(crate) use log_at;

/// Demotes errors that are expected to resolve by themselves.
///
/// While an error containing one of the ephemeral substrings keeps recurring for
/// less than the grace window it is logged as a warning. After that it is logged at
/// the caller's level.
#[derive(Debug)]
pub struct EphemeralErrorHandler {
    grace: Duration,
    ephemeral: Vec<&'static str>,
    first_seen: Option<Instant>,
}

impl EphemeralErrorHandler {
    /// Creates a handler for errors containing any of `ephemeral`.
    pub fn new(grace: Duration, ephemeral: &[&'static str]) -> Self {
        Self {
            grace,
            ephemeral: ephemeral.to_vec(),
            first_seen: None,
        }
    }

    /// Returns the level `err` should be logged at, given the caller's default `level`.
    pub fn log_level(&mut self, err: &anyhow::Error, level: LogLevel) -> LogLevel {
        let message = format!("{:#}", err);
        if !self.ephemeral.iter().any(|s| message.contains(s)) {
            self.first_seen = None;
            return level;
        }
        let first_seen = *self.first_seen.get_or_insert_with(Instant::now);
        if first_seen.elapsed() < self.grace {
            level.min(LogLevel::Warn)
        } else {
            level
        }
    }

    /// Forgets about previous errors. Called after a success.
    pub fn reset(&mut self) {
        self.first_seen = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_errors_are_warnings_within_grace() {
        let mut handler =
            EphemeralErrorHandler::new(Duration::from_secs(600), &["mempool is full"]);
        let err = anyhow::anyhow!("posting transaction: mempool is full");
        assert_eq!(handler.log_level(&err, LogLevel::Error), LogLevel::Warn);
        assert_eq!(handler.log_level(&err, LogLevel::Error), LogLevel::Warn);

        let other = anyhow::anyhow!("connection refused");
        assert_eq!(handler.log_level(&other, LogLevel::Error), LogLevel::Error);
    }

    #[test]
    fn ephemeral_errors_escalate_after_grace() {
        let mut handler = EphemeralErrorHandler::new(Duration::ZERO, &["gas estimation"]);
        let err = anyhow::anyhow!("gas estimation failed");
        assert_eq!(handler.log_level(&err, LogLevel::Error), LogLevel::Error);
    }
}
