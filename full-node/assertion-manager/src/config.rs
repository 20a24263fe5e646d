use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use bold_rollup_interface::Mode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors preventing an assertion manager from being built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The chain must be polled at a non-zero interval.
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    /// Confirmations must be attempted at a non-zero interval.
    #[error("confirmation attempt interval must be greater than zero")]
    ZeroConfirmationInterval,
    /// Event queries must cover at least one block.
    #[error("max get log blocks must be greater than zero")]
    ZeroMaxGetLogBlocks,
    /// The confirmation queue must hold at least one assertion.
    #[error("confirmation queue capacity must be greater than zero")]
    ZeroConfirmationQueueCapacity,
    /// The metrics of the manager could not be registered.
    #[error("could not register metrics: {0}")]
    Metrics(String),
}

/// Configuration of an [`crate::AssertionManager`].
///
/// Every field has a default, so a configuration file only needs to list the values
/// it overrides. Durations are expressed in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssertionManagerConfig {
    /// Name of the validator, attached to log lines.
    pub validator_name: String,
    /// Which on-chain actions the validator takes.
    pub mode: Mode,
    /// How often the chain is scanned for new assertions.
    pub poll_interval_ms: u64,
    /// How often a pending confirmation is attempted.
    pub confirmation_attempt_interval_ms: u64,
    /// How often the validator posts its own assertion.
    pub posting_interval_ms: u64,
    /// Average block time of the parent chain.
    pub average_block_time_ms: u64,
    /// Minimum wall-clock time between a parent assertion and its child.
    pub minimum_gap_to_parent_ms: u64,
    /// Maximum number of blocks covered by a single event query.
    pub max_get_log_blocks: u64,
    /// How long retried operations sleep between attempts.
    pub retry_interval_ms: u64,
    /// How long a recurring error is logged as a warning before it becomes an error.
    pub ephemeral_error_grace_ms: u64,
    /// How many times an undecided candidate is re-checked within a sync pass while
    /// the execution provider is catching up.
    pub catching_up_attempts: u32,
    /// How often the safe head is compared with the latest head.
    pub safe_block_check_interval_ms: u64,
    /// The largest acceptable timestamp gap between the latest and safe heads.
    pub max_safe_block_delay_secs: u64,
    /// Capacity of the confirmation queue.
    pub confirmation_queue_capacity: usize,
    /// Number of posted assertions remembered.
    pub submitted_assertions_capacity: u32,
    /// Never post assertions, only respond to forks.
    pub disable_posting: bool,
    /// Try fast confirmation before confirming by time.
    pub enable_fast_confirmation: bool,
    /// Post without waiting for the first sync pass.
    pub dangerous_ready_to_post: bool,
    /// The stake is funded by another account.
    pub delegated_staking: bool,
    /// Deposit the required stake on start.
    pub auto_deposit: bool,
    /// Approve the staking token allowances on start.
    pub auto_allowance_approval: bool,
}

impl Default for AssertionManagerConfig {
    fn default() -> Self {
        Self {
            validator_name: "validator".to_string(),
            mode: Mode::default(),
            poll_interval_ms: 60_000,
            confirmation_attempt_interval_ms: 10_000,
            posting_interval_ms: 3_600_000,
            average_block_time_ms: 12_000,
            minimum_gap_to_parent_ms: 900_000,
            max_get_log_blocks: 1_000,
            retry_interval_ms: 30_000,
            ephemeral_error_grace_ms: 600_000,
            catching_up_attempts: 5,
            safe_block_check_interval_ms: 60_000,
            max_safe_block_delay_secs: 1_200,
            confirmation_queue_capacity: 1_000,
            submitted_assertions_capacity: 1_000,
            disable_posting: false,
            enable_fast_confirmation: false,
            dangerous_ready_to_post: false,
            delegated_staking: false,
            auto_deposit: true,
            auto_allowance_approval: true,
        }
    }
}

impl AssertionManagerConfig {
    /// Checks the values that would prevent the manager from making progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.confirmation_attempt_interval_ms == 0 {
            return Err(ConfigError::ZeroConfirmationInterval);
        }
        if self.max_get_log_blocks == 0 {
            return Err(ConfigError::ZeroMaxGetLogBlocks);
        }
        if self.confirmation_queue_capacity == 0 {
            return Err(ConfigError::ZeroConfirmationQueueCapacity);
        }
        Ok(())
    }

    /// See [`AssertionManagerConfig::poll_interval_ms`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// See [`AssertionManagerConfig::confirmation_attempt_interval_ms`].
    pub fn confirmation_attempt_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_attempt_interval_ms)
    }

    /// See [`AssertionManagerConfig::posting_interval_ms`].
    pub fn posting_interval(&self) -> Duration {
        Duration::from_millis(self.posting_interval_ms)
    }

    /// See [`AssertionManagerConfig::average_block_time_ms`].
    pub fn average_block_time(&self) -> Duration {
        Duration::from_millis(self.average_block_time_ms)
    }

    /// See [`AssertionManagerConfig::minimum_gap_to_parent_ms`].
    pub fn minimum_gap_to_parent(&self) -> Duration {
        Duration::from_millis(self.minimum_gap_to_parent_ms)
    }

    /// See [`AssertionManagerConfig::retry_interval_ms`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// See [`AssertionManagerConfig::ephemeral_error_grace_ms`].
    pub fn ephemeral_error_grace(&self) -> Duration {
        Duration::from_millis(self.ephemeral_error_grace_ms)
    }

    /// See [`AssertionManagerConfig::safe_block_check_interval_ms`].
    pub fn safe_block_check_interval(&self) -> Duration {
        Duration::from_millis(self.safe_block_check_interval_ms)
    }
}

/// Reads a TOML file into `R`.
pub fn from_toml_path<P: AsRef<Path>, R: DeserializeOwned>(path: P) -> anyhow::Result<R> {
    let mut contents = String::new();
    {
        let mut file = File::open(path)?;
        file.read_to_string(&mut contents)?;
    }

    let result: R = toml::from_str(&contents)?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn create_config_from(content: &str) -> NamedTempFile {
        let mut config_file = NamedTempFile::new().unwrap();
        config_file.write_all(content.as_bytes()).unwrap();
        config_file
    }

    #[test]
    fn test_correct_config() {
        let config = r#"
            validator_name = "alice"
            mode = "defensive"
            poll_interval_ms = 1000
            max_get_log_blocks = 50
            enable_fast_confirmation = true
            auto_deposit = false
        "#;

        let config_file = create_config_from(config);

        let config: AssertionManagerConfig = from_toml_path(config_file.path()).unwrap();
        let expected = AssertionManagerConfig {
            validator_name: "alice".to_string(),
            mode: Mode::Defensive,
            poll_interval_ms: 1000,
            max_get_log_blocks: 50,
            enable_fast_confirmation: true,
            auto_deposit: false,
            ..Default::default()
        };
        assert_eq!(config, expected);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.minimum_gap_to_parent(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config_file = create_config_from("");
        let config: AssertionManagerConfig = from_toml_path(config_file.path()).unwrap();
        assert_eq!(config, AssertionManagerConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let config = AssertionManagerConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroPollInterval));

        let config = AssertionManagerConfig {
            confirmation_attempt_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroConfirmationInterval));

        let config = AssertionManagerConfig {
            max_get_log_blocks: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroMaxGetLogBlocks));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let config_file = create_config_from(r#"mode = "attacker""#);
        let result: anyhow::Result<AssertionManagerConfig> = from_toml_path(config_file.path());
        assert!(result.is_err());
    }
}
