#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod chain_data;
mod config;
mod confirmation;
mod ephemeral;
mod lru_set;
mod manager;
mod metrics;
mod poster;
mod retry;
mod shutdown;
mod sync;

pub use chain_data::AssertionChainData;
pub use config::{from_toml_path, AssertionManagerConfig, ConfigError};
pub use ephemeral::{EphemeralErrorHandler, LogLevel};
pub use lru_set::LruSet;
pub use manager::{AssertionManager, AssertionManagerBuilder};
pub use metrics::{ManagerMetrics, MetricsSnapshot};
pub use poster::AssertionHandle;
pub use retry::{RetryError, RetryLevels, RetryRunner};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownHandle};
