use std::fmt;

use prometheus::{IntCounter, IntGauge, Opts, Registry};

const NAMESPACE: &str = "bold_assertion_manager";

fn register_counter(
    registry: &Registry,
    name: &str,
    help: &str,
) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Counters and gauges of a single assertion manager.
///
/// Every manager owns its own [`Registry`], so several managers can run in one
/// process. Exporters gather from [`ManagerMetrics::registry`].
#[derive(Clone)]
pub struct ManagerMetrics {
    registry: Registry,
    forks_detected: IntCounter,
    assertions_processed: IntCounter,
    submitted_rivals: IntCounter,
    assertions_posted: IntCounter,
    assertions_confirmed: IntCounter,
    time_confirmation_errors: IntCounter,
    chain_catching_up: IntCounter,
    safe_block_delays: IntCounter,
    evil_assertions: IntCounter,
    evil_assertions_confirmed: IntCounter,
    retries: IntCounter,
    latest_confirmed_creation_block: IntGauge,
}

impl ManagerMetrics {
    /// Creates the metrics and registers them on a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let latest_confirmed_creation_block = IntGauge::with_opts(
            Opts::new(
                "latest_confirmed_creation_block",
                "Creation block of the latest confirmed assertion",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(latest_confirmed_creation_block.clone()))?;

        Ok(Self {
            forks_detected: register_counter(
                &registry,
                "forks_detected",
                "Assertions observed with a canonical parent while not being canonical",
            )?,
            assertions_processed: register_counter(
                &registry,
                "assertions_processed",
                "Distinct assertions extracted from creation events",
            )?,
            submitted_rivals: register_counter(
                &registry,
                "submitted_rivals",
                "Rivals this manager posted in response to forks",
            )?,
            assertions_posted: register_counter(
                &registry,
                "assertions_posted",
                "Assertions this manager posted on its own schedule",
            )?,
            assertions_confirmed: register_counter(
                &registry,
                "assertions_confirmed",
                "Assertions this manager confirmed",
            )?,
            time_confirmation_errors: register_counter(
                &registry,
                "time_confirmation_errors",
                "Failed attempts at confirming by time",
            )?,
            chain_catching_up: register_counter(
                &registry,
                "chain_catching_up",
                "Times the execution provider was behind the chain",
            )?,
            safe_block_delays: register_counter(
                &registry,
                "safe_block_delays",
                "Times the safe head trailed the latest head by too much",
            )?,
            evil_assertions: register_counter(
                &registry,
                "evil_assertions",
                "Forks this manager saw but was not allowed to respond to",
            )?,
            evil_assertions_confirmed: register_counter(
                &registry,
                "evil_assertions_confirmed",
                "Assertions seen confirmed that this manager disagreed with",
            )?,
            retries: register_counter(
                &registry,
                "retries",
                "Failed attempts of retried operations",
            )?,
            latest_confirmed_creation_block,
            registry,
        })
    }

    /// The registry holding every metric of this manager.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Assertions observed with a canonical parent while not being canonical.
    pub fn forks_detected(&self) -> u64 {
        self.forks_detected.get()
    }

    /// Distinct assertions extracted from creation events.
    pub fn assertions_processed(&self) -> u64 {
        self.assertions_processed.get()
    }

    /// Rivals this manager posted in response to forks.
    pub fn submitted_rivals(&self) -> u64 {
        self.submitted_rivals.get()
    }

    /// Assertions this manager posted on its own schedule.
    pub fn assertions_posted(&self) -> u64 {
        self.assertions_posted.get()
    }

    /// Assertions this manager confirmed.
    pub fn assertions_confirmed(&self) -> u64 {
        self.assertions_confirmed.get()
    }

    /// Failed attempts at confirming by time.
    pub fn time_confirmation_errors(&self) -> u64 {
        self.time_confirmation_errors.get()
    }

    /// Times the execution provider was behind the chain.
    pub fn chain_catching_up(&self) -> u64 {
        self.chain_catching_up.get()
    }

    /// Times the safe head trailed the latest head by too much.
    pub fn safe_block_delays(&self) -> u64 {
        self.safe_block_delays.get()
    }

    /// Forks this manager saw but was not allowed to respond to.
    pub fn evil_assertions(&self) -> u64 {
        self.evil_assertions.get()
    }

    /// Assertions seen confirmed that this manager disagreed with.
    pub fn evil_assertions_confirmed(&self) -> u64 {
        self.evil_assertions_confirmed.get()
    }

    /// Failed attempts of retried operations.
    pub fn retries(&self) -> u64 {
        self.retries.get()
    }

    /// Creation block of the latest confirmed assertion.
    pub fn latest_confirmed_creation_block(&self) -> u64 {
        u64::try_from(self.latest_confirmed_creation_block.get()).unwrap_or_default()
    }

    pub(crate) fn inc_forks_detected(&self) {
        self.forks_detected.inc();
    }

    pub(crate) fn inc_assertions_processed(&self) {
        self.assertions_processed.inc();
    }

    pub(crate) fn inc_submitted_rivals(&self) {
        self.submitted_rivals.inc();
    }

    pub(crate) fn inc_assertions_posted(&self) {
        self.assertions_posted.inc();
    }

    pub(crate) fn inc_assertions_confirmed(&self) {
        self.assertions_confirmed.inc();
    }

    pub(crate) fn inc_time_confirmation_errors(&self) {
        self.time_confirmation_errors.inc();
    }

    pub(crate) fn inc_chain_catching_up(&self) {
        self.chain_catching_up.inc();
    }

    pub(crate) fn inc_safe_block_delays(&self) {
        self.safe_block_delays.inc();
    }

    pub(crate) fn inc_evil_assertions(&self) {
        self.evil_assertions.inc();
    }

    pub(crate) fn inc_evil_assertions_confirmed(&self) {
        self.evil_assertions_confirmed.inc();
    }

    pub(crate) fn inc_retries(&self) {
        self.retries.inc();
    }

    pub(crate) fn set_latest_confirmed_creation_block(&self, block: u64) {
        self.latest_confirmed_creation_block
            .set(i64::try_from(block).unwrap_or(i64::MAX));
    }

    /// Copies every counter and gauge.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            forks_detected: self.forks_detected(),
            assertions_processed: self.assertions_processed(),
            submitted_rivals: self.submitted_rivals(),
            assertions_posted: self.assertions_posted(),
            assertions_confirmed: self.assertions_confirmed(),
            time_confirmation_errors: self.time_confirmation_errors(),
            chain_catching_up: self.chain_catching_up(),
            safe_block_delays: self.safe_block_delays(),
            evil_assertions: self.evil_assertions(),
            evil_assertions_confirmed: self.evil_assertions_confirmed(),
            retries: self.retries(),
            latest_confirmed_creation_block: self.latest_confirmed_creation_block(),
        }
    }
}

impl fmt::Debug for ManagerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManagerMetrics").field(&self.snapshot()).finish()
    }
}

/// A point-in-time copy of [`ManagerMetrics`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub forks_detected: u64,
    pub assertions_processed: u64,
    pub submitted_rivals: u64,
    pub assertions_posted: u64,
    pub assertions_confirmed: u64,
    pub time_confirmation_errors: u64,
    pub chain_catching_up: u64,
    pub safe_block_delays: u64,
    pub evil_assertions: u64,
    pub evil_assertions_confirmed: u64,
    pub retries: u64,
    pub latest_confirmed_creation_block: u64,
}
