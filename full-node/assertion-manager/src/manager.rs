use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bold_rollup_interface::services::chain::AssertionChain;
use bold_rollup_interface::services::challenge::RivalHandler;
use bold_rollup_interface::services::db::{AssertionRecord, Database};
use bold_rollup_interface::services::execution::{ExecutionError, ExecutionProvider};
use bold_rollup_interface::{AssertionCreatedInfo, AssertionHash, BlockTag, ExecutionState, Mode};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain_data::AssertionChainData;
use crate::config::{AssertionManagerConfig, ConfigError};
use crate::lru_set::LruSet;
use crate::metrics::ManagerMetrics;
use crate::retry::RetryRunner;
use crate::shutdown::Shutdown;

/// Number of fork responses remembered, so that a re-delivered fork is not answered twice.
const RESPONDED_FORKS_CAPACITY: u32 = 1_000;

/// Number of processed assertion hashes remembered across re-scanned block ranges.
const PROCESSED_ASSERTIONS_CAPACITY: u32 = 10_000;

/// Tracks the assertion DAG on behalf of a single validator.
///
/// The manager keeps the branch of assertions the validator agrees with, responds to
/// forks of that branch with rival assertions and challenges, posts the validator's
/// own assertions and confirms the ones it agrees with. Every background task is
/// launched by [`AssertionManager::start`].
pub struct AssertionManager<C: AssertionChain, E: ExecutionProvider> {
    pub(crate) chain: Arc<C>,
    pub(crate) execution: Arc<E>,
    pub(crate) config: AssertionManagerConfig,
    pub(crate) rival_handler: parking_lot::RwLock<Option<Arc<dyn RivalHandler>>>,
    pub(crate) database: Option<Arc<dyn Database>>,
    pub(crate) retry: Arc<RetryRunner>,
    pub(crate) chain_data: RwLock<AssertionChainData>,
    pub(crate) submitted_assertions: LruSet<AssertionHash>,
    pub(crate) confirming: LruSet<AssertionHash>,
    pub(crate) responded_forks: LruSet<AssertionHash>,
    pub(crate) processed_assertions: LruSet<AssertionHash>,
    confirmation_queue_guard: parking_lot::Mutex<()>,
    confirmation_sender: mpsc::Sender<AssertionHash>,
    confirmation_receiver: parking_lot::Mutex<Option<mpsc::Receiver<AssertionHash>>>,
    pub(crate) ready_to_post: watch::Sender<bool>,
    pub(crate) metrics: Arc<ManagerMetrics>,
    started: AtomicBool,
}

/// Builds an [`AssertionManager`] from its collaborators and options.
pub struct AssertionManagerBuilder<C: AssertionChain, E: ExecutionProvider> {
    chain: Arc<C>,
    execution: Arc<E>,
    config: AssertionManagerConfig,
    rival_handler: Option<Arc<dyn RivalHandler>>,
    database: Option<Arc<dyn Database>>,
}

impl<C: AssertionChain, E: ExecutionProvider> AssertionManagerBuilder<C, E> {
    /// Starts from the default configuration.
    pub fn new(chain: Arc<C>, execution: Arc<E>) -> Self {
        Self {
            chain,
            execution,
            config: AssertionManagerConfig::default(),
            rival_handler: None,
            database: None,
        }
    }

    /// Replaces the whole configuration, e.g. one loaded with [`crate::from_toml_path`].
    pub fn config(mut self, config: AssertionManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the name attached to log lines.
    pub fn validator_name(mut self, name: impl Into<String>) -> Self {
        self.config.validator_name = name.into();
        self
    }

    /// Sets the validator mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Never post assertions on a schedule.
    pub fn disable_posting(mut self) -> Self {
        self.config.disable_posting = true;
        self
    }

    /// Try fast confirmation before confirming by time.
    pub fn enable_fast_confirmation(mut self) -> Self {
        self.config.enable_fast_confirmation = true;
        self
    }

    /// Post without waiting for the first sync pass.
    pub fn dangerous_ready_to_post(mut self) -> Self {
        self.config.dangerous_ready_to_post = true;
        self
    }

    /// Become a staker funded by another account on start.
    pub fn delegated_staking(mut self) -> Self {
        self.config.delegated_staking = true;
        self
    }

    /// Do not deposit the required stake on start.
    pub fn disable_auto_deposit(mut self) -> Self {
        self.config.auto_deposit = false;
        self
    }

    /// Do not approve token allowances on start.
    pub fn disable_auto_allowance_approval(mut self) -> Self {
        self.config.auto_allowance_approval = false;
        self
    }

    /// Time between two scheduled posts, unless the last one was an overflow assertion.
    pub fn posting_interval(mut self, interval: Duration) -> Self {
        self.config.posting_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Time between two scans of the chain.
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Time between two confirmation attempts of the same assertion.
    pub fn confirmation_attempt_interval(mut self, interval: Duration) -> Self {
        self.config.confirmation_attempt_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Average block time of the parent chain.
    pub fn average_block_time(mut self, time: Duration) -> Self {
        self.config.average_block_time_ms = time.as_millis() as u64;
        self
    }

    /// Minimum wall-clock time between a parent assertion and a posted child.
    pub fn minimum_gap_to_parent(mut self, gap: Duration) -> Self {
        self.config.minimum_gap_to_parent_ms = gap.as_millis() as u64;
        self
    }

    /// Maximum number of blocks covered by one event query.
    pub fn max_get_log_blocks(mut self, blocks: u64) -> Self {
        self.config.max_get_log_blocks = blocks;
        self
    }

    /// Time between two attempts of a retried chain call.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Mirrors observed assertions to `database`.
    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Hands correct rivals over to `handler`.
    pub fn rival_handler(mut self, handler: Arc<dyn RivalHandler>) -> Self {
        self.rival_handler = Some(handler);
        self
    }

    /// Validates the configuration and builds the manager.
    pub fn build(self) -> Result<AssertionManager<C, E>, ConfigError> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(
            ManagerMetrics::new().map_err(|err| ConfigError::Metrics(err.to_string()))?,
        );
        let retry = Arc::new(RetryRunner::new(
            config.retry_interval(),
            config.ephemeral_error_grace(),
            metrics.clone(),
        ));
        let (confirmation_sender, confirmation_receiver) =
            mpsc::channel(config.confirmation_queue_capacity);
        let (ready_to_post, _) = watch::channel(config.dangerous_ready_to_post);
        let tracked = config.submitted_assertions_capacity;

        Ok(AssertionManager {
            chain: self.chain,
            execution: self.execution,
            rival_handler: parking_lot::RwLock::new(self.rival_handler),
            database: self.database,
            retry,
            chain_data: RwLock::new(AssertionChainData::default()),
            submitted_assertions: LruSet::new(tracked),
            confirming: LruSet::new(tracked),
            responded_forks: LruSet::new(RESPONDED_FORKS_CAPACITY),
            processed_assertions: LruSet::new(PROCESSED_ASSERTIONS_CAPACITY),
            confirmation_queue_guard: parking_lot::Mutex::new(()),
            confirmation_sender,
            confirmation_receiver: parking_lot::Mutex::new(Some(confirmation_receiver)),
            ready_to_post,
            metrics,
            started: AtomicBool::new(false),
            config,
        })
    }
}

impl<C: AssertionChain, E: ExecutionProvider> AssertionManager<C, E> {
    /// Replaces the rival handler. Must be set before forks can be challenged.
    pub fn set_rival_handler(&self, handler: Arc<dyn RivalHandler>) {
        *self.rival_handler.write() = Some(handler);
    }

    /// Runs the staking bootstrap and launches every background task.
    ///
    /// Fails if the manager was already started, or if `shutdown` fires during the
    /// staking bootstrap. Tasks exit once `shutdown` fires.
    pub async fn start(
        self: &Arc<Self>,
        shutdown: Shutdown,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!(
                "Assertion manager of {} was already started",
                self.config.validator_name
            );
        }
        let receiver = self
            .confirmation_receiver
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("Confirmation queue receiver is gone"))?;

        if self.config.mode.supports_staking() {
            self.bootstrap_staking(&shutdown).await?;
        }

        let mut handles = Vec::with_capacity(5);
        if !self.config.disable_posting && self.config.mode.supports_posting_assertions() {
            handles.push(tokio::spawn(
                self.clone().post_assertion_routine(shutdown.clone()),
            ));
        }
        handles.push(tokio::spawn(
            self.clone().update_latest_confirmed_metrics(shutdown.clone()),
        ));
        handles.push(tokio::spawn(self.clone().sync_assertions(shutdown.clone())));
        handles.push(tokio::spawn(
            self.clone()
                .queue_canonical_assertions_for_confirmation(receiver, shutdown.clone()),
        ));
        handles.push(tokio::spawn(self.clone().check_latest_desired_block(shutdown)));

        info!(
            validator = %self.config.validator_name,
            mode = %self.config.mode,
            "Started assertion manager"
        );
        Ok(handles)
    }

    async fn bootstrap_staking(&self, shutdown: &Shutdown) -> anyhow::Result<()> {
        let chain = &*self.chain;
        if self.config.delegated_staking {
            self.retry
                .until_succeeds(shutdown, "new_stake", move || chain.new_stake())
                .await
                .map_err(|err| {
                    anyhow::Error::new(err).context("Could not become a delegated staker onchain")
                })?;
        }
        if self.config.auto_deposit {
            self.retry
                .until_succeeds(shutdown, "auto_deposit_token_for_staking", move || async move {
                    let latest_confirmed = chain.latest_confirmed().await?;
                    let info = chain.read_assertion_creation_info(latest_confirmed).await?;
                    chain.auto_deposit_token_for_staking(info.required_stake).await
                })
                .await
                .map_err(|err| {
                    anyhow::Error::new(err)
                        .context("Could not auto-deposit funds to become a staker")
                })?;
        }
        if self.config.auto_allowance_approval {
            self.retry
                .until_succeeds(shutdown, "approve_allowances", move || {
                    chain.approve_allowances()
                })
                .await
                .map_err(|err| {
                    anyhow::Error::new(err).context("Could not auto-approve allowances")
                })?;
        }
        Ok(())
    }

    /// Warns when the safe head trails the latest head by too much.
    async fn check_latest_desired_block(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.safe_block_check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => return,
            }
            let safe = match self.chain.header_by_number(BlockTag::Safe).await {
                Ok(header) => header,
                Err(err) => {
                    error!("Error getting latest safe block: {:#}", err);
                    continue;
                }
            };
            let latest = match self.chain.header_by_number(BlockTag::Latest).await {
                Ok(header) => header,
                Err(err) => {
                    error!("Error getting latest block: {:#}", err);
                    continue;
                }
            };
            let delay = latest.timestamp.saturating_sub(safe.timestamp);
            if delay > self.config.max_safe_block_delay_secs {
                self.metrics.inc_safe_block_delays();
                warn!(
                    latest_safe_block = safe.number,
                    latest_block = latest.number,
                    delay_secs = delay,
                    "Latest safe block is delayed by more than {} seconds",
                    self.config.max_safe_block_delay_secs
                );
            }
        }
    }

    /// Records the latest confirmed assertion and reports it if this validator disagreed with it.
    async fn update_latest_confirmed_metrics(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => return,
            }
            if let Err(err) = self.check_latest_confirmed().await {
                debug!(
                    validator = %self.config.validator_name,
                    "Could not check the latest confirmed assertion: {:#}",
                    err
                );
            }
        }
    }

    pub(crate) async fn check_latest_confirmed(&self) -> anyhow::Result<()> {
        let latest_confirmed = self.chain.latest_confirmed().await?;
        let info = self
            .chain
            .read_assertion_creation_info(latest_confirmed)
            .await?;
        self.metrics
            .set_latest_confirmed_creation_block(info.creation_block);

        let data = self.chain_data.read().await;
        if data.canonical_parent_of(&info).is_some() && !data.is_canonical(&latest_confirmed) {
            self.metrics.inc_evil_assertions_confirmed();
            error!(
                validator = %self.config.validator_name,
                assertion = %latest_confirmed,
                parent = %info.parent_assertion_hash,
                "An assertion this validator disagrees with was confirmed"
            );
        }
        Ok(())
    }

    /// The state this validator expects a child of `parent` to claim.
    pub async fn execution_state_after_parent(
        &self,
        parent: &AssertionCreatedInfo,
    ) -> Result<ExecutionState, ExecutionError> {
        self.execution
            .execution_state_after_previous_state(
                parent.inbox_max_count,
                &parent.after_state.global_state,
            )
            .await
    }

    /// Hands `assertion_hash` to the confirmation supervisor, unless it is already
    /// being confirmed. Never blocks: if the queue is full the hash is dropped and can
    /// be queued again later.
    pub(crate) fn send_to_confirmation_queue(&self, assertion_hash: AssertionHash, added_by: &str) {
        let _guard = self.confirmation_queue_guard.lock();
        if self.confirming.contains(&assertion_hash) {
            debug!(
                assertion = %assertion_hash,
                added_by,
                "Assertion is already being confirmed"
            );
            return;
        }
        self.confirming.insert(assertion_hash);
        match self.confirmation_sender.try_send(assertion_hash) {
            Ok(()) => {
                debug!(assertion = %assertion_hash, added_by, "Queued assertion for confirmation");
            }
            Err(err) => {
                self.confirming.remove(&assertion_hash);
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "queue is full",
                    mpsc::error::TrySendError::Closed(_) => "queue is closed",
                };
                warn!(
                    validator = %self.config.validator_name,
                    assertion = %assertion_hash,
                    added_by,
                    "Could not queue assertion for confirmation: {}",
                    reason
                );
            }
        }
    }

    /// Saves `infos` to the database in the background, if one is configured.
    pub(crate) fn save_assertions_to_db(
        &self,
        infos: Vec<AssertionCreatedInfo>,
        shutdown: &Shutdown,
    ) {
        let database = match &self.database {
            Some(database) => database.clone(),
            None => return,
        };
        let chain = self.chain.clone();
        let retry = self.retry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            for info in infos {
                let (chain, database, info_ref) = (&*chain, &*database, &info);
                let saved = retry
                    .until_succeeds(&shutdown, "save_assertion_to_db", move || {
                        save_assertion_to_db(chain, database, info_ref)
                    })
                    .await;
                if let Err(err) = saved {
                    error!(
                        assertion = %info.assertion_hash,
                        "Could not save assertion to database: {}",
                        err
                    );
                    return;
                }
            }
        });
    }

    /// Number of forks this manager has responded to.
    pub fn forks_detected(&self) -> u64 {
        self.metrics.forks_detected()
    }

    /// Number of assertions extracted from creation events.
    pub fn assertions_processed(&self) -> u64 {
        self.metrics.assertions_processed()
    }

    /// Number of rivals this manager posted.
    pub fn submitted_rivals(&self) -> u64 {
        self.metrics.submitted_rivals()
    }

    /// Assertions posted by this manager that are still remembered, most recent first.
    pub fn assertions_submitted_in_process(&self) -> Vec<AssertionHash> {
        self.submitted_assertions.items()
    }

    /// The latest assertion this validator agrees with.
    pub async fn latest_agreed_assertion(&self) -> AssertionHash {
        self.chain_data.read().await.latest_agreed()
    }

    /// Returns true if `assertion_hash` is on the branch this validator agrees with.
    pub async fn is_canonical(&self, assertion_hash: &AssertionHash) -> bool {
        self.chain_data.read().await.is_canonical(assertion_hash)
    }

    /// Every assertion on the branch this validator agrees with, in no particular order.
    pub async fn canonical_assertions(&self) -> Vec<AssertionCreatedInfo> {
        self.chain_data
            .read()
            .await
            .canonical_assertions()
            .cloned()
            .collect()
    }

    /// Counters and gauges of this manager.
    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    /// The configuration the manager was built with.
    pub fn config(&self) -> &AssertionManagerConfig {
        &self.config
    }
}

async fn save_assertion_to_db<C: AssertionChain>(
    chain: &C,
    database: &dyn Database,
    info: &AssertionCreatedInfo,
) -> anyhow::Result<()> {
    let node = chain.get_assertion(info.assertion_hash).await?;
    database
        .insert_assertion(&AssertionRecord::new(info, &node))
        .await
}
