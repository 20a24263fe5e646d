use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bold_rollup_interface::services::chain::{AssertionChain, ChainError};
use bold_rollup_interface::services::execution::{ExecutionError, ExecutionProvider};
use bold_rollup_interface::{AssertionCreatedInfo, AssertionHash, BlockTag};
use tracing::{debug, info};

use crate::ephemeral::{log_at, EphemeralErrorHandler, LogLevel, TRANSIENT_TRANSACTION_ERRORS};
use crate::manager::AssertionManager;
use crate::shutdown::Shutdown;

/// An assertion this validator posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionHandle {
    /// Creation info of the posted assertion.
    pub info: AssertionCreatedInfo,
    /// Whether the assertion could not consume every batch its parent required.
    pub is_overflow: bool,
}

impl AssertionHandle {
    /// The hash of the posted assertion.
    pub fn hash(&self) -> AssertionHash {
        self.info.assertion_hash
    }
}

/// Result of trying to post the child of a parent.
#[derive(Debug)]
pub(crate) enum ParentPost {
    /// This validator posted the child.
    Posted(AssertionHandle),
    /// The expected child was already onchain.
    AlreadyOnchain(AssertionCreatedInfo),
    /// Nothing was posted: the provider is catching up or shutdown fired.
    Skipped,
}

impl<C: AssertionChain, E: ExecutionProvider> AssertionManager<C, E> {
    /// Posts the validator's own assertion once per posting interval, as soon as the
    /// canonical branch has been seeded.
    pub(crate) async fn post_assertion_routine(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ready = self.ready_to_post.subscribe();
        loop {
            if *ready.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.wait() => return,
            }
        }
        info!(
            validator = %self.config.validator_name,
            "Ready to post assertions"
        );

        let mut errors = EphemeralErrorHandler::new(
            self.config.ephemeral_error_grace(),
            &TRANSIENT_TRANSACTION_ERRORS,
        );
        loop {
            match self.post_assertion(&shutdown).await {
                Ok(Some(handle)) => {
                    errors.reset();
                    if handle.is_overflow {
                        debug!(
                            validator = %self.config.validator_name,
                            assertion = %handle.hash(),
                            "Posted an overflow assertion, posting the next one right away"
                        );
                        continue;
                    }
                }
                Ok(None) => errors.reset(),
                Err(err) => {
                    let level = errors.log_level(&err, LogLevel::Error);
                    log_at!(
                        level,
                        validator = %self.config.validator_name,
                        "Could not post assertion: {:#}",
                        err
                    );
                }
            }
            if !shutdown.sleep(self.config.posting_interval()).await {
                return;
            }
        }
    }

    /// Posts the assertion this validator expects on top of the latest assertion it
    /// agrees with.
    ///
    /// Returns `None` without an error if the execution provider is still catching
    /// up, if the assertion already exists, or if `shutdown` fired before posting.
    pub async fn post_assertion(
        &self,
        shutdown: &Shutdown,
    ) -> anyhow::Result<Option<AssertionHandle>> {
        let latest_agreed = self.chain_data.read().await.latest_agreed_info().cloned();
        let parent = match latest_agreed {
            Some(parent) => parent,
            None => {
                // Only reachable when posting before the first sync pass.
                let latest_confirmed = self.chain.latest_confirmed().await?;
                self.chain
                    .read_assertion_creation_info(latest_confirmed)
                    .await?
            }
        };

        let staked = self.chain.is_staked().await?;
        let handle = match self
            .post_assertion_based_on_parent(&parent, staked, shutdown)
            .await?
        {
            ParentPost::Posted(handle) => handle,
            ParentPost::AlreadyOnchain(_) | ParentPost::Skipped => return Ok(None),
        };

        let hash = handle.hash();
        self.submitted_assertions.insert(hash);
        self.metrics.inc_assertions_posted();
        {
            let mut data = self.chain_data.write().await;
            if data.latest_agreed() == parent.assertion_hash {
                data.set_agreed(handle.info.clone());
            } else {
                data.insert_canonical(handle.info.clone());
            }
        }
        self.send_to_confirmation_queue(hash, "post_assertion");
        Ok(Some(handle))
    }

    /// Computes the state following `parent`, waits until posting a child of `parent`
    /// is allowed, and posts it. If that child already exists, returns its creation
    /// info instead.
    pub(crate) async fn post_assertion_based_on_parent(
        &self,
        parent: &AssertionCreatedInfo,
        staked: bool,
        shutdown: &Shutdown,
    ) -> anyhow::Result<ParentPost> {
        let new_state = match self.execution_state_after_parent(parent).await {
            Ok(state) => state,
            Err(ExecutionError::ChainCatchingUp) => {
                self.metrics.inc_chain_catching_up();
                info!(
                    validator = %self.config.validator_name,
                    parent = %parent.assertion_hash,
                    inbox_max_count = parent.inbox_max_count,
                    "No available batch to post as assertion, waiting for more batches"
                );
                shutdown
                    .clone()
                    .sleep(self.config.average_block_time() / 10)
                    .await;
                return Ok(ParentPost::Skipped);
            }
            Err(ExecutionError::Other(err)) => {
                return Err(err.context(format!(
                    "could not get execution state at inbox count {} after parent {}",
                    parent.inbox_max_count, parent.assertion_hash
                )))
            }
        };

        let is_overflow = new_state.is_overflow(parent.inbox_max_count);
        if !is_overflow && !self.wait_for_posting_window(parent, shutdown).await? {
            return Ok(ParentPost::Skipped);
        }
        if shutdown.is_shutdown() {
            return Ok(ParentPost::Skipped);
        }

        let submitted = if staked {
            self.chain.stake_on_new_assertion(parent, &new_state).await
        } else {
            self.chain.new_stake_on_new_assertion(parent, &new_state).await
        };
        let hash = match submitted {
            Ok(hash) => hash,
            Err(err) if ChainError::is_already_exists(&err) => {
                info!(
                    validator = %self.config.validator_name,
                    parent = %parent.assertion_hash,
                    batch = new_state.global_state.batch,
                    "Assertion already exists onchain, not posting"
                );
                let chain = &*self.chain;
                let state = &new_state;
                let existing = self
                    .retry
                    .until_succeeds(shutdown, "read_existing_assertion", move || async move {
                        let hash = chain.compute_assertion_hash(parent, state).await?;
                        chain.read_assertion_creation_info(hash).await
                    })
                    .await?;
                return Ok(ParentPost::AlreadyOnchain(existing));
            }
            Err(err) => return Err(err.context("could not create assertion")),
        };

        let chain = &*self.chain;
        let info = self
            .retry
            .until_succeeds(shutdown, "read_assertion_creation_info", move || {
                chain.read_assertion_creation_info(hash)
            })
            .await?;
        self.save_assertions_to_db(vec![info.clone()], shutdown);
        info!(
            validator = %self.config.validator_name,
            assertion = %hash,
            parent = %parent.assertion_hash,
            batch = new_state.global_state.batch,
            overflow = is_overflow,
            "Submitted assertion"
        );
        Ok(ParentPost::Posted(AssertionHandle { info, is_overflow }))
    }

    /// Waits until the minimum gap and the minimum number of blocks since `parent`
    /// have elapsed. Returns false if `shutdown` fired first.
    async fn wait_for_posting_window(
        &self,
        parent: &AssertionCreatedInfo,
        shutdown: &Shutdown,
    ) -> anyhow::Result<bool> {
        let mut shutdown = shutdown.clone();
        let parent_header = self
            .chain
            .header_by_number(BlockTag::Number(parent.creation_parent_block))
            .await?;
        let earliest = UNIX_EPOCH
            + Duration::from_secs(parent_header.timestamp)
            + self.config.minimum_gap_to_parent();
        if let Ok(remaining) = earliest.duration_since(SystemTime::now()) {
            if !remaining.is_zero() {
                info!(
                    validator = %self.config.validator_name,
                    parent = %parent.assertion_hash,
                    "Waiting {:?} since the parent assertion was created before posting",
                    remaining
                );
                if !shutdown.sleep(remaining).await {
                    return Ok(false);
                }
            }
        }

        let min_period = self.chain.min_assertion_period_blocks().await?;
        let required = parent.creation_parent_block.saturating_add(min_period);
        loop {
            let latest = self.chain.header_by_number(BlockTag::Latest).await?;
            if latest.number >= required {
                return Ok(true);
            }
            debug!(
                validator = %self.config.validator_name,
                latest_block = latest.number,
                required_block = required,
                "Waiting for the minimum assertion period to elapse"
            );
            if !shutdown.sleep(self.config.average_block_time()).await {
                return Ok(false);
            }
        }
    }
}
