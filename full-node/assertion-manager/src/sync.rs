use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bold_rollup_interface::services::chain::AssertionChain;
use bold_rollup_interface::services::execution::{ExecutionError, ExecutionProvider};
use bold_rollup_interface::{AssertionCreatedEvent, AssertionCreatedInfo, AssertionHash, BlockTag};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::chain_data::AssertionChainData;
use crate::manager::AssertionManager;
use crate::poster::ParentPost;
use crate::retry::{RetryError, RetryLevels};
use crate::shutdown::Shutdown;

/// An assertion extracted from a creation event, together with its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AssertionAndParent {
    pub(crate) assertion: AssertionCreatedInfo,
    pub(crate) parent: AssertionCreatedInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Agreement {
    Agreed,
    Disagreed,
    Undecided,
}

/// What a canonical-branch walk could not decide.
#[derive(Debug, Default)]
pub(crate) struct CanonicalBranchOutcome {
    /// Candidates whose expected state could not be computed.
    pub(crate) undecided: HashSet<AssertionHash>,
}

impl CanonicalBranchOutcome {
    pub(crate) fn is_complete(&self) -> bool {
        self.undecided.is_empty()
    }
}

/// A fork, as handed to a [`RivalPoster`].
#[derive(Debug, Clone)]
pub(crate) struct RivalPosterArgs {
    pub(crate) canonical_parent: AssertionCreatedInfo,
    pub(crate) invalid_assertion: AssertionCreatedInfo,
    /// The canonical child of `canonical_parent`, if one is already known.
    pub(crate) agreed_sibling: Option<AssertionCreatedInfo>,
}

/// The correct sibling of an invalid assertion.
#[derive(Debug, Clone)]
pub(crate) struct CorrectRival {
    pub(crate) info: AssertionCreatedInfo,
    /// False if the rival was already onchain.
    pub(crate) posted: bool,
}

/// Makes sure a correct rival sits next to an invalid assertion, and challenges it.
#[async_trait]
pub(crate) trait RivalPoster: Send + Sync {
    /// Returns the correct rival, or `None` if nothing should be recorded.
    async fn maybe_post_rival_assertion_and_challenge(
        &self,
        args: RivalPosterArgs,
        shutdown: &Shutdown,
    ) -> anyhow::Result<Option<CorrectRival>>;
}

impl<C: AssertionChain, E: ExecutionProvider> AssertionManager<C, E> {
    /// Seeds the canonical branch with the latest confirmed assertion, then scans the
    /// chain for new assertions once per poll interval.
    pub(crate) async fn sync_assertions(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut from_block = match self.seed_chain_data(&shutdown).await {
            Ok(from_block) => from_block,
            Err(err) => {
                debug!(
                    validator = %self.config.validator_name,
                    "Stopped syncing assertions before bootstrap completed: {}",
                    err
                );
                return;
            }
        };

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => return,
            }
            if let Err(err) = self.sync_once(&mut from_block, &shutdown).await {
                debug!(
                    validator = %self.config.validator_name,
                    "Stopped syncing assertions: {}",
                    err
                );
                return;
            }
        }
    }

    /// Returns the block the first scan starts from.
    pub(crate) async fn seed_chain_data(&self, shutdown: &Shutdown) -> Result<u64, RetryError> {
        let chain = &*self.chain;
        let latest_confirmed = self
            .retry
            .until_succeeds(shutdown, "latest_confirmed", move || chain.latest_confirmed())
            .await?;
        let info = self
            .retry
            .until_succeeds(shutdown, "read_assertion_creation_info", move || {
                chain.read_assertion_creation_info(latest_confirmed)
            })
            .await?;
        let from_block = info.creation_parent_block;

        self.chain_data.write().await.seed(info);
        if !self.config.disable_posting {
            self.ready_to_post.send_replace(true);
        }
        info!(
            validator = %self.config.validator_name,
            from_block,
            "Seeded canonical branch with latest confirmed assertion {}",
            latest_confirmed
        );
        Ok(from_block)
    }

    /// Scans `[from_block, safe head]` in chunks. `from_block` moves past every chunk
    /// that was fully processed.
    pub(crate) async fn sync_once(
        &self,
        from_block: &mut u64,
        shutdown: &Shutdown,
    ) -> Result<(), RetryError> {
        let to_block = match self.chain.header_by_number(BlockTag::Safe).await {
            Ok(header) => header.number,
            Err(err) => {
                error!(
                    validator = %self.config.validator_name,
                    "Could not get header by number: {:#}",
                    err
                );
                return Ok(());
            }
        };
        if to_block < *from_block {
            return Ok(());
        }

        let mut start = *from_block;
        while start <= to_block {
            let end = to_block.min(start.saturating_add(self.config.max_get_log_blocks - 1));
            let complete = self
                .process_all_assertions_in_range(start, end, shutdown)
                .await?;
            if !complete {
                info!(
                    validator = %self.config.validator_name,
                    from_block = start,
                    to_block = end,
                    "Some assertions could not be checked yet, will scan the range again"
                );
                break;
            }
            *from_block = end + 1;
            start = end + 1;
        }
        Ok(())
    }

    /// Processes the assertions created in `[from_block, to_block]`. Returns false if
    /// some of them could not be decided because the execution provider is behind.
    pub(crate) async fn process_all_assertions_in_range(
        &self,
        from_block: u64,
        to_block: u64,
        shutdown: &Shutdown,
    ) -> Result<bool, RetryError> {
        let chain = &*self.chain;
        let events = self
            .retry
            .until_succeeds(shutdown, "assertion_created_events", move || {
                chain.assertion_created_events(from_block, to_block)
            })
            .await?;

        let mut known: HashMap<AssertionHash, AssertionCreatedInfo> = HashMap::new();
        let mut assertions = Vec::with_capacity(events.len());
        let mut first_seen = Vec::new();
        for event in &events {
            let extracted = self
                .retry
                .until_succeeds(shutdown, "extract_assertion_from_event", move || {
                    self.extract_assertion_from_event(event)
                })
                .await?;
            let assertion = match extracted {
                Some(assertion) => assertion,
                None => continue,
            };
            // Ranges are scanned again after an undecided pass.
            if self.processed_assertions.insert(assertion.assertion_hash) {
                self.metrics.inc_assertions_processed();
                first_seen.push(assertion.clone());
            }

            let parent_hash = assertion.parent_assertion_hash;
            let parent = match known.get(&parent_hash) {
                Some(parent) => parent.clone(),
                None => {
                    let parent = self
                        .retry
                        .until_succeeds(shutdown, "read_assertion_creation_info", move || {
                            chain.read_assertion_creation_info(parent_hash)
                        })
                        .await?;
                    known.insert(parent_hash, parent.clone());
                    parent
                }
            };
            known.insert(assertion.assertion_hash, assertion.clone());
            assertions.push(AssertionAndParent { assertion, parent });
        }
        if assertions.is_empty() {
            return Ok(true);
        }
        debug!(
            validator = %self.config.validator_name,
            from_block,
            to_block,
            count = assertions.len(),
            "Processing assertions"
        );

        if !first_seen.is_empty() {
            self.save_assertions_to_db(first_seen, shutdown);
        }

        let mut data = self.chain_data.write().await;
        let outcome = self
            .find_canonical_assertion_branch(&mut data, &assertions, shutdown)
            .await?;
        self.respond_to_any_invalid_assertions(&mut data, &assertions, &outcome, self, shutdown)
            .await?;
        Ok(outcome.is_complete())
    }

    /// Reads the creation info of the assertion behind `event`. Zero hashes and the
    /// genesis assertion yield `None`.
    async fn extract_assertion_from_event(
        &self,
        event: &AssertionCreatedEvent,
    ) -> anyhow::Result<Option<AssertionCreatedInfo>> {
        if event.assertion_hash.is_zero() {
            warn!(
                validator = %self.config.validator_name,
                block = event.block_number,
                "Assertion created event has a zero hash"
            );
            return Ok(None);
        }
        let info = self
            .chain
            .read_assertion_creation_info(event.assertion_hash)
            .await?;
        if info.is_genesis() {
            return Ok(None);
        }
        Ok(Some(info))
    }

    /// Walks the agreed-with branch through `assertions`, in creation order, starting
    /// from the latest agreed assertion.
    pub(crate) async fn find_canonical_assertion_branch(
        &self,
        data: &mut AssertionChainData,
        assertions: &[AssertionAndParent],
        shutdown: &Shutdown,
    ) -> Result<CanonicalBranchOutcome, RetryError> {
        let mut cursor = data.latest_agreed();
        let mut outcome = CanonicalBranchOutcome::default();
        for item in assertions {
            let assertion = &item.assertion;
            if assertion.parent_assertion_hash != cursor {
                continue;
            }
            match self.agreement_with(item, shutdown).await? {
                Agreement::Agreed => {
                    cursor = assertion.assertion_hash;
                    data.set_agreed(assertion.clone());
                    info!(
                        validator = %self.config.validator_name,
                        assertion = %cursor,
                        batch = assertion.after_state.global_state.batch,
                        "Agreed with assertion"
                    );
                    self.send_to_confirmation_queue(cursor, "find_canonical_assertion_branch");
                }
                Agreement::Disagreed => {}
                Agreement::Undecided => {
                    outcome.undecided.insert(assertion.assertion_hash);
                }
            }
        }
        Ok(outcome)
    }

    async fn agreement_with(
        &self,
        item: &AssertionAndParent,
        shutdown: &Shutdown,
    ) -> Result<Agreement, RetryError> {
        let attempts = self.config.catching_up_attempts.max(1);
        let parent = &item.parent;
        let levels = RetryLevels {
            info: None,
            warning: Some("could not check if we have result at count"),
        };
        let mut sleeper = shutdown.clone();
        for attempt in 1..=attempts {
            let expected = self
                .retry
                .until_succeeds_with(
                    shutdown,
                    "execution_state_after_parent",
                    levels,
                    move || async move {
                        match self.execution_state_after_parent(parent).await {
                            Ok(state) => Ok(Some(state)),
                            Err(ExecutionError::ChainCatchingUp) => Ok(None),
                            Err(ExecutionError::Other(err)) => Err(err),
                        }
                    },
                )
                .await?;
            match expected {
                Some(state) if state == item.assertion.after_state => return Ok(Agreement::Agreed),
                Some(_) => return Ok(Agreement::Disagreed),
                None => {
                    self.metrics.inc_chain_catching_up();
                    info!(
                        validator = %self.config.validator_name,
                        assertion = %item.assertion.assertion_hash,
                        attempt,
                        "Chain still syncing, will reattempt processing when caught up"
                    );
                    if attempt < attempts
                        && !sleeper.sleep(self.config.average_block_time() / 10).await
                    {
                        return Err(RetryError::cancelled(
                            attempt as u64,
                            "execution provider catching up",
                        ));
                    }
                }
            }
        }
        Ok(Agreement::Undecided)
    }

    /// Responds to every decided assertion whose parent is canonical while the
    /// assertion itself is not.
    pub(crate) async fn respond_to_any_invalid_assertions(
        &self,
        data: &mut AssertionChainData,
        assertions: &[AssertionAndParent],
        outcome: &CanonicalBranchOutcome,
        rival_poster: &dyn RivalPoster,
        shutdown: &Shutdown,
    ) -> Result<(), RetryError> {
        for item in assertions {
            let assertion = &item.assertion;
            let hash = assertion.assertion_hash;
            if outcome.undecided.contains(&hash) || data.is_canonical(&hash) {
                continue;
            }
            let canonical_parent = match data.canonical_parent_of(assertion) {
                Some(parent) => parent.clone(),
                None => continue,
            };
            if self.responded_forks.contains(&hash) {
                debug!(
                    validator = %self.config.validator_name,
                    assertion = %hash,
                    "Already responded to fork"
                );
                continue;
            }

            self.metrics.inc_forks_detected();
            let args = RivalPosterArgs {
                agreed_sibling: data
                    .canonical_child_of(&canonical_parent.assertion_hash)
                    .cloned(),
                canonical_parent,
                invalid_assertion: assertion.clone(),
            };
            let args = &args;
            let name = self.config.validator_name.as_str();
            let rival = self
                .retry
                .until_succeeds(
                    shutdown,
                    "maybe_post_rival_assertion_and_challenge",
                    move || async move {
                        rival_poster
                            .maybe_post_rival_assertion_and_challenge(args.clone(), shutdown)
                            .await
                            .map_err(|err| {
                                err.context(format!(
                                    "validator={} could not post rival assertion and/or challenge",
                                    name
                                ))
                            })
                    },
                )
                .await?;

            match rival {
                Some(rival) => {
                    self.responded_forks.insert(hash);
                    let rival_hash = rival.info.assertion_hash;
                    if data.insert_canonical(rival.info) {
                        if rival.posted {
                            self.submitted_assertions.insert(rival_hash);
                            self.metrics.inc_submitted_rivals();
                        }
                        self.send_to_confirmation_queue(
                            rival_hash,
                            "respond_to_any_invalid_assertions",
                        );
                    }
                }
                None if !self.config.mode.supports_posting_rivals() => {
                    self.responded_forks.insert(hash);
                }
                None => {
                    debug!(
                        validator = %self.config.validator_name,
                        assertion = %hash,
                        "No correct rival for fork yet, it will be answered when seen again"
                    );
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<C: AssertionChain, E: ExecutionProvider> RivalPoster for AssertionManager<C, E> {
    async fn maybe_post_rival_assertion_and_challenge(
        &self,
        args: RivalPosterArgs,
        shutdown: &Shutdown,
    ) -> anyhow::Result<Option<CorrectRival>> {
        let RivalPosterArgs {
            canonical_parent,
            invalid_assertion,
            agreed_sibling,
        } = args;
        if canonical_parent.assertion_hash != invalid_assertion.parent_assertion_hash {
            anyhow::bail!(
                "Invalid assertion {} does not descend from canonical parent {}",
                invalid_assertion.assertion_hash,
                canonical_parent.assertion_hash
            );
        }
        let name = &self.config.validator_name;
        if !self.config.mode.supports_posting_rivals() {
            self.metrics.inc_evil_assertions();
            warn!(
                validator = %name,
                assertion = %invalid_assertion.assertion_hash,
                parent = %canonical_parent.assertion_hash,
                "Detected invalid assertion, but not configured to post a rival stake"
            );
            return Ok(None);
        }
        warn!(
            validator = %name,
            assertion = %invalid_assertion.assertion_hash,
            parent = %canonical_parent.assertion_hash,
            "Disagreed with an observed assertion onchain"
        );

        let rival = match agreed_sibling {
            Some(sibling) => {
                info!(
                    validator = %name,
                    rival = %sibling.assertion_hash,
                    "Correct rival of {} is already onchain",
                    invalid_assertion.assertion_hash
                );
                CorrectRival {
                    info: sibling,
                    posted: false,
                }
            }
            None => match self
                .maybe_post_rival_assertion(&canonical_parent, shutdown)
                .await?
            {
                Some(posted) => posted,
                None => {
                    warn!(
                        validator = %name,
                        assertion = %invalid_assertion.assertion_hash,
                        "Expected to post a rival assertion, but did not post anything"
                    );
                    return Ok(None);
                }
            },
        };

        if !self.config.mode.supports_posting_challenges() {
            warn!(
                validator = %name,
                rival = %rival.info.assertion_hash,
                "Rival assertion is onchain, but not configured to initiate a challenge"
            );
            return Ok(Some(rival));
        }

        let configured = self.chain.challenge_manager_address();
        if canonical_parent.challenge_manager != configured {
            warn!(
                validator = %name,
                parent = %canonical_parent.assertion_hash,
                recorded = ?canonical_parent.challenge_manager,
                configured = ?configured,
                "Challenge manager of the canonical parent does not match the configured one, not opening a challenge"
            );
            return Ok(Some(rival));
        }

        let handler = self.rival_handler.read().clone();
        match handler {
            Some(handler) => {
                let (handler, rival_hash) = (&*handler, rival.info.assertion_hash);
                self.retry
                    .until_succeeds(shutdown, "handle_correct_rival", move || {
                        handler.handle_correct_rival(rival_hash)
                    })
                    .await?;
                info!(
                    validator = %name,
                    rival = %rival_hash,
                    "Handed correct rival over to the challenge manager"
                );
            }
            None => {
                error!(
                    validator = %name,
                    rival = %rival.info.assertion_hash,
                    "Rival assertion is onchain, but no rival handler is set to open a challenge"
                );
            }
        }
        Ok(Some(rival))
    }
}

impl<C: AssertionChain, E: ExecutionProvider> AssertionManager<C, E> {
    /// Posts the assertion this validator expects on top of `parent`, or finds it if
    /// someone else already posted it.
    async fn maybe_post_rival_assertion(
        &self,
        parent: &AssertionCreatedInfo,
        shutdown: &Shutdown,
    ) -> anyhow::Result<Option<CorrectRival>> {
        let staked = self.chain.is_staked().await?;
        let rival = match self
            .post_assertion_based_on_parent(parent, staked, shutdown)
            .await?
        {
            ParentPost::Posted(handle) => {
                info!(
                    validator = %self.config.validator_name,
                    rival = %handle.info.assertion_hash,
                    parent = %parent.assertion_hash,
                    "Posted rival assertion to another that we disagreed with"
                );
                CorrectRival {
                    info: handle.info,
                    posted: true,
                }
            }
            ParentPost::AlreadyOnchain(info) => {
                info!(
                    validator = %self.config.validator_name,
                    rival = %info.assertion_hash,
                    parent = %parent.assertion_hash,
                    "Rival assertion was already posted by someone else"
                );
                CorrectRival {
                    info,
                    posted: false,
                }
            }
            ParentPost::Skipped => return Ok(None),
        };
        Ok(Some(rival))
    }
}
