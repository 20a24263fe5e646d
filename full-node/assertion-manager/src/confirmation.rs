use std::sync::Arc;

use bold_rollup_interface::services::chain::{AssertionChain, ChainError};
use bold_rollup_interface::services::execution::ExecutionProvider;
use bold_rollup_interface::{AssertionCreatedInfo, AssertionHash, AssertionStatus, BlockTag};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::ephemeral::{log_at, EphemeralErrorHandler, LogLevel, TRANSIENT_TRANSACTION_ERRORS};
use crate::manager::AssertionManager;
use crate::shutdown::Shutdown;

impl<C: AssertionChain, E: ExecutionProvider> AssertionManager<C, E> {
    /// Spawns one confirmation task per queued assertion.
    pub(crate) async fn queue_canonical_assertions_for_confirmation(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<AssertionHash>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let assertion_hash = tokio::select! {
                received = receiver.recv() => match received {
                    Some(hash) => hash,
                    None => return,
                },
                _ = shutdown.wait() => return,
            };
            let manager = self.clone();
            let task_shutdown = shutdown.clone();
            tokio::spawn(async move {
                manager
                    .keep_trying_assertion_confirmation(assertion_hash, task_shutdown)
                    .await
            });
        }
    }

    /// Confirms `assertion_hash`, by fast confirmation if enabled and otherwise once
    /// its confirmation period has elapsed. Gives up for good once the parent has a
    /// second child, as the assertion can then only be confirmed through a challenge.
    pub(crate) async fn keep_trying_assertion_confirmation(
        &self,
        assertion_hash: AssertionHash,
        mut shutdown: Shutdown,
    ) {
        if !self.config.mode.supports_confirming() {
            return;
        }
        let name = &self.config.validator_name;
        let chain = &*self.chain;

        let info = match self
            .retry
            .until_succeeds(&shutdown, "read_assertion_creation_info", move || {
                chain.read_assertion_creation_info(assertion_hash)
            })
            .await
        {
            Ok(info) => info,
            Err(err) => {
                debug!(validator = %name, assertion = %assertion_hash, "Stopped confirming: {}", err);
                return;
            }
        };
        match chain.assertion_status(assertion_hash).await {
            Ok(AssertionStatus::Confirmed) => {
                debug!(validator = %name, assertion = %assertion_hash, "Assertion already confirmed");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(validator = %name, assertion = %assertion_hash, "Could not read assertion status: {:#}", err);
            }
        }
        if self.config.enable_fast_confirmation && self.try_fast_confirm(&info).await {
            return;
        }

        let parent_hash = info.parent_assertion_hash;
        let parent = match self
            .retry
            .until_succeeds(&shutdown, "read_assertion_creation_info", move || {
                chain.read_assertion_creation_info(parent_hash)
            })
            .await
        {
            Ok(parent) => parent,
            Err(err) => {
                debug!(validator = %name, assertion = %assertion_hash, "Stopped confirming: {}", err);
                return;
            }
        };
        let confirmable_at = info
            .creation_block
            .saturating_add(parent.confirm_period_blocks);

        let mut errors = EphemeralErrorHandler::new(
            self.config.ephemeral_error_grace(),
            &TRANSIENT_TRANSACTION_ERRORS,
        );
        let mut ticker = tokio::time::interval(self.config.confirmation_attempt_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => return,
            }
            if self.config.enable_fast_confirmation && self.try_fast_confirm(&info).await {
                return;
            }

            match chain.get_assertion(parent_hash).await {
                Ok(parent_node) if parent_node.has_second_child() => {
                    info!(
                        validator = %name,
                        assertion = %assertion_hash,
                        "Assertion has a rival, it can no longer be confirmed by time"
                    );
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(validator = %name, parent = %parent_hash, "Could not read parent assertion: {:#}", err);
                    continue;
                }
            }
            match chain.assertion_status(assertion_hash).await {
                Ok(AssertionStatus::Confirmed) => {
                    info!(validator = %name, assertion = %assertion_hash, "Assertion was confirmed by someone else");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(validator = %name, assertion = %assertion_hash, "Could not read assertion status: {:#}", err);
                    continue;
                }
            }

            let latest = match chain.header_by_number(BlockTag::Latest).await {
                Ok(header) => header.number,
                Err(err) => {
                    error!(validator = %name, "Could not get latest header: {:#}", err);
                    continue;
                }
            };
            if latest < confirmable_at {
                continue;
            }

            match chain.confirm_assertion_by_time(assertion_hash).await {
                Ok(()) => {
                    self.metrics.inc_assertions_confirmed();
                    errors.reset();
                    info!(
                        validator = %name,
                        assertion = %assertion_hash,
                        batch = info.after_state.global_state.batch,
                        "Confirmed assertion by time"
                    );
                    return;
                }
                Err(err) => {
                    self.metrics.inc_time_confirmation_errors();
                    if ChainError::is_benign_confirmation_error(&err) {
                        debug!(
                            validator = %name,
                            assertion = %assertion_hash,
                            "Assertion cannot be confirmed yet: {:#}",
                            err
                        );
                        continue;
                    }
                    let level = errors.log_level(&err, LogLevel::Error);
                    log_at!(
                        level,
                        validator = %name,
                        assertion = %assertion_hash,
                        "Could not confirm assertion by time: {:#}",
                        err
                    );
                }
            }
        }
    }

    async fn try_fast_confirm(&self, info: &AssertionCreatedInfo) -> bool {
        match self.chain.fast_confirm_assertion(info).await {
            Ok(true) => {
                self.metrics.inc_assertions_confirmed();
                info!(
                    validator = %self.config.validator_name,
                    assertion = %info.assertion_hash,
                    "Fast confirmed assertion"
                );
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(
                    validator = %self.config.validator_name,
                    assertion = %info.assertion_hash,
                    "Could not fast confirm assertion: {:#}",
                    err
                );
                false
            }
        }
    }
}
