//! The chain module defines the interface a validator uses to read assertions from,
//! and submit transactions to, the parent chain.
use async_trait::async_trait;
use ethereum_types::{Address, U256};

use crate::{
    AssertionCreatedEvent, AssertionCreatedInfo, AssertionHash, AssertionNode, AssertionStatus,
    BlockHeader, BlockTag, ExecutionState,
};

/// Well-known outcomes of chain calls that validators must tell apart from real failures.
///
/// Implementations of [`AssertionChain`] should return these wrapped in an
/// [`anyhow::Error`]. Errors that come straight from an RPC endpoint are still
/// recognised through [`ChainError::classify`] by their revert reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The assertion being created is already on chain.
    #[error("item already exists on-chain")]
    AlreadyExists,
    /// The confirmation deadline of the assertion has not passed yet.
    #[error("BEFORE_DEADLINE")]
    BeforeDeadline,
    /// The parent of the assertion being confirmed is not the latest confirmed assertion.
    #[error("parent assertion is not the latest confirmed assertion")]
    NotLatestConfirmed,
    /// The requested item does not exist.
    #[error("item not found on-chain")]
    NotFound,
}

impl ChainError {
    /// Tries to recognise a well-known chain outcome in an arbitrary error.
    pub fn classify(err: &anyhow::Error) -> Option<ChainError> {
        if let Some(known) = err.chain().find_map(|e| e.downcast_ref::<ChainError>()) {
            return Some(*known);
        }
        let message = format!("{:#}", err);
        if message.contains("item already exists on-chain") || message.contains("ASSERTION_SEEN")
        {
            Some(ChainError::AlreadyExists)
        } else if message.contains("BEFORE_DEADLINE") {
            Some(ChainError::BeforeDeadline)
        } else if message.contains("is not the latest confirmed assertion") {
            Some(ChainError::NotLatestConfirmed)
        } else {
            None
        }
    }

    /// Returns true if `err` reports that an assertion already exists on chain.
    pub fn is_already_exists(err: &anyhow::Error) -> bool {
        Self::classify(err) == Some(ChainError::AlreadyExists)
    }

    /// Returns true if `err` is an expected rejection of a time-based confirmation attempt.
    pub fn is_benign_confirmation_error(err: &anyhow::Error) -> bool {
        matches!(
            Self::classify(err),
            Some(ChainError::BeforeDeadline) | Some(ChainError::NotLatestConfirmed)
        )
    }
}

/// The local side of a connection to the parent chain, scoped to the rollup's
/// assertion contract.
///
/// Every method may fail transiently. Callers retry them, so implementations
/// should not retry internally.
#[async_trait]
pub trait AssertionChain: Send + Sync + 'static {
    /// The hash of the latest confirmed assertion.
    async fn latest_confirmed(&self) -> anyhow::Result<AssertionHash>;

    /// Reads the information emitted when the assertion was created.
    async fn read_assertion_creation_info(
        &self,
        assertion_hash: AssertionHash,
    ) -> anyhow::Result<AssertionCreatedInfo>;

    /// Reads the current bookkeeping of an assertion.
    async fn get_assertion(&self, assertion_hash: AssertionHash) -> anyhow::Result<AssertionNode>;

    /// Reads the status of an assertion.
    async fn assertion_status(
        &self,
        assertion_hash: AssertionHash,
    ) -> anyhow::Result<AssertionStatus>;

    /// Fetches a block header.
    async fn header_by_number(&self, tag: BlockTag) -> anyhow::Result<BlockHeader>;

    /// Fetches every `AssertionCreated` event emitted in the inclusive block range
    /// `[from_block, to_block]`, in the order they were emitted.
    async fn assertion_created_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<AssertionCreatedEvent>>;

    /// Computes the hash of the assertion claiming `after_state` on top of `parent`,
    /// whether or not that assertion exists.
    async fn compute_assertion_hash(
        &self,
        parent: &AssertionCreatedInfo,
        after_state: &ExecutionState,
    ) -> anyhow::Result<AssertionHash>;

    /// Whether this validator currently holds a stake.
    async fn is_staked(&self) -> anyhow::Result<bool>;

    /// Becomes a staker without creating an assertion. Used when the stake is funded
    /// by someone else.
    async fn new_stake(&self) -> anyhow::Result<()>;

    /// Creates a new stake and, with it, a new assertion on top of `parent`.
    async fn new_stake_on_new_assertion(
        &self,
        parent: &AssertionCreatedInfo,
        after_state: &ExecutionState,
    ) -> anyhow::Result<AssertionHash>;

    /// Moves this validator's existing stake to a new assertion on top of `parent`.
    async fn stake_on_new_assertion(
        &self,
        parent: &AssertionCreatedInfo,
        after_state: &ExecutionState,
    ) -> anyhow::Result<AssertionHash>;

    /// Attempts to confirm an assertion through the fast-confirmation path.
    /// Returns `true` once the assertion is confirmed.
    async fn fast_confirm_assertion(&self, info: &AssertionCreatedInfo) -> anyhow::Result<bool>;

    /// Confirms an assertion whose confirmation period has elapsed without a rival.
    async fn confirm_assertion_by_time(&self, assertion_hash: AssertionHash) -> anyhow::Result<()>;

    /// Deposits enough of the staking token to cover `amount`.
    async fn auto_deposit_token_for_staking(&self, amount: U256) -> anyhow::Result<()>;

    /// Approves the rollup and challenge manager contracts to spend the staking token.
    async fn approve_allowances(&self) -> anyhow::Result<()>;

    /// The minimum number of blocks between an assertion and its child.
    async fn min_assertion_period_blocks(&self) -> anyhow::Result<u64>;

    /// The challenge manager this validator is configured to play challenges in.
    fn challenge_manager_address(&self) -> Address;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_typed_errors_through_context() {
        let err = anyhow::Error::new(ChainError::AlreadyExists).context("posting assertion");
        assert!(ChainError::is_already_exists(&err));
        assert!(!ChainError::is_benign_confirmation_error(&err));
    }

    #[test]
    fn classifies_raw_revert_reasons() {
        let err = anyhow::anyhow!("execution reverted: BEFORE_DEADLINE");
        assert_eq!(ChainError::classify(&err), Some(ChainError::BeforeDeadline));

        let err = anyhow::anyhow!("parent 0x01 is not the latest confirmed assertion");
        assert!(ChainError::is_benign_confirmation_error(&err));

        let err = anyhow::anyhow!("connection refused");
        assert_eq!(ChainError::classify(&err), None);
    }
}
