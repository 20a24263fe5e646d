//! The execution module defines how a validator learns which state it should claim.
use async_trait::async_trait;

use crate::{ExecutionState, GlobalState};

/// Errors returned by an [`ExecutionProvider`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The local node has not yet processed enough of the chain to answer.
    /// This is expected while syncing and callers retry later.
    #[error("chain catching up")]
    ChainCatchingUp,
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutionError {
    /// Returns true if the error only means that the provider is behind the chain.
    pub fn is_catching_up(&self) -> bool {
        matches!(self, ExecutionError::ChainCatchingUp)
    }
}

/// Computes the execution state a correct assertion must claim.
#[async_trait]
pub trait ExecutionProvider: Send + Sync + 'static {
    /// Returns the execution state reached by starting from `previous_global_state`
    /// and consuming inbox batches up to `max_inbox_count`.
    async fn execution_state_after_previous_state(
        &self,
        max_inbox_count: u64,
        previous_global_state: &GlobalState,
    ) -> Result<ExecutionState, ExecutionError>;
}
