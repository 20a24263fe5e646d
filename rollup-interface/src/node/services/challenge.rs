//! The challenge module defines how the validator hands forks over to the challenge manager.
use async_trait::async_trait;

use crate::AssertionHash;

/// Opens challenges against incorrect assertions.
///
/// A validator calls [`RivalHandler::handle_correct_rival`] once it has made sure a
/// correct rival sits on chain next to an incorrect sibling. How the challenge is
/// then played out is up to the handler.
#[async_trait]
pub trait RivalHandler: Send + Sync + 'static {
    /// Notifies the handler that `assertion_hash` is a correct rival of an incorrect assertion.
    async fn handle_correct_rival(&self, assertion_hash: AssertionHash) -> anyhow::Result<()>;
}
