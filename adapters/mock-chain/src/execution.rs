use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bold_rollup_interface::services::execution::{ExecutionError, ExecutionProvider};
use bold_rollup_interface::{ExecutionState, GlobalState, MachineStatus, H256};
use tokio::sync::RwLock;

use crate::chain::hash_bytes;

#[derive(Debug, Default)]
struct ProviderSettings {
    caught_up_batch: Option<u64>,
    max_batches_per_assertion: Option<u64>,
}

/// A deterministic execution provider.
///
/// The state after batch `n` only depends on `n` and on the provider's salt, so
/// honest providers share salt `0` and a provider with another salt disagrees
/// with them on every state.
#[derive(Debug, Clone, Default)]
pub struct MockExecutionProvider {
    salt: u64,
    settings: Arc<RwLock<ProviderSettings>>,
    calls: Arc<AtomicU64>,
}

impl MockExecutionProvider {
    /// Creates an honest provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider that disagrees with honest providers.
    pub fn with_salt(salt: u64) -> Self {
        Self {
            salt,
            ..Default::default()
        }
    }

    /// The finished state this provider computes after consuming `batch` batches.
    pub fn state_at(&self, batch: u64) -> ExecutionState {
        let salt = self.salt.to_be_bytes();
        let batch_bytes = batch.to_be_bytes();
        ExecutionState {
            global_state: GlobalState {
                block_hash: H256::from(hash_bytes(&[b"block", &salt, &batch_bytes])),
                send_root: H256::from(hash_bytes(&[b"send", &salt, &batch_bytes])),
                batch,
                pos_in_batch: 0,
            },
            machine_status: MachineStatus::Finished,
        }
    }

    /// Makes the provider report that it is catching up for any request past `batch`.
    /// `None` means fully synced.
    pub async fn set_caught_up_batch(&self, batch: Option<u64>) {
        self.settings.write().await.caught_up_batch = batch;
    }

    /// Caps the number of batches a single assertion consumes, producing overflow states.
    pub async fn set_max_batches_per_assertion(&self, max: Option<u64>) {
        self.settings.write().await.max_batches_per_assertion = max;
    }

    /// Number of states computed or refused so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExecutionProvider for MockExecutionProvider {
    async fn execution_state_after_previous_state(
        &self,
        max_inbox_count: u64,
        previous_global_state: &GlobalState,
    ) -> Result<ExecutionState, ExecutionError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings.read().await;
        if let Some(caught_up) = settings.caught_up_batch {
            if max_inbox_count > caught_up {
                return Err(ExecutionError::ChainCatchingUp);
            }
        }
        if max_inbox_count < previous_global_state.batch {
            return Err(anyhow::anyhow!(
                "Inbox count {} is behind the previous batch {}",
                max_inbox_count,
                previous_global_state.batch
            )
            .into());
        }
        let batch = match settings.max_batches_per_assertion {
            Some(max) => max_inbox_count.min(previous_global_state.batch + max),
            None => max_inbox_count,
        };
        Ok(self.state_at(batch))
    }
}
