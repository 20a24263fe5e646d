//! The db module defines the optional store validators mirror assertions to.
use async_trait::async_trait;
use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::{AssertionCreatedInfo, AssertionHash, AssertionNode, AssertionStatus, MachineStatus};

/// A flattened view of an assertion, suitable for offline analysis.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionRecord {
    pub hash: AssertionHash,
    pub confirm_period_blocks: u64,
    pub required_stake: U256,
    pub parent_assertion_hash: AssertionHash,
    pub inbox_max_count: u64,
    pub after_inbox_batch_acc: H256,
    pub wasm_module_root: H256,
    pub challenge_manager: Address,
    pub creation_block: u64,
    pub transaction_hash: H256,
    pub before_state_block_hash: H256,
    pub before_state_send_root: H256,
    pub before_state_batch: u64,
    pub before_state_pos_in_batch: u64,
    pub before_state_machine_status: MachineStatus,
    pub after_state_block_hash: H256,
    pub after_state_send_root: H256,
    pub after_state_batch: u64,
    pub after_state_pos_in_batch: u64,
    pub after_state_machine_status: MachineStatus,
    pub first_child_block: Option<u64>,
    pub second_child_block: Option<u64>,
    pub is_first_child: bool,
    pub status: AssertionStatus,
}

impl AssertionRecord {
    /// Builds a record from the creation info of an assertion and its current node.
    pub fn new(info: &AssertionCreatedInfo, node: &AssertionNode) -> Self {
        let before = &info.before_state;
        let after = &info.after_state;
        Self {
            hash: info.assertion_hash,
            confirm_period_blocks: info.confirm_period_blocks,
            required_stake: info.required_stake,
            parent_assertion_hash: info.parent_assertion_hash,
            inbox_max_count: info.inbox_max_count,
            after_inbox_batch_acc: info.after_inbox_batch_acc,
            wasm_module_root: info.wasm_module_root,
            challenge_manager: info.challenge_manager,
            creation_block: info.creation_block,
            transaction_hash: info.transaction_hash,
            before_state_block_hash: before.global_state.block_hash,
            before_state_send_root: before.global_state.send_root,
            before_state_batch: before.global_state.batch,
            before_state_pos_in_batch: before.global_state.pos_in_batch,
            before_state_machine_status: before.machine_status,
            after_state_block_hash: after.global_state.block_hash,
            after_state_send_root: after.global_state.send_root,
            after_state_batch: after.global_state.batch,
            after_state_pos_in_batch: after.global_state.pos_in_batch,
            after_state_machine_status: after.machine_status,
            first_child_block: node.first_child_block,
            second_child_block: node.second_child_block,
            is_first_child: node.is_first_child,
            status: node.status,
        }
    }
}

/// A best-effort store of observed assertions.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Inserts or replaces the record of an assertion.
    async fn insert_assertion(&self, record: &AssertionRecord) -> anyhow::Result<()>;
}
