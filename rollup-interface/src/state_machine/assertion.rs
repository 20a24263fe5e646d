//! Assertions are claims, posted on the parent chain, that after processing some
//! number of inbox batches the rollup reaches a specific execution state.
//! Every assertion except genesis points to a parent, forming an append-only DAG.
use std::fmt::{self, Debug, Display, Formatter};

use ethereum_types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

/// The content identifier of an assertion.
///
/// Assertion hashes carry no ordering of their own: the only meaningful order
/// between two assertions is their position in the DAG.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AssertionHash(pub H256);

impl AssertionHash {
    /// The zero hash. No assertion, not even genesis, has this hash.
    pub const fn zero() -> Self {
        Self(H256::zero())
    }

    /// Returns true if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The raw bytes of the hash.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Debug for AssertionHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl Display for AssertionHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl From<H256> for AssertionHash {
    fn from(value: H256) -> Self {
        Self(value)
    }
}

impl From<[u8; 32]> for AssertionHash {
    fn from(value: [u8; 32]) -> Self {
        Self(H256::from(value))
    }
}

impl AsRef<[u8]> for AssertionHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// The status of the machine once it stopped executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineStatus {
    /// The machine is still executing.
    Running,
    /// The machine finished executing the claimed inputs.
    #[default]
    Finished,
    /// The machine hit an error.
    Errored,
    /// The machine was asked to execute past the available inputs.
    TooFar,
}

impl Display for MachineStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let status = match self {
            MachineStatus::Running => "running",
            MachineStatus::Finished => "finished",
            MachineStatus::Errored => "errored",
            MachineStatus::TooFar => "too_far",
        };
        f.write_str(status)
    }
}

/// The position of the rollup inside its inbox, together with the roots it commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GlobalState {
    /// Hash of the last rollup block produced.
    pub block_hash: H256,
    /// Root of the outgoing message tree.
    pub send_root: H256,
    /// Index of the inbox batch being processed.
    pub batch: u64,
    /// Position inside the batch.
    pub pos_in_batch: u64,
}

/// A claimed machine state.
///
/// Two execution states are equal iff every field matches exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Where the machine stopped.
    pub global_state: GlobalState,
    /// How the machine stopped.
    pub machine_status: MachineStatus,
}

impl ExecutionState {
    /// Returns true if an assertion claiming this state, posted on top of a parent
    /// that requires `required_inbox_max_count` batches, is an overflow assertion.
    ///
    /// Overflow assertions could not consume every batch the parent required and
    /// are exempt from the minimum posting gap.
    pub fn is_overflow(&self, required_inbox_max_count: u64) -> bool {
        self.machine_status != MachineStatus::Errored
            && self.global_state.batch < required_inbox_max_count
    }
}

/// Everything a validator needs to know about an assertion, as emitted at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionCreatedInfo {
    /// The hash of this assertion.
    pub assertion_hash: AssertionHash,
    /// The hash of the parent assertion. Zero for genesis.
    pub parent_assertion_hash: AssertionHash,
    /// The state the parent claimed.
    pub before_state: ExecutionState,
    /// The state this assertion claims.
    pub after_state: ExecutionState,
    /// The number of inbox batches a child of this assertion must process.
    pub inbox_max_count: u64,
    /// Accumulator of the inbox after the last batch consumed.
    pub after_inbox_batch_acc: H256,
    /// Number of blocks a child of this assertion waits before time-based confirmation.
    pub confirm_period_blocks: u64,
    /// Block in which the assertion was created.
    pub creation_block: u64,
    /// Parent chain block in which the assertion was created.
    pub creation_parent_block: u64,
    /// The challenge manager responsible for disputes over children of this assertion.
    pub challenge_manager: Address,
    /// Stake required to create a child of this assertion.
    pub required_stake: U256,
    /// Hash of the transaction that created the assertion.
    pub transaction_hash: H256,
    /// The WASM module root used to execute the rollup.
    pub wasm_module_root: H256,
}

impl AssertionCreatedInfo {
    /// Returns true if this assertion has no parent.
    pub fn is_genesis(&self) -> bool {
        self.parent_assertion_hash.is_zero()
    }
}

/// On-chain status of an assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssertionStatus {
    /// No assertion exists with the requested hash.
    NoAssertion,
    /// The assertion exists but has not been confirmed.
    Pending,
    /// The assertion has been confirmed.
    Confirmed,
}

impl Display for AssertionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let status = match self {
            AssertionStatus::NoAssertion => "no_assertion",
            AssertionStatus::Pending => "pending",
            AssertionStatus::Confirmed => "confirmed",
        };
        f.write_str(status)
    }
}

/// Mutable, on-chain bookkeeping of an assertion's position in the DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionNode {
    /// The hash of the assertion.
    pub assertion_hash: AssertionHash,
    /// Current status.
    pub status: AssertionStatus,
    /// Block in which the first child was created, if any.
    pub first_child_block: Option<u64>,
    /// Block in which the second child was created, if any.
    pub second_child_block: Option<u64>,
    /// Whether this assertion was the first child of its parent.
    pub is_first_child: bool,
}

impl AssertionNode {
    /// Returns true once two children have been created on top of this assertion,
    /// which means its children can no longer be confirmed by time alone.
    pub fn has_second_child(&self) -> bool {
        self.second_child_block.is_some()
    }
}

/// An `AssertionCreated` log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionCreatedEvent {
    /// The hash of the created assertion.
    pub assertion_hash: AssertionHash,
    /// The block the log was emitted in.
    pub block_number: u64,
    /// The transaction that emitted the log.
    pub transaction_hash: H256,
}

/// A parent chain block header, reduced to the fields a validator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// The block number.
    pub number: u64,
    /// Unix timestamp of the block, in seconds.
    pub timestamp: u64,
}

/// Which block a header query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// The head of the chain.
    Latest,
    /// The latest block considered safe from re-orgs.
    Safe,
    /// A specific block number.
    Number(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(batch: u64, machine_status: MachineStatus) -> ExecutionState {
        ExecutionState {
            global_state: GlobalState {
                batch,
                ..Default::default()
            },
            machine_status,
        }
    }

    #[test]
    fn overflow_requires_unconsumed_batches() {
        assert!(state(3, MachineStatus::Finished).is_overflow(5));
        assert!(!state(5, MachineStatus::Finished).is_overflow(5));
        assert!(!state(6, MachineStatus::Finished).is_overflow(5));
    }

    #[test]
    fn errored_states_are_never_overflow() {
        assert!(!state(0, MachineStatus::Errored).is_overflow(5));
    }

    #[test]
    fn execution_state_equality_is_field_wise() {
        let a = state(1, MachineStatus::Finished);
        let mut b = a;
        assert_eq!(a, b);
        b.global_state.pos_in_batch = 1;
        assert_ne!(a, b);
        b = a;
        b.machine_status = MachineStatus::Running;
        assert_ne!(a, b);
    }

    #[test]
    fn assertion_hash_displays_full_hex() {
        let hash = AssertionHash::from([0xab; 32]);
        assert_eq!(hash.to_string(), format!("0x{}", "ab".repeat(32)));
        assert!(AssertionHash::zero().is_zero());
    }

    #[test]
    fn assertion_hash_serializes_as_hex_string() {
        let hash = AssertionHash::from([1; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        let back: AssertionHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }
}
