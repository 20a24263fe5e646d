use std::collections::HashMap;

use bold_rollup_interface::{AssertionCreatedInfo, AssertionHash};

/// The validator's view of the canonical branch.
///
/// Canonical assertions form a single chain rooted at the latest confirmed
/// assertion observed on start, and ending at the latest agreed-with assertion.
/// The only exception are rivals this validator posted itself, which are recorded
/// before the cursor reaches them.
#[derive(Debug, Clone, Default)]
pub struct AssertionChainData {
    latest_agreed_assertion: AssertionHash,
    canonical_assertions: HashMap<AssertionHash, AssertionCreatedInfo>,
}

impl AssertionChainData {
    /// Resets the view to start at `root`, usually the latest confirmed assertion.
    pub fn seed(&mut self, root: AssertionCreatedInfo) {
        self.latest_agreed_assertion = root.assertion_hash;
        self.canonical_assertions.clear();
        self.canonical_assertions.insert(root.assertion_hash, root);
    }

    /// Records `info` as agreed-with and moves the cursor to it.
    pub fn set_agreed(&mut self, info: AssertionCreatedInfo) {
        self.latest_agreed_assertion = info.assertion_hash;
        self.canonical_assertions.insert(info.assertion_hash, info);
    }

    /// Records `info` as canonical without moving the cursor.
    /// Returns false if it was already canonical.
    pub fn insert_canonical(&mut self, info: AssertionCreatedInfo) -> bool {
        if self.canonical_assertions.contains_key(&info.assertion_hash) {
            return false;
        }
        self.canonical_assertions.insert(info.assertion_hash, info);
        true
    }

    /// Returns true if `hash` is on the canonical branch.
    pub fn is_canonical(&self, hash: &AssertionHash) -> bool {
        self.canonical_assertions.contains_key(hash)
    }

    /// Returns the parent of `info` if that parent is canonical.
    pub fn canonical_parent_of(
        &self,
        info: &AssertionCreatedInfo,
    ) -> Option<&AssertionCreatedInfo> {
        self.canonical_assertions.get(&info.parent_assertion_hash)
    }

    /// Returns the canonical child of `parent`, if one is known.
    pub fn canonical_child_of(&self, parent: &AssertionHash) -> Option<&AssertionCreatedInfo> {
        self.canonical_assertions
            .values()
            .find(|info| info.parent_assertion_hash == *parent)
    }

    /// The latest assertion the validator agrees with.
    pub fn latest_agreed(&self) -> AssertionHash {
        self.latest_agreed_assertion
    }

    /// Creation info of the latest assertion the validator agrees with.
    pub fn latest_agreed_info(&self) -> Option<&AssertionCreatedInfo> {
        self.canonical_assertions.get(&self.latest_agreed_assertion)
    }

    /// Number of canonical assertions known.
    pub fn len(&self) -> usize {
        self.canonical_assertions.len()
    }

    /// Returns true if nothing has been seeded yet.
    pub fn is_empty(&self) -> bool {
        self.canonical_assertions.is_empty()
    }

    /// Every canonical assertion, in no particular order.
    pub fn canonical_assertions(&self) -> impl Iterator<Item = &AssertionCreatedInfo> {
        self.canonical_assertions.values()
    }
}

#[cfg(test)]
mod tests {
    use bold_rollup_interface::{Address, ExecutionState, H256, U256};

    use super::*;

    fn info(hash: u8, parent: u8) -> AssertionCreatedInfo {
        AssertionCreatedInfo {
            assertion_hash: AssertionHash::from([hash; 32]),
            parent_assertion_hash: if parent == 0 {
                AssertionHash::zero()
            } else {
                AssertionHash::from([parent; 32])
            },
            before_state: ExecutionState::default(),
            after_state: ExecutionState::default(),
            inbox_max_count: 1,
            after_inbox_batch_acc: H256::zero(),
            confirm_period_blocks: 10,
            creation_block: hash as u64,
            creation_parent_block: hash as u64,
            challenge_manager: Address::zero(),
            required_stake: U256::zero(),
            transaction_hash: H256::zero(),
            wasm_module_root: H256::zero(),
        }
    }

    #[test]
    fn cursor_follows_agreed_assertions() {
        let mut data = AssertionChainData::default();
        assert!(data.is_empty());
        data.seed(info(1, 0));
        assert_eq!(data.latest_agreed(), AssertionHash::from([1; 32]));

        data.set_agreed(info(2, 1));
        assert_eq!(data.latest_agreed(), AssertionHash::from([2; 32]));
        assert_eq!(
            data.canonical_parent_of(&info(3, 2)).map(|i| i.assertion_hash),
            Some(AssertionHash::from([2; 32]))
        );
        assert!(data.canonical_parent_of(&info(4, 9)).is_none());
        assert_eq!(
            data.canonical_child_of(&AssertionHash::from([1; 32]))
                .map(|i| i.assertion_hash),
            Some(AssertionHash::from([2; 32]))
        );
    }

    #[test]
    fn inserted_rivals_do_not_move_the_cursor() {
        let mut data = AssertionChainData::default();
        data.seed(info(1, 0));
        assert!(data.insert_canonical(info(5, 1)));
        assert!(!data.insert_canonical(info(5, 1)));
        assert!(data.is_canonical(&AssertionHash::from([5; 32])));
        assert_eq!(data.latest_agreed(), AssertionHash::from([1; 32]));
        assert_eq!(data.len(), 2);
        assert_eq!(data.latest_agreed_info().map(|i| i.creation_block), Some(1));
    }
}
