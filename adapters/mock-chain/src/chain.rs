use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bold_rollup_interface::services::chain::{AssertionChain, ChainError};
use bold_rollup_interface::{
    Address, AssertionCreatedEvent, AssertionCreatedInfo, AssertionHash, AssertionNode,
    AssertionStatus, BlockHeader, BlockTag, ExecutionState, GlobalState, MachineStatus, H256,
    U256,
};
use sha2::Digest;
use tokio::sync::RwLock;

/// Number of blocks a child must wait before it can be confirmed by time, unless overridden.
pub const DEFAULT_CONFIRM_PERIOD_BLOCKS: u64 = 20;

/// Challenge manager recorded in every assertion, unless overridden.
pub const DEFAULT_CHALLENGE_MANAGER: Address = Address::repeat_byte(0xc1);

/// Stake required to create a child, unless overridden.
pub const DEFAULT_REQUIRED_STAKE: u64 = 1_000;

#[derive(Debug, Clone)]
struct StoredAssertion {
    info: AssertionCreatedInfo,
    node: AssertionNode,
}

/// Counts of the writes validators performed against the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounters {
    /// Calls to `new_stake`.
    pub new_stake: u64,
    /// Calls to `new_stake_on_new_assertion`.
    pub new_stake_on_new_assertion: u64,
    /// Calls to `stake_on_new_assertion`.
    pub stake_on_new_assertion: u64,
    /// Calls to `fast_confirm_assertion`.
    pub fast_confirm: u64,
    /// Calls to `confirm_assertion_by_time`.
    pub confirm_by_time: u64,
    /// Calls to `auto_deposit_token_for_staking`.
    pub auto_deposit: u64,
    /// Calls to `approve_allowances`.
    pub approve_allowances: u64,
}

#[derive(Debug)]
struct ChainState {
    block_number: u64,
    start_timestamp: u64,
    seconds_per_block: u64,
    safe_lag: u64,
    inbox_batch_count: u64,
    confirm_period_blocks: u64,
    min_assertion_period_blocks: u64,
    required_stake: U256,
    recorded_challenge_manager: Address,
    fast_confirm_enabled: bool,
    failing_event_queries: usize,
    staked: bool,
    latest_confirmed: AssertionHash,
    genesis: AssertionHash,
    assertions: HashMap<AssertionHash, StoredAssertion>,
    events: Vec<AssertionCreatedEvent>,
    event_queries: Vec<(u64, u64)>,
    deposits: Vec<U256>,
    calls: CallCounters,
}

impl ChainState {
    fn timestamp_of(&self, block: u64) -> u64 {
        self.start_timestamp + block * self.seconds_per_block
    }

    fn stored(&self, hash: &AssertionHash) -> anyhow::Result<&StoredAssertion> {
        self.assertions
            .get(hash)
            .ok_or_else(|| anyhow::Error::new(ChainError::NotFound).context(format!("{}", hash)))
    }

    fn mine(&mut self) -> u64 {
        self.block_number += 1;
        self.block_number
    }

    fn create_assertion(
        &mut self,
        parent_hash: AssertionHash,
        after_state: ExecutionState,
    ) -> anyhow::Result<AssertionHash> {
        let parent = self.stored(&parent_hash)?.info.clone();
        let hash = assertion_hash(&parent_hash, &after_state, parent.inbox_max_count);
        if self.assertions.contains_key(&hash) {
            return Err(ChainError::AlreadyExists.into());
        }

        let creation_block = self.mine();
        let is_first_child = {
            let parent_node = &mut self
                .assertions
                .get_mut(&parent_hash)
                .ok_or(ChainError::NotFound)?
                .node;
            match parent_node.first_child_block {
                None => {
                    parent_node.first_child_block = Some(creation_block);
                    true
                }
                Some(_) => {
                    if parent_node.second_child_block.is_none() {
                        parent_node.second_child_block = Some(creation_block);
                    }
                    false
                }
            }
        };

        let transaction_hash = H256::from(hash_bytes(&[
            hash.as_bytes(),
            &creation_block.to_be_bytes(),
        ]));
        let info = AssertionCreatedInfo {
            assertion_hash: hash,
            parent_assertion_hash: parent_hash,
            before_state: parent.after_state,
            after_state,
            inbox_max_count: self.inbox_batch_count,
            after_inbox_batch_acc: H256::from(hash_bytes(&[
                b"inbox",
                &after_state.global_state.batch.to_be_bytes(),
            ])),
            confirm_period_blocks: self.confirm_period_blocks,
            creation_block,
            creation_parent_block: creation_block,
            challenge_manager: self.recorded_challenge_manager,
            required_stake: self.required_stake,
            transaction_hash,
            wasm_module_root: parent.wasm_module_root,
        };
        let node = AssertionNode {
            assertion_hash: hash,
            status: AssertionStatus::Pending,
            first_child_block: None,
            second_child_block: None,
            is_first_child,
        };
        self.assertions
            .insert(hash, StoredAssertion { info, node });
        self.events.push(AssertionCreatedEvent {
            assertion_hash: hash,
            block_number: creation_block,
            transaction_hash,
        });
        tracing::debug!(
            "Mock chain created assertion {} on top of {} at block {}",
            hash,
            parent_hash,
            creation_block
        );
        Ok(hash)
    }

    fn confirm(&mut self, hash: AssertionHash) -> anyhow::Result<()> {
        let stored = self
            .assertions
            .get_mut(&hash)
            .ok_or(ChainError::NotFound)?;
        stored.node.status = AssertionStatus::Confirmed;
        self.latest_confirmed = hash;
        Ok(())
    }
}

/// An in-memory assertion chain used in tests.
///
/// Clones share the same underlying chain, so one clone can be handed to a
/// validator while the test drives the chain through another.
#[derive(Debug, Clone)]
pub struct MockAssertionChain {
    state: Arc<RwLock<ChainState>>,
    challenge_manager: Address,
}

impl Default for MockAssertionChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAssertionChain {
    /// Creates a chain holding only a confirmed genesis assertion at block 0.
    pub fn new() -> Self {
        let genesis_state = genesis_state();
        let genesis = assertion_hash(&AssertionHash::zero(), &genesis_state, 0);
        let info = AssertionCreatedInfo {
            assertion_hash: genesis,
            parent_assertion_hash: AssertionHash::zero(),
            before_state: ExecutionState::default(),
            after_state: genesis_state,
            inbox_max_count: 1,
            after_inbox_batch_acc: H256::zero(),
            confirm_period_blocks: DEFAULT_CONFIRM_PERIOD_BLOCKS,
            creation_block: 0,
            creation_parent_block: 0,
            challenge_manager: DEFAULT_CHALLENGE_MANAGER,
            required_stake: U256::from(DEFAULT_REQUIRED_STAKE),
            transaction_hash: H256::zero(),
            wasm_module_root: H256::repeat_byte(0x77),
        };
        let node = AssertionNode {
            assertion_hash: genesis,
            status: AssertionStatus::Confirmed,
            first_child_block: None,
            second_child_block: None,
            is_first_child: true,
        };
        let start_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let state = ChainState {
            block_number: 0,
            start_timestamp,
            seconds_per_block: 0,
            safe_lag: 0,
            inbox_batch_count: 1,
            confirm_period_blocks: DEFAULT_CONFIRM_PERIOD_BLOCKS,
            min_assertion_period_blocks: 0,
            required_stake: U256::from(DEFAULT_REQUIRED_STAKE),
            recorded_challenge_manager: DEFAULT_CHALLENGE_MANAGER,
            fast_confirm_enabled: false,
            failing_event_queries: 0,
            staked: false,
            latest_confirmed: genesis,
            genesis,
            assertions: HashMap::from([(genesis, StoredAssertion { info, node })]),
            events: Vec::new(),
            event_queries: Vec::new(),
            deposits: Vec::new(),
            calls: CallCounters::default(),
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            challenge_manager: DEFAULT_CHALLENGE_MANAGER,
        }
    }

    /// Returns a handle on the same chain for a validator configured with another
    /// challenge manager.
    pub fn with_challenge_manager(&self, challenge_manager: Address) -> Self {
        Self {
            state: self.state.clone(),
            challenge_manager,
        }
    }

    /// The hash of the genesis assertion.
    pub async fn genesis_hash(&self) -> AssertionHash {
        self.state.read().await.genesis
    }

    /// The current block number.
    pub async fn block_number(&self) -> u64 {
        self.state.read().await.block_number
    }

    /// Mines `count` empty blocks.
    pub async fn advance_blocks(&self, count: u64) {
        let mut state = self.state.write().await;
        state.block_number += count;
    }

    /// Posts an assertion on behalf of some validator, in a new block.
    pub async fn create_assertion(
        &self,
        parent: AssertionHash,
        after_state: ExecutionState,
    ) -> anyhow::Result<AssertionHash> {
        self.state
            .write()
            .await
            .create_assertion(parent, after_state)
    }

    /// Sets the number of inbox batches. Assertions created afterwards require
    /// their children to process that many batches.
    pub async fn set_inbox_batch_count(&self, count: u64) {
        self.state.write().await.inbox_batch_count = count;
    }

    /// Makes the safe head trail the latest head by `lag` blocks.
    pub async fn set_safe_lag(&self, lag: u64) {
        self.state.write().await.safe_lag = lag;
    }

    /// Sets how many seconds pass between two blocks. Defaults to zero.
    pub async fn set_seconds_per_block(&self, seconds: u64) {
        self.state.write().await.seconds_per_block = seconds;
    }

    /// Sets the confirmation period recorded in assertions created afterwards.
    pub async fn set_confirm_period_blocks(&self, blocks: u64) {
        self.state.write().await.confirm_period_blocks = blocks;
    }

    /// Sets the minimum number of blocks between an assertion and its child.
    pub async fn set_min_assertion_period_blocks(&self, blocks: u64) {
        self.state.write().await.min_assertion_period_blocks = blocks;
    }

    /// Enables or disables the fast-confirmation path.
    pub async fn set_fast_confirm(&self, enabled: bool) {
        self.state.write().await.fast_confirm_enabled = enabled;
    }

    /// Marks the validator as already staked.
    pub async fn set_staked(&self, staked: bool) {
        self.state.write().await.staked = staked;
    }

    /// Makes the next `count` event queries fail.
    pub async fn fail_next_event_queries(&self, count: usize) {
        self.state.write().await.failing_event_queries = count;
    }

    /// Every event query range served so far, in order.
    pub async fn event_queries(&self) -> Vec<(u64, u64)> {
        self.state.read().await.event_queries.clone()
    }

    /// Counts of the writes performed so far.
    pub async fn calls(&self) -> CallCounters {
        self.state.read().await.calls.clone()
    }

    /// Amounts deposited through `auto_deposit_token_for_staking`.
    pub async fn deposits(&self) -> Vec<U256> {
        self.state.read().await.deposits.clone()
    }

    /// Children of `parent`, in creation order.
    pub async fn children_of(&self, parent: AssertionHash) -> Vec<AssertionHash> {
        let state = self.state.read().await;
        state
            .events
            .iter()
            .filter(|event| {
                state
                    .assertions
                    .get(&event.assertion_hash)
                    .map_or(false, |a| a.info.parent_assertion_hash == parent)
            })
            .map(|event| event.assertion_hash)
            .collect()
    }
}

#[async_trait]
impl AssertionChain for MockAssertionChain {
    async fn latest_confirmed(&self) -> anyhow::Result<AssertionHash> {
        Ok(self.state.read().await.latest_confirmed)
    }

    async fn read_assertion_creation_info(
        &self,
        assertion_hash: AssertionHash,
    ) -> anyhow::Result<AssertionCreatedInfo> {
        let state = self.state.read().await;
        Ok(state.stored(&assertion_hash)?.info.clone())
    }

    async fn get_assertion(&self, assertion_hash: AssertionHash) -> anyhow::Result<AssertionNode> {
        let state = self.state.read().await;
        Ok(state.stored(&assertion_hash)?.node.clone())
    }

    async fn assertion_status(
        &self,
        assertion_hash: AssertionHash,
    ) -> anyhow::Result<AssertionStatus> {
        let state = self.state.read().await;
        Ok(state
            .assertions
            .get(&assertion_hash)
            .map_or(AssertionStatus::NoAssertion, |a| a.node.status))
    }

    async fn header_by_number(&self, tag: BlockTag) -> anyhow::Result<BlockHeader> {
        let state = self.state.read().await;
        let number = match tag {
            BlockTag::Latest => state.block_number,
            BlockTag::Safe => state.block_number.saturating_sub(state.safe_lag),
            BlockTag::Number(n) if n <= state.block_number => n,
            BlockTag::Number(n) => anyhow::bail!(
                "Block {} is ahead of the chain head {}",
                n,
                state.block_number
            ),
        };
        Ok(BlockHeader {
            number,
            timestamp: state.timestamp_of(number),
        })
    }

    async fn assertion_created_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> anyhow::Result<Vec<AssertionCreatedEvent>> {
        let mut state = self.state.write().await;
        if state.failing_event_queries > 0 {
            state.failing_event_queries -= 1;
            anyhow::bail!("Injected failure filtering logs {}..={}", from_block, to_block);
        }
        state.event_queries.push((from_block, to_block));
        Ok(state
            .events
            .iter()
            .filter(|event| event.block_number >= from_block && event.block_number <= to_block)
            .cloned()
            .collect())
    }

    async fn compute_assertion_hash(
        &self,
        parent: &AssertionCreatedInfo,
        after_state: &ExecutionState,
    ) -> anyhow::Result<AssertionHash> {
        Ok(assertion_hash(
            &parent.assertion_hash,
            after_state,
            parent.inbox_max_count,
        ))
    }

    async fn is_staked(&self) -> anyhow::Result<bool> {
        Ok(self.state.read().await.staked)
    }

    async fn new_stake(&self) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.calls.new_stake += 1;
        state.staked = true;
        Ok(())
    }

    async fn new_stake_on_new_assertion(
        &self,
        parent: &AssertionCreatedInfo,
        after_state: &ExecutionState,
    ) -> anyhow::Result<AssertionHash> {
        let mut state = self.state.write().await;
        state.calls.new_stake_on_new_assertion += 1;
        let hash = state.create_assertion(parent.assertion_hash, *after_state)?;
        state.staked = true;
        Ok(hash)
    }

    async fn stake_on_new_assertion(
        &self,
        parent: &AssertionCreatedInfo,
        after_state: &ExecutionState,
    ) -> anyhow::Result<AssertionHash> {
        let mut state = self.state.write().await;
        state.calls.stake_on_new_assertion += 1;
        if !state.staked {
            anyhow::bail!("Validator is not staked");
        }
        state.create_assertion(parent.assertion_hash, *after_state)
    }

    async fn fast_confirm_assertion(&self, info: &AssertionCreatedInfo) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        state.calls.fast_confirm += 1;
        if !state.fast_confirm_enabled {
            return Ok(false);
        }
        if state.stored(&info.assertion_hash)?.node.status == AssertionStatus::Confirmed {
            return Ok(true);
        }
        if state.latest_confirmed != info.parent_assertion_hash {
            return Err(ChainError::NotLatestConfirmed.into());
        }
        state.confirm(info.assertion_hash)?;
        Ok(true)
    }

    async fn confirm_assertion_by_time(&self, assertion_hash: AssertionHash) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.calls.confirm_by_time += 1;
        let stored = state.stored(&assertion_hash)?.clone();
        if stored.node.status == AssertionStatus::Confirmed {
            return Ok(());
        }
        let parent = state.stored(&stored.info.parent_assertion_hash)?.clone();
        if state.latest_confirmed != parent.info.assertion_hash {
            return Err(ChainError::NotLatestConfirmed.into());
        }
        if parent.node.has_second_child() {
            anyhow::bail!(
                "Assertion {} has a rival and cannot be confirmed by time",
                assertion_hash
            );
        }
        if state.block_number < stored.info.creation_block + parent.info.confirm_period_blocks {
            return Err(ChainError::BeforeDeadline.into());
        }
        state.confirm(assertion_hash)
    }

    async fn auto_deposit_token_for_staking(&self, amount: U256) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        state.calls.auto_deposit += 1;
        state.deposits.push(amount);
        Ok(())
    }

    async fn approve_allowances(&self) -> anyhow::Result<()> {
        self.state.write().await.calls.approve_allowances += 1;
        Ok(())
    }

    async fn min_assertion_period_blocks(&self) -> anyhow::Result<u64> {
        Ok(self.state.read().await.min_assertion_period_blocks)
    }

    fn challenge_manager_address(&self) -> Address {
        self.challenge_manager
    }
}

/// The state claimed by the genesis assertion.
pub fn genesis_state() -> ExecutionState {
    ExecutionState {
        global_state: GlobalState {
            block_hash: H256::zero(),
            send_root: H256::zero(),
            batch: 1,
            pos_in_batch: 0,
        },
        machine_status: MachineStatus::Finished,
    }
}

fn assertion_hash(
    parent: &AssertionHash,
    after_state: &ExecutionState,
    inbox_max_count: u64,
) -> AssertionHash {
    let global = &after_state.global_state;
    let status = [after_state.machine_status as u8];
    AssertionHash::from(hash_bytes(&[
        parent.as_bytes(),
        global.block_hash.as_bytes(),
        global.send_root.as_bytes(),
        &global.batch.to_be_bytes(),
        &global.pos_in_batch.to_be_bytes(),
        &status,
        &inbox_max_count.to_be_bytes(),
    ]))
}

pub(crate) fn hash_bytes(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_slice());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(batch: u64) -> ExecutionState {
        ExecutionState {
            global_state: GlobalState {
                batch,
                block_hash: H256::repeat_byte(batch as u8),
                ..Default::default()
            },
            machine_status: MachineStatus::Finished,
        }
    }

    #[tokio::test]
    async fn test_genesis_is_confirmed() {
        let chain = MockAssertionChain::new();
        let genesis = chain.genesis_hash().await;
        assert_eq!(chain.latest_confirmed().await.unwrap(), genesis);
        assert_eq!(
            chain.assertion_status(genesis).await.unwrap(),
            AssertionStatus::Confirmed
        );
        assert!(chain
            .read_assertion_creation_info(genesis)
            .await
            .unwrap()
            .is_genesis());
    }

    #[tokio::test]
    async fn test_duplicate_assertion_already_exists() {
        let chain = MockAssertionChain::new();
        let genesis = chain.genesis_hash().await;
        chain.create_assertion(genesis, state_at(2)).await.unwrap();
        let err = chain
            .create_assertion(genesis, state_at(2))
            .await
            .unwrap_err();
        assert!(ChainError::is_already_exists(&err));
    }

    #[tokio::test]
    async fn test_computed_hash_matches_created_assertion() {
        let chain = MockAssertionChain::new();
        let genesis = chain.genesis_hash().await;
        let parent = chain.read_assertion_creation_info(genesis).await.unwrap();
        let expected = chain
            .compute_assertion_hash(&parent, &state_at(2))
            .await
            .unwrap();
        let created = chain.create_assertion(genesis, state_at(2)).await.unwrap();
        assert_eq!(expected, created);
    }

    #[tokio::test]
    async fn test_children_are_tracked_on_parent() {
        let chain = MockAssertionChain::new();
        let genesis = chain.genesis_hash().await;
        let first = chain.create_assertion(genesis, state_at(2)).await.unwrap();
        let second = chain.create_assertion(genesis, state_at(3)).await.unwrap();

        let node = chain.get_assertion(genesis).await.unwrap();
        assert_eq!(node.first_child_block, Some(1));
        assert_eq!(node.second_child_block, Some(2));
        assert!(chain.get_assertion(first).await.unwrap().is_first_child);
        assert!(!chain.get_assertion(second).await.unwrap().is_first_child);
        assert_eq!(chain.children_of(genesis).await, vec![first, second]);
    }

    #[tokio::test]
    async fn test_confirm_by_time_waits_for_period() {
        let chain = MockAssertionChain::new();
        let genesis = chain.genesis_hash().await;
        let child = chain.create_assertion(genesis, state_at(2)).await.unwrap();

        let err = chain.confirm_assertion_by_time(child).await.unwrap_err();
        assert_eq!(ChainError::classify(&err), Some(ChainError::BeforeDeadline));

        chain.advance_blocks(DEFAULT_CONFIRM_PERIOD_BLOCKS).await;
        chain.confirm_assertion_by_time(child).await.unwrap();
        assert_eq!(chain.latest_confirmed().await.unwrap(), child);
    }

    #[tokio::test]
    async fn test_confirm_by_time_rejects_rivalled_assertions() {
        let chain = MockAssertionChain::new();
        let genesis = chain.genesis_hash().await;
        let child = chain.create_assertion(genesis, state_at(2)).await.unwrap();
        chain.create_assertion(genesis, state_at(3)).await.unwrap();
        chain.advance_blocks(DEFAULT_CONFIRM_PERIOD_BLOCKS).await;

        let err = chain.confirm_assertion_by_time(child).await.unwrap_err();
        assert_eq!(ChainError::classify(&err), None);
    }

    #[tokio::test]
    async fn test_event_ranges_are_inclusive() {
        let chain = MockAssertionChain::new();
        let genesis = chain.genesis_hash().await;
        let a = chain.create_assertion(genesis, state_at(2)).await.unwrap();
        let b = chain.create_assertion(a, state_at(3)).await.unwrap();

        let events = chain.assertion_created_events(1, 1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].assertion_hash, a);
        let events = chain.assertion_created_events(2, 5).await.unwrap();
        assert_eq!(events[0].assertion_hash, b);

        chain.fail_next_event_queries(1).await;
        assert!(chain.assertion_created_events(0, 5).await.is_err());
        assert!(chain.assertion_created_events(0, 5).await.is_ok());
        assert_eq!(chain.event_queries().await, vec![(1, 1), (2, 5), (0, 5)]);
    }

    #[tokio::test]
    async fn test_safe_head_lags() {
        let chain = MockAssertionChain::new();
        chain.advance_blocks(10).await;
        chain.set_safe_lag(4).await;
        assert_eq!(chain.header_by_number(BlockTag::Safe).await.unwrap().number, 6);
        assert_eq!(
            chain.header_by_number(BlockTag::Latest).await.unwrap().number,
            10
        );
        assert!(chain.header_by_number(BlockTag::Number(11)).await.is_err());
    }
}
