use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bold_assertion_manager::{shutdown_channel, AssertionManagerBuilder};
use bold_mock_chain::{MockAssertionChain, MockExecutionProvider};
use bold_rollup_interface::services::chain::AssertionChain;
use bold_rollup_interface::{AssertionHash, Mode};
use proptest::prelude::*;

/// Builds a random DAG where every assertion picks an earlier assertion as parent and
/// is either the honest child of that parent or carries a state nobody agrees with.
/// Returns the honest child of every parent that has one.
async fn build_dag(
    chain: &MockAssertionChain,
    shape: &[(usize, bool)],
) -> HashMap<AssertionHash, AssertionHash> {
    let honest = MockExecutionProvider::new();
    let mut nodes = vec![chain.genesis_hash().await];
    let mut honest_children = HashMap::new();
    for (index, (parent_index, is_honest)) in shape.iter().enumerate() {
        let parent = nodes[parent_index % nodes.len()];
        let parent_info = chain.read_assertion_creation_info(parent).await.unwrap();
        let provider = if *is_honest {
            honest.clone()
        } else {
            MockExecutionProvider::with_salt(index as u64 + 1)
        };
        chain.set_inbox_batch_count(index as u64 + 2).await;
        let state = provider.state_at(parent_info.inbox_max_count);
        // An honest child can only be created once per parent.
        if let Ok(hash) = chain.create_assertion(parent, state).await {
            if *is_honest {
                honest_children.insert(parent, hash);
            }
            nodes.push(hash);
        }
    }
    honest_children
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn canonical_assertions_form_the_honest_path(
        shape in prop::collection::vec((0usize..16, any::<bool>()), 1..16)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let chain = MockAssertionChain::new();
            let genesis = chain.genesis_hash().await;
            let honest_children = build_dag(&chain, &shape).await;
            let created = chain.block_number().await;

            let manager = Arc::new(
                AssertionManagerBuilder::new(
                    Arc::new(chain.clone()),
                    Arc::new(MockExecutionProvider::new()),
                )
                .mode(Mode::Watchtower)
                .polling_interval(Duration::from_millis(5))
                .max_get_log_blocks(3)
                .build()
                .unwrap(),
            );
            let (handle, shutdown) = shutdown_channel();
            let tasks = manager.start(shutdown).await.unwrap();
            let mut expected = vec![genesis];
            while let Some(child) = honest_children.get(expected.last().unwrap()) {
                expected.push(*child);
            }
            let tip = *expected.last().unwrap();

            // The counter moves before the pass that read the events releases the index.
            for _ in 0..1000 {
                if manager.assertions_processed() == created
                    && manager.latest_agreed_assertion().await == tip
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(manager.assertions_processed(), created);

            let canonical = manager.canonical_assertions().await;
            let hashes: HashSet<_> = canonical.iter().map(|info| info.assertion_hash).collect();
            assert_eq!(hashes, expected.iter().copied().collect::<HashSet<_>>());

            let mut parents = HashSet::new();
            for info in canonical.iter().filter(|info| info.assertion_hash != genesis) {
                assert!(parents.insert(info.parent_assertion_hash));
                assert!(hashes.contains(&info.parent_assertion_hash));
            }
            assert_eq!(manager.latest_agreed_assertion().await, tip);

            handle.shutdown();
            for task in tasks {
                task.await.unwrap();
            }
        });
    }
}
