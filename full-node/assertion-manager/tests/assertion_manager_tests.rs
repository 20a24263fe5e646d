use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bold_assertion_manager::{
    shutdown_channel, AssertionManager, AssertionManagerBuilder, ShutdownHandle,
};
use bold_mock_chain::{
    MockAssertionChain, MockDatabase, MockExecutionProvider, MockRivalHandler,
    DEFAULT_CONFIRM_PERIOD_BLOCKS,
};
use bold_rollup_interface::services::chain::AssertionChain;
use bold_rollup_interface::{Address, AssertionStatus, Mode};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

type TestManager = AssertionManager<MockAssertionChain, MockExecutionProvider>;

struct RunningManager {
    manager: Arc<TestManager>,
    handle: ShutdownHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningManager {
    async fn stop(self) {
        self.handle.shutdown();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

fn fast_builder(
    chain: &MockAssertionChain,
    execution: &MockExecutionProvider,
    mode: Mode,
) -> AssertionManagerBuilder<MockAssertionChain, MockExecutionProvider> {
    AssertionManagerBuilder::new(Arc::new(chain.clone()), Arc::new(execution.clone()))
        .validator_name("alice")
        .mode(mode)
        .polling_interval(Duration::from_millis(20))
        .confirmation_attempt_interval(Duration::from_millis(10))
        .posting_interval(Duration::from_secs(3600))
        .average_block_time(Duration::from_millis(10))
        .minimum_gap_to_parent(Duration::ZERO)
        .retry_interval(Duration::from_millis(10))
}

fn init_logging() {
    // Several tests share the process, only the first one installs the subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start(
    builder: AssertionManagerBuilder<MockAssertionChain, MockExecutionProvider>,
) -> RunningManager {
    init_logging();
    let manager = Arc::new(builder.build().unwrap());
    let (handle, shutdown) = shutdown_channel();
    let tasks = manager.start(shutdown).await.unwrap();
    RunningManager {
        manager,
        handle,
        tasks,
    }
}

async fn eventually<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting until {}", description);
}

#[tokio::test]
async fn test_fork_with_agreed_sibling_is_challenged() {
    let chain = MockAssertionChain::new();
    let honest = MockExecutionProvider::new();
    let evil = MockExecutionProvider::with_salt(7);
    let genesis = chain.genesis_hash().await;
    let agreed = chain.create_assertion(genesis, honest.state_at(1)).await.unwrap();
    let forked = chain.create_assertion(genesis, evil.state_at(1)).await.unwrap();

    let handler = MockRivalHandler::new();
    let running = start(
        fast_builder(&chain, &honest, Mode::Defensive).rival_handler(Arc::new(handler.clone())),
    )
    .await;
    let manager = &running.manager;

    let handler_ref = &handler;
    eventually("the fork is handled", move || async move {
        !handler_ref.handled().await.is_empty()
    })
    .await;
    assert_eq!(manager.forks_detected(), 1);
    assert_eq!(manager.latest_agreed_assertion().await, agreed);
    assert!(manager.is_canonical(&agreed).await);
    assert!(!manager.is_canonical(&forked).await);
    assert_eq!(handler.handled().await, vec![agreed]);
    assert_eq!(manager.submitted_rivals(), 0);
    assert_eq!(manager.assertions_processed(), 2);

    running.stop().await;
}

#[tokio::test]
async fn test_rival_is_posted_against_lone_invalid_assertion() {
    let chain = MockAssertionChain::new();
    let honest = MockExecutionProvider::new();
    let genesis = chain.genesis_hash().await;
    let forked = chain
        .create_assertion(genesis, MockExecutionProvider::with_salt(11).state_at(1))
        .await
        .unwrap();

    let handler = MockRivalHandler::new();
    let running = start(
        fast_builder(&chain, &honest, Mode::Defensive).rival_handler(Arc::new(handler.clone())),
    )
    .await;
    let manager = &running.manager;

    eventually("the rival is agreed with", move || async move {
        manager.submitted_rivals() == 1
            && manager.latest_agreed_assertion().await != genesis
    })
    .await;

    let rival = manager.latest_agreed_assertion().await;
    assert_eq!(chain.children_of(genesis).await, vec![forked, rival]);
    assert_eq!(handler.handled().await, vec![rival]);
    assert_eq!(manager.assertions_submitted_in_process(), vec![rival]);
    assert_eq!(chain.calls().await.new_stake_on_new_assertion, 1);

    // Later passes neither answer the fork again nor post another rival.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.forks_detected(), 1);
    assert_eq!(handler.handled().await.len(), 1);
    assert_eq!(chain.children_of(genesis).await.len(), 2);

    running.stop().await;
}

#[tokio::test]
async fn test_watchtower_never_writes() {
    let chain = MockAssertionChain::new();
    let honest = MockExecutionProvider::new();
    let genesis = chain.genesis_hash().await;
    chain
        .create_assertion(genesis, MockExecutionProvider::with_salt(2).state_at(1))
        .await
        .unwrap();
    chain.advance_blocks(DEFAULT_CONFIRM_PERIOD_BLOCKS).await;

    let handler = MockRivalHandler::new();
    let running = start(
        fast_builder(&chain, &honest, Mode::Watchtower).rival_handler(Arc::new(handler.clone())),
    )
    .await;
    let manager = &running.manager;

    eventually("the fork is noticed", move || async move {
        manager.forks_detected() == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(manager.metrics().evil_assertions(), 1);
    assert_eq!(manager.latest_agreed_assertion().await, genesis);
    assert_eq!(chain.calls().await, Default::default());
    assert!(handler.handled().await.is_empty());

    running.stop().await;
}

#[tokio::test]
async fn test_challenge_manager_mismatch_opens_no_challenge() {
    let chain = MockAssertionChain::new();
    let honest = MockExecutionProvider::new();
    let genesis = chain.genesis_hash().await;
    let agreed = chain.create_assertion(genesis, honest.state_at(1)).await.unwrap();
    chain
        .create_assertion(genesis, MockExecutionProvider::with_salt(4).state_at(1))
        .await
        .unwrap();

    let misconfigured = chain.with_challenge_manager(Address::repeat_byte(0xee));
    let handler = MockRivalHandler::new();
    let running = start(
        fast_builder(&misconfigured, &honest, Mode::Defensive)
            .rival_handler(Arc::new(handler.clone())),
    )
    .await;
    let manager = &running.manager;

    eventually("the fork is noticed", move || async move {
        manager.forks_detected() == 1
    })
    .await;
    assert_eq!(manager.latest_agreed_assertion().await, agreed);
    assert!(handler.handled().await.is_empty());

    running.stop().await;
}

#[tokio::test]
async fn test_lagging_execution_provider_defers_agreement() {
    let chain = MockAssertionChain::new();
    let execution = MockExecutionProvider::new();
    execution.set_caught_up_batch(Some(0)).await;
    let genesis = chain.genesis_hash().await;
    let agreed = chain
        .create_assertion(genesis, MockExecutionProvider::new().state_at(1))
        .await
        .unwrap();

    let running = start(fast_builder(&chain, &execution, Mode::Defensive)).await;
    let manager = &running.manager;

    eventually("the provider reports catching up", move || async move {
        manager.metrics().chain_catching_up() >= 5
    })
    .await;
    assert_eq!(manager.latest_agreed_assertion().await, genesis);
    assert_eq!(manager.forks_detected(), 0);

    execution.set_caught_up_batch(None).await;
    eventually("the assertion is agreed with", move || async move {
        manager.latest_agreed_assertion().await == agreed
    })
    .await;
    assert_eq!(manager.forks_detected(), 0);
    assert_eq!(chain.calls().await.new_stake_on_new_assertion, 0);

    running.stop().await;
}

#[tokio::test]
async fn test_make_mode_posts_and_confirms() {
    let chain = MockAssertionChain::new();
    let execution = MockExecutionProvider::new();
    let database = MockDatabase::new();

    let running = start(
        fast_builder(&chain, &execution, Mode::Make).database(Arc::new(database.clone())),
    )
    .await;
    let manager = &running.manager;

    eventually("an assertion is posted", move || async move {
        !manager.assertions_submitted_in_process().is_empty()
    })
    .await;
    let posted = manager.assertions_submitted_in_process()[0];
    assert_eq!(manager.latest_agreed_assertion().await, posted);

    chain.advance_blocks(DEFAULT_CONFIRM_PERIOD_BLOCKS).await;
    let chain_ref = &chain;
    eventually("the assertion is confirmed", move || async move {
        chain_ref.latest_confirmed().await.unwrap() == posted
    })
    .await;
    assert_eq!(manager.metrics().assertions_confirmed(), 1);
    assert_eq!(manager.metrics().assertions_posted(), 1);

    let calls = chain.calls().await;
    assert_eq!(calls.auto_deposit, 1);
    assert_eq!(calls.approve_allowances, 1);
    assert_eq!(calls.new_stake_on_new_assertion, 1);

    let database_ref = &database;
    eventually("the assertion is saved", move || async move {
        database_ref
            .records()
            .await
            .iter()
            .any(|record| record.hash == posted)
    })
    .await;

    running.stop().await;
}

#[tokio::test]
async fn test_confirmed_invalid_assertion_is_reported() {
    let chain = MockAssertionChain::new();
    let honest = MockExecutionProvider::new();
    let genesis = chain.genesis_hash().await;
    let forked = chain
        .create_assertion(genesis, MockExecutionProvider::with_salt(8).state_at(1))
        .await
        .unwrap();

    let running = start(fast_builder(&chain, &honest, Mode::Watchtower)).await;
    let manager = &running.manager;
    eventually("the fork is noticed", move || async move {
        manager.forks_detected() == 1
    })
    .await;

    chain.advance_blocks(DEFAULT_CONFIRM_PERIOD_BLOCKS).await;
    chain.confirm_assertion_by_time(forked).await.unwrap();
    assert_eq!(
        chain.assertion_status(forked).await.unwrap(),
        AssertionStatus::Confirmed
    );

    eventually("the confirmation is reported", move || async move {
        manager.metrics().evil_assertions_confirmed() >= 1
    })
    .await;
    assert_eq!(manager.metrics().latest_confirmed_creation_block(), 1);

    running.stop().await;
}

#[tokio::test]
async fn test_failing_database_does_not_stop_sync() {
    let chain = MockAssertionChain::new();
    let execution = MockExecutionProvider::new();
    let genesis = chain.genesis_hash().await;
    let agreed = chain.create_assertion(genesis, execution.state_at(1)).await.unwrap();
    let database = MockDatabase::new();
    database.set_failing(true);

    let running = start(
        fast_builder(&chain, &execution, Mode::Watchtower).database(Arc::new(database.clone())),
    )
    .await;
    let manager = &running.manager;
    eventually("the assertion is agreed with", move || async move {
        manager.latest_agreed_assertion().await == agreed
    })
    .await;
    assert!(database.records().await.is_empty());

    database.set_failing(false);
    let database_ref = &database;
    eventually("the assertion is eventually saved", move || async move {
        database_ref.records().await.len() == 1
    })
    .await;

    running.stop().await;
}
