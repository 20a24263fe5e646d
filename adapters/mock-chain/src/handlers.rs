use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bold_rollup_interface::services::challenge::RivalHandler;
use bold_rollup_interface::services::db::{AssertionRecord, Database};
use bold_rollup_interface::AssertionHash;
use tokio::sync::RwLock;

/// A rival handler that records every rival it is told about.
#[derive(Debug, Clone, Default)]
pub struct MockRivalHandler {
    handled: Arc<RwLock<Vec<AssertionHash>>>,
}

impl MockRivalHandler {
    /// Creates an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every rival handled so far, in order.
    pub async fn handled(&self) -> Vec<AssertionHash> {
        self.handled.read().await.clone()
    }
}

#[async_trait]
impl RivalHandler for MockRivalHandler {
    async fn handle_correct_rival(&self, assertion_hash: AssertionHash) -> anyhow::Result<()> {
        tracing::debug!("Mock rival handler received {}", assertion_hash);
        self.handled.write().await.push(assertion_hash);
        Ok(())
    }
}

/// A database that keeps records in memory, and can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct MockDatabase {
    records: Arc<RwLock<Vec<AssertionRecord>>>,
    failing: Arc<AtomicBool>,
}

impl MockDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every insert fail while `failing` is set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Every record inserted so far, in order.
    pub async fn records(&self) -> Vec<AssertionRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn insert_assertion(&self, record: &AssertionRecord) -> anyhow::Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            anyhow::bail!("Mock database is unavailable");
        }
        let mut records = self.records.write().await;
        records.retain(|r| r.hash != record.hash);
        records.push(record.clone());
        Ok(())
    }
}
