//! Per-chain engine: a head tracker feeding a log poller.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainpoll_core::{ChainClient, ChainEngine, ChainId, Filter, FinalityMode, MemoryStore};
//!
//! # async fn run(client: Arc<dyn ChainClient>) -> Result<(), chainpoll_core::PollerError> {
//! let store = MemoryStore::new().scoped(ChainId(1));
//! let engine = ChainEngine::builder(client)
//!     .store(Arc::new(store.clone()))
//!     .head_store(Arc::new(store))
//!     .finality(FinalityMode::FixedDepth { depth: 12 })
//!     .start_block(0)
//!     .filter(Filter::new("usdc", ["0xa0b8..."], ["0xddf2..."]))
//!     .build()?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::client::ChainClient;
use crate::config::{FinalityMode, HeadTrackerConfig, PollerConfig};
use crate::error::PollerError;
use crate::filter::Filter;
use crate::head_tracker::{HeadTracker, TrackerState};
use crate::poller::{LogPoller, PollerStatus};
use crate::retry::RetryConfig;
use crate::store::{HeadStore, LogStore};
use crate::types::ChainId;

/// A head tracker and the log poller it drives, for one chain.
#[derive(Clone)]
pub struct ChainEngine {
    tracker: HeadTracker,
    poller: LogPoller,
    filters: Arc<Vec<Filter>>,
}

impl ChainEngine {
    pub fn builder(client: Arc<dyn ChainClient>) -> EngineBuilder {
        EngineBuilder::new(client)
    }

    pub fn chain_id(&self) -> ChainId {
        self.poller.chain_id()
    }

    pub fn tracker(&self) -> &HeadTracker {
        &self.tracker
    }

    pub fn poller(&self) -> &LogPoller {
        &self.poller
    }

    /// Register the builder's filters, then start the tracker and the poller.
    /// If the poller fails to start the tracker is closed again.
    pub async fn start(&self) -> Result<(), PollerError> {
        for filter in self.filters.iter() {
            self.poller.register_filter(filter.clone()).await?;
        }
        self.tracker.start().await?;
        if let Err(e) = self.poller.start().await {
            self.tracker.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop the poller first so no tick runs against a stopped tracker.
    pub async fn close(&self) {
        self.poller.close().await;
        self.tracker.close().await;
        tracing::info!(chain_id = %self.chain_id(), "chain engine stopped");
    }

    /// The first fatal error of either component.
    pub fn health(&self) -> Option<PollerError> {
        self.tracker.health().or_else(|| self.poller.health())
    }

    pub fn is_running(&self) -> bool {
        self.tracker.state() != TrackerState::Stopped
            && self.tracker.state() != TrackerState::Created
            && self.poller.status() == PollerStatus::Running
    }
}

// ─── EngineBuilder ────────────────────────────────────────────────────────────

/// Fluent builder for [`ChainEngine`].
pub struct EngineBuilder {
    client: Arc<dyn ChainClient>,
    store: Option<Arc<dyn LogStore>>,
    head_store: Option<Arc<dyn HeadStore>>,
    tracker: HeadTrackerConfig,
    poller: PollerConfig,
    filters: Vec<Filter>,
}

impl EngineBuilder {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self {
            client,
            store: None,
            head_store: None,
            tracker: HeadTrackerConfig::default(),
            poller: PollerConfig::default(),
            filters: Vec::new(),
        }
    }

    /// Set the log store. Required.
    pub fn store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist the head window so restarts resume reorg detection.
    pub fn head_store(mut self, store: Arc<dyn HeadStore>) -> Self {
        self.head_store = Some(store);
        self
    }

    pub fn head_tracker_config(mut self, config: HeadTrackerConfig) -> Self {
        self.tracker = config;
        self
    }

    pub fn poller_config(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn finality(mut self, finality: FinalityMode) -> Self {
        self.tracker.finality = finality;
        self
    }

    /// Number of recent heads the tracker keeps.
    pub fn history_depth(mut self, depth: u64) -> Self {
        self.tracker.history_depth = depth;
        self
    }

    /// Polling period of both the tracker and the poller.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.tracker.poll_interval_ms = ms;
        self.poller.poll_interval_ms = ms;
        self
    }

    /// First block to index when the store is empty.
    pub fn start_block(mut self, block: i64) -> Self {
        self.poller.start_block = Some(block);
        self
    }

    pub fn backfill_batch_size(mut self, size: u64) -> Self {
        self.poller.backfill_batch_size = size;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.tracker.retry = retry.clone();
        self.poller.retry = retry;
        self
    }

    /// Add a filter registered when the engine starts.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> Result<ChainEngine, PollerError> {
        let store = self
            .store
            .ok_or_else(|| PollerError::Config("engine requires a log store".into()))?;
        let filters = self
            .filters
            .into_iter()
            .map(Filter::normalized)
            .collect::<Result<Vec<_>, _>>()?;

        let tracker = HeadTracker::new(self.client.clone(), self.tracker, self.head_store)?;
        let poller = LogPoller::new(self.client, Arc::new(tracker.clone()), store, self.poller)?;
        tracker.add_listener(poller.reorg_listener());

        Ok(ChainEngine {
            tracker,
            poller,
            filters: Arc::new(filters),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockChainClient;
    use crate::store::MemoryStore;
    use std::time::Duration;

    const ADDR: &str = "0x00000000000000000000000000000000000000aa";
    const SIG: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn engine(chain: Arc<MockChainClient>, store: &MemoryStore) -> ChainEngine {
        let scoped = store.scoped(ChainId(1));
        ChainEngine::builder(chain)
            .store(Arc::new(scoped.clone()))
            .head_store(Arc::new(scoped))
            .finality(FinalityMode::FixedDepth { depth: 3 })
            .history_depth(32)
            .poll_interval_ms(10)
            .start_block(0)
            .retry(RetryConfig { initial_backoff_ms: 1, max_backoff_ms: 5, ..Default::default() })
            .filter(Filter::new("transfers", [ADDR], [SIG]))
            .build()
            .unwrap()
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..300 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn build_requires_store() {
        let chain = Arc::new(MockChainClient::new(ChainId(1)));
        let err = ChainEngine::builder(chain).build().err().unwrap();
        assert!(matches!(err, PollerError::Config(_)));
    }

    #[test]
    fn build_rejects_invalid_filters() {
        let chain = Arc::new(MockChainClient::new(ChainId(1)));
        let store = MemoryStore::new().scoped(ChainId(1));
        let err = ChainEngine::builder(chain)
            .store(Arc::new(store))
            .filter(Filter::new("empty", Vec::<String>::new(), [SIG]))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, PollerError::InvalidFilter(_)));
    }

    #[tokio::test]
    async fn indexes_live_logs_and_follows_reorgs() {
        let chain = Arc::new(MockChainClient::new(ChainId(1)));
        chain.extend(5);
        chain.add_log(3, ADDR, &[SIG], vec![1]);
        let store = MemoryStore::new();
        let engine = engine(chain.clone(), &store);
        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(engine.poller().has_filter("transfers"));

        let poller = engine.poller().clone();
        wait_for(|| {
            let poller = poller.clone();
            async move { poller.logs(0, 100, SIG, ADDR).await.map(|l| l.len() == 1).unwrap_or(false) }
        })
        .await;

        chain.extend(3);
        chain.add_log(8, ADDR, &[SIG], vec![2]);
        wait_for(|| {
            let poller = poller.clone();
            async move { poller.logs(0, 100, SIG, ADDR).await.map(|l| l.len() == 2).unwrap_or(false) }
        })
        .await;

        // Replace blocks 7..: the log at 8 disappears, a new one lands at 9.
        chain.reorg(7, 4);
        chain.add_log(9, ADDR, &[SIG], vec![3]);
        let expected_hash = chain.block(9).unwrap().hash;
        wait_for(|| {
            let poller = poller.clone();
            let expected_hash = expected_hash.clone();
            async move {
                let logs = poller.logs(0, 100, SIG, ADDR).await.unwrap_or_default();
                logs.len() == 2 && logs[1].block_number == 9 && logs[1].block_hash == expected_hash
            }
        })
        .await;

        let stored = poller.block_by_number(8).await.unwrap();
        assert_eq!(stored.hash, chain.block(8).unwrap().hash);
        assert!(engine.health().is_none());

        engine.close().await;
        assert!(!engine.is_running());
        assert_eq!(engine.poller().status(), PollerStatus::Stopped);
    }

    #[tokio::test]
    async fn restart_resumes_from_stored_state() {
        let chain = Arc::new(MockChainClient::new(ChainId(1)));
        chain.extend(6);
        chain.add_log(2, ADDR, &[SIG], vec![1]);
        let store = MemoryStore::new();

        let first = engine(chain.clone(), &store);
        first.start().await.unwrap();
        let poller = first.poller().clone();
        wait_for(|| {
            let poller = poller.clone();
            async move { matches!(poller.poller_state().await, Ok(Some(s)) if s.last_processed_block >= 6) }
        })
        .await;
        first.close().await;

        chain.extend(2);
        chain.add_log(8, ADDR, &[SIG], vec![2]);
        let second = engine(chain.clone(), &store);
        second.start().await.unwrap();
        let poller = second.poller().clone();
        wait_for(|| {
            let poller = poller.clone();
            async move { poller.logs(0, 100, SIG, ADDR).await.map(|l| l.len() == 2).unwrap_or(false) }
        })
        .await;
        second.close().await;
    }
}
