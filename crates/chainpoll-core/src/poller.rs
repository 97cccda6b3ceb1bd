//! Log poller: filter registration, lifecycle, replay and the read-only
//! query API. The loop itself lives in [`crate::poll_loop`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::client::ChainClient;
use crate::config::PollerConfig;
use crate::error::PollerError;
use crate::filter::{Filter, FilterRegistry, Registration};
use crate::head_tracker::HeadSource;
use crate::reorg::{HeadListener, ReorgEvent};
use crate::retry::RetryPolicy;
use crate::store::{Counterpart, LogSelection, LogStore, TopicMatch, WordMatch};
use crate::types::{normalize_hex, parse_word, Block, ChainId, Confirmations, Log, PollerState};

/// Lifecycle state of a [`LogPoller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerStatus {
    Created,
    Running,
    Stopped,
}

impl std::fmt::Display for PollerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A replay queued to the poll loop.
pub(crate) struct ReplayRequest {
    pub from: i64,
    pub done: Option<oneshot::Sender<Result<(), PollerError>>>,
}

pub(crate) struct PollerInner {
    pub chain_id: ChainId,
    pub config: PollerConfig,
    pub client: Arc<dyn ChainClient>,
    pub heads: Arc<dyn HeadSource>,
    pub store: Arc<dyn LogStore>,
    pub filters: FilterRegistry,
    pub retry: RetryPolicy,
    /// Lowest block a reorg listener asked to re-fetch from.
    pub pending_rollback: Mutex<Option<i64>>,
    status: Mutex<PollerStatus>,
    fatal: Mutex<Option<PollerError>>,
    replays: Mutex<Option<mpsc::Sender<ReplayRequest>>>,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PollerInner {
    pub fn set_fatal(&self, e: PollerError) {
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = PollerStatus::Stopped;
    }

    pub fn take_pending_rollback(&self) -> Option<i64> {
        self.pending_rollback.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn request_rollback(&self, from: i64) {
        let mut pending = self.pending_rollback.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = Some(pending.map_or(from, |p| p.min(from)));
    }
}

/// The per-chain indexing engine. Cheap to clone; clones share the poller.
#[derive(Clone)]
pub struct LogPoller {
    inner: Arc<PollerInner>,
}

impl LogPoller {
    pub fn new(
        client: Arc<dyn ChainClient>,
        heads: Arc<dyn HeadSource>,
        store: Arc<dyn LogStore>,
        config: PollerConfig,
    ) -> Result<Self, PollerError> {
        config.validate()?;
        let chain_id = client.chain_id();
        if store.chain_id() != chain_id {
            return Err(PollerError::Config(format!(
                "store is scoped to chain {} but the client serves chain {chain_id}",
                store.chain_id()
            )));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(PollerInner {
                chain_id,
                retry: RetryPolicy::new(config.retry.clone()),
                config,
                client,
                heads,
                store,
                filters: FilterRegistry::new(),
                pending_rollback: Mutex::new(None),
                status: Mutex::new(PollerStatus::Created),
                fatal: Mutex::new(None),
                replays: Mutex::new(None),
                shutdown,
                task: tokio::sync::Mutex::new(None),
            }),
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.inner.chain_id
    }

    pub fn status(&self) -> PollerStatus {
        *self.inner.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The error that halted the loop, if any.
    pub fn health(&self) -> Option<PollerError> {
        self.inner.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Load persisted filters and spawn the poll loop. Fails if the store is
    /// unreachable.
    pub async fn start(&self) -> Result<(), PollerError> {
        {
            let mut status = self.inner.status.lock().unwrap_or_else(PoisonError::into_inner);
            match *status {
                PollerStatus::Created => *status = PollerStatus::Running,
                PollerStatus::Running => return Err(PollerError::AlreadyStarted("log poller")),
                PollerStatus::Stopped => return Err(PollerError::Stopped("log poller")),
            }
        }

        if let Err(e) = self.load_filters().await {
            *self.inner.status.lock().unwrap_or_else(PoisonError::into_inner) = PollerStatus::Stopped;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(16);
        *self.inner.replays.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move { inner.run(shutdown, rx).await });
        *self.inner.task.lock().await = Some(handle);

        tracing::info!(
            chain_id = %self.inner.chain_id,
            filters = self.inner.filters.len(),
            "log poller started"
        );
        Ok(())
    }

    async fn load_filters(&self) -> Result<(), PollerError> {
        self.inner.store.ping().await?;
        for filter in self.inner.store.load_filters().await? {
            self.inner.filters.insert(filter);
        }
        Ok(())
    }

    /// Signal shutdown and wait for the current tick to finish. Idempotent.
    pub async fn close(&self) {
        self.inner.replays.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(chain_id = %self.inner.chain_id, error = %e, "log poller task panicked");
            }
        }
        *self.inner.status.lock().unwrap_or_else(PoisonError::into_inner) = PollerStatus::Stopped;
    }

    /// Run one poll tick on the caller's task. Rejected while the loop is
    /// running, which keeps the loop the only writer.
    pub async fn poll_once(&self) -> Result<(), PollerError> {
        self.ensure_idle()?;
        let shutdown = self.inner.shutdown.subscribe();
        self.inner.poll_tick(&shutdown).await
    }

    /// Run one pruning pass on the caller's task. Same restriction as
    /// [`poll_once`](Self::poll_once).
    pub async fn prune_once(&self) -> Result<(), PollerError> {
        self.ensure_idle()?;
        self.inner.prune().await
    }

    fn ensure_idle(&self) -> Result<(), PollerError> {
        match self.status() {
            PollerStatus::Running => Err(PollerError::AlreadyStarted("log poller")),
            _ => Ok(()),
        }
    }

    // ─── Filters ──────────────────────────────────────────────────────────────

    /// Register or widen a filter. Takes effect on the next poll tick and
    /// does not backfill; call [`replay`](Self::replay) for that.
    pub async fn register_filter(&self, filter: Filter) -> Result<(), PollerError> {
        let filter = filter.normalized()?;
        if self.inner.filters.plan(&filter) == Registration::Unchanged {
            tracing::debug!(chain_id = %self.inner.chain_id, name = %filter.name, "filter already registered");
            return Ok(());
        }
        self.inner.store.insert_filter(&filter).await?;
        let name = filter.name.clone();
        let outcome = self.inner.filters.insert(filter);
        tracing::info!(chain_id = %self.inner.chain_id, name = %name, ?outcome, "registered filter");
        Ok(())
    }

    pub async fn unregister_filter(&self, name: &str) -> Result<(), PollerError> {
        if !self.inner.filters.contains(name) {
            return Err(PollerError::NotFound(format!("filter '{name}'")));
        }
        self.inner.store.delete_filter(name).await?;
        self.inner.filters.remove(name);
        tracing::info!(chain_id = %self.inner.chain_id, name, "unregistered filter");
        Ok(())
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.inner.filters.contains(name)
    }

    /// Registered filters, sorted by name.
    pub fn filters(&self) -> Vec<Filter> {
        self.inner.filters.snapshot().iter().cloned().collect()
    }

    // ─── Replay ───────────────────────────────────────────────────────────────

    /// Re-fetch and re-persist logs from `from` to the current head, then
    /// return. Existing rows are kept; replaying twice stores nothing new.
    ///
    /// Dropping the returned future does not cancel an accepted replay.
    pub async fn replay(&self, from: i64) -> Result<(), PollerError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_replay(from, Some(tx))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(PollerError::ReplayAborted("log poller stopped before the replay finished".into())),
        }
    }

    /// Like [`replay`](Self::replay), but gives up waiting after `timeout`.
    /// An accepted replay keeps running; `ReplayInProgress` reports that.
    pub async fn replay_with_timeout(&self, from: i64, timeout: Duration) -> Result<(), PollerError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_replay(from, Some(tx))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PollerError::ReplayAborted("log poller stopped before the replay finished".into())),
            Err(_) => Err(PollerError::ReplayInProgress),
        }
    }

    /// Queue a replay without waiting for it.
    pub fn replay_async(&self, from: i64) -> Result<(), PollerError> {
        self.enqueue_replay(from, None)
    }

    fn enqueue_replay(
        &self,
        from: i64,
        done: Option<oneshot::Sender<Result<(), PollerError>>>,
    ) -> Result<(), PollerError> {
        let latest = self.inner.heads.latest_head().map_or(0, |h| h.number);
        if from < 1 || from > latest {
            return Err(PollerError::InvalidReplayBlock { requested: from, latest });
        }
        let sender = self
            .inner
            .replays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PollerError::Stopped("log poller"))?;
        sender.try_send(ReplayRequest { from, done }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PollerError::ReplayInProgress,
            mpsc::error::TrySendError::Closed(_) => PollerError::Stopped("log poller"),
        })?;
        tracing::debug!(chain_id = %self.inner.chain_id, from, "replay queued");
        Ok(())
    }

    // ─── Queries ──────────────────────────────────────────────────────────────

    /// Logs of one event from one address in `[from, to]`.
    pub async fn logs(&self, from: i64, to: i64, event_sig: &str, address: &str) -> Result<Vec<Log>, PollerError> {
        self.logs_with_sigs(from, to, &[event_sig], address).await
    }

    /// Logs of any of `event_sigs` from `address` in `[from, to]`, ascending
    /// by `(block_number, log_index)`.
    pub async fn logs_with_sigs(
        &self,
        from: i64,
        to: i64,
        event_sigs: &[&str],
        address: &str,
    ) -> Result<Vec<Log>, PollerError> {
        check_range(from, to)?;
        non_empty("event signatures", event_sigs)?;
        let selection = LogSelection {
            addresses: vec![normalize_hex(address)],
            event_sigs: event_sigs.iter().map(normalize_hex).collect(),
            from_block: Some(from),
            to_block: Some(to),
            ..Default::default()
        };
        self.inner.store.select_logs(&selection).await
    }

    /// Most recent log at least `confirmations` deep; `NotFound` if none.
    pub async fn latest_log_by_event_sig_with_confs(
        &self,
        event_sig: &str,
        address: &str,
        confirmations: Confirmations,
    ) -> Result<Log, PollerError> {
        let selection = LogSelection {
            addresses: vec![normalize_hex(address)],
            event_sigs: vec![normalize_hex(event_sig)],
            confirmations: Some(confirmations),
            ..Default::default()
        };
        self.inner
            .store
            .select_latest_log(&selection)
            .await?
            .ok_or_else(|| PollerError::NotFound(format!("no log for event {event_sig} at {address}")))
    }

    /// The latest confirmed log per (address, event signature) pair, at or
    /// above `from`.
    pub async fn latest_logs_by_event_sigs_addrs_with_confs(
        &self,
        from: i64,
        event_sigs: &[&str],
        addresses: &[&str],
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let selection = sigs_addrs_selection(from, event_sigs, addresses, confirmations)?;
        let mut latest: BTreeMap<(String, String), Log> = BTreeMap::new();
        for log in self.inner.store.select_logs(&selection).await? {
            latest.insert((log.address.clone(), log.event_sig.clone()), log);
        }
        let mut out: Vec<Log> = latest.into_values().collect();
        out.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(out)
    }

    /// Highest block at or above `from` carrying a confirmed log of any of
    /// `event_sigs` from any of `addresses`; 0 if there is none.
    pub async fn latest_block_by_event_sigs_addrs_with_confs(
        &self,
        from: i64,
        event_sigs: &[&str],
        addresses: &[&str],
        confirmations: Confirmations,
    ) -> Result<i64, PollerError> {
        let selection = sigs_addrs_selection(from, event_sigs, addresses, confirmations)?;
        let latest = self.inner.store.select_latest_log(&selection).await?;
        Ok(latest.map_or(0, |l| l.block_number))
    }

    /// Confirmed logs whose topic at `topic_index` (1..=3) is one of
    /// `topic_values`.
    pub async fn indexed_logs(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        topic_values: &[&str],
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let selection = LogSelection {
            addresses: vec![normalize_hex(address)],
            event_sigs: vec![normalize_hex(event_sig)],
            topic: Some(topic_match(topic_index, topic_values)?),
            confirmations: Some(confirmations),
            ..Default::default()
        };
        self.inner.store.select_logs(&selection).await
    }

    pub async fn indexed_logs_by_block_range(
        &self,
        from: i64,
        to: i64,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        topic_values: &[&str],
    ) -> Result<Vec<Log>, PollerError> {
        check_range(from, to)?;
        let selection = LogSelection {
            addresses: vec![normalize_hex(address)],
            event_sigs: vec![normalize_hex(event_sig)],
            from_block: Some(from),
            to_block: Some(to),
            topic: Some(topic_match(topic_index, topic_values)?),
            ..Default::default()
        };
        self.inner.store.select_logs(&selection).await
    }

    pub async fn indexed_logs_by_tx_hash(
        &self,
        event_sig: &str,
        address: &str,
        tx_hash: &str,
    ) -> Result<Vec<Log>, PollerError> {
        let selection = LogSelection {
            addresses: vec![normalize_hex(address)],
            event_sigs: vec![normalize_hex(event_sig)],
            tx_hash: Some(normalize_hex(tx_hash)),
            ..Default::default()
        };
        self.inner.store.select_logs(&selection).await
    }

    /// Confirmed logs whose topic at `topic_index` is at least `min`.
    pub async fn indexed_logs_topic_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        check_topic_index(topic_index)?;
        let word = WordMatch::TopicRange { index: topic_index, min: Some(parse_word(min)?), max: None };
        self.select_words(event_sig, address, word, confirmations).await
    }

    /// Confirmed logs whose topic at `topic_index` lies in `[min, max]`.
    pub async fn indexed_logs_topic_range(
        &self,
        event_sig: &str,
        address: &str,
        topic_index: usize,
        min: &str,
        max: &str,
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        check_topic_index(topic_index)?;
        let word = WordMatch::TopicRange {
            index: topic_index,
            min: Some(parse_word(min)?),
            max: Some(parse_word(max)?),
        };
        self.select_words(event_sig, address, word, confirmations).await
    }

    /// Confirmed logs of `sig_a` in `[from, to]` with no log of `sig_b`
    /// from the same address sharing their topic at `topic_index` in the
    /// same range. Used to find requests that were never fulfilled.
    #[allow(clippy::too_many_arguments)]
    pub async fn indexed_logs_with_sigs_excluding(
        &self,
        sig_a: &str,
        sig_b: &str,
        topic_index: usize,
        address: &str,
        from: i64,
        to: i64,
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        check_range(from, to)?;
        check_topic_index(topic_index)?;
        let selection = LogSelection {
            addresses: vec![normalize_hex(address)],
            event_sigs: vec![normalize_hex(sig_a)],
            from_block: Some(from),
            to_block: Some(to),
            confirmations: Some(confirmations),
            without_counterpart: Some(Counterpart { event_sig: normalize_hex(sig_b), topic_index }),
            ..Default::default()
        };
        self.inner.store.select_logs(&selection).await
    }

    /// Confirmed logs whose data word `word_index` lies in `[min, max]`.
    pub async fn logs_data_word_range(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        max: &str,
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let word = WordMatch::DataRange {
            index: word_index,
            min: Some(parse_word(min)?),
            max: Some(parse_word(max)?),
        };
        self.select_words(event_sig, address, word, confirmations).await
    }

    /// Confirmed logs whose data word `word_index` is at least `min`.
    pub async fn logs_data_word_greater_than(
        &self,
        event_sig: &str,
        address: &str,
        word_index: usize,
        min: &str,
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let word = WordMatch::DataRange { index: word_index, min: Some(parse_word(min)?), max: None };
        self.select_words(event_sig, address, word, confirmations).await
    }

    /// Confirmed logs where `value` lies between data words `lower_index`
    /// and `upper_index`, inclusive.
    pub async fn logs_data_word_between(
        &self,
        event_sig: &str,
        address: &str,
        lower_index: usize,
        upper_index: usize,
        value: &str,
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let word = WordMatch::DataBetween { lower: lower_index, upper: upper_index, value: parse_word(value)? };
        self.select_words(event_sig, address, word, confirmations).await
    }

    async fn select_words(
        &self,
        event_sig: &str,
        address: &str,
        word: WordMatch,
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let selection = LogSelection {
            addresses: vec![normalize_hex(address)],
            event_sigs: vec![normalize_hex(event_sig)],
            confirmations: Some(confirmations),
            word: Some(word),
            ..Default::default()
        };
        self.inner.store.select_logs(&selection).await
    }

    /// Confirmed logs persisted strictly after `after`.
    pub async fn logs_created_after(
        &self,
        event_sig: &str,
        address: &str,
        after: DateTime<Utc>,
        confirmations: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let selection = LogSelection {
            addresses: vec![normalize_hex(address)],
            event_sigs: vec![normalize_hex(event_sig)],
            created_after: Some(after),
            confirmations: Some(confirmations),
            ..Default::default()
        };
        self.inner.store.select_logs(&selection).await
    }

    /// Highest indexed block; `NotFound` before the first tick.
    pub async fn latest_block(&self) -> Result<Block, PollerError> {
        self.inner
            .store
            .latest_block()
            .await?
            .ok_or_else(|| PollerError::NotFound("no blocks indexed yet".into()))
    }

    pub async fn block_by_number(&self, number: i64) -> Result<Block, PollerError> {
        self.inner
            .store
            .block_by_number(number)
            .await?
            .ok_or_else(|| PollerError::NotFound(format!("block {number}")))
    }

    pub async fn poller_state(&self) -> Result<Option<PollerState>, PollerError> {
        self.inner.store.poller_state().await
    }
}

impl LogPoller {
    /// A reorg listener that schedules rollbacks on this poller. It holds
    /// the poller weakly, so a head tracker never keeps it alive.
    pub fn reorg_listener(&self) -> Arc<dyn HeadListener> {
        Arc::new(RollbackListener { poller: Arc::downgrade(&self.inner) })
    }
}

struct RollbackListener {
    poller: Weak<PollerInner>,
}

impl HeadListener for RollbackListener {
    fn on_reorg(&self, event: &ReorgEvent) {
        let Some(inner) = self.poller.upgrade() else {
            return;
        };
        tracing::info!(
            chain_id = %inner.chain_id,
            from = event.rollback_from(),
            depth = event.depth(),
            "scheduling rollback"
        );
        inner.request_rollback(event.rollback_from());
    }
}

fn check_range(from: i64, to: i64) -> Result<(), PollerError> {
    if from > to {
        return Err(PollerError::InvalidArgument(format!("from block {from} is above to block {to}")));
    }
    Ok(())
}

fn non_empty(what: &str, values: &[&str]) -> Result<(), PollerError> {
    if values.is_empty() {
        return Err(PollerError::InvalidArgument(format!("no {what} given")));
    }
    Ok(())
}

fn check_topic_index(index: usize) -> Result<(), PollerError> {
    if !(1..=3).contains(&index) {
        return Err(PollerError::InvalidArgument(format!("topic index {index} out of range 1..=3")));
    }
    Ok(())
}

fn sigs_addrs_selection(
    from: i64,
    event_sigs: &[&str],
    addresses: &[&str],
    confirmations: Confirmations,
) -> Result<LogSelection, PollerError> {
    non_empty("event signatures", event_sigs)?;
    non_empty("addresses", addresses)?;
    Ok(LogSelection {
        addresses: addresses.iter().map(normalize_hex).collect(),
        event_sigs: event_sigs.iter().map(normalize_hex).collect(),
        from_block: Some(from),
        confirmations: Some(confirmations),
        ..Default::default()
    })
}

fn topic_match(index: usize, values: &[&str]) -> Result<TopicMatch, PollerError> {
    check_topic_index(index)?;
    Ok(TopicMatch {
        index,
        values: values.iter().map(normalize_hex).collect(),
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockChainClient, MockHeads};
    use crate::store::memory::MemoryChainStore;
    use crate::store::MemoryStore;

    const ADDR: &str = "0x00000000000000000000000000000000000000aa";
    const SIG: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn setup() -> (Arc<MockChainClient>, Arc<MockHeads>, Arc<MemoryChainStore>, LogPoller) {
        let chain = Arc::new(MockChainClient::new(ChainId(1)));
        let heads = Arc::new(MockHeads::default());
        let store = Arc::new(MemoryStore::new().scoped(ChainId(1)));
        let config = PollerConfig {
            poll_interval_ms: 10,
            start_block: Some(1),
            backfill_batch_size: 4,
            rpc_batch_size: 2,
            retry: crate::retry::RetryConfig { initial_backoff_ms: 1, max_backoff_ms: 2, ..Default::default() },
            ..Default::default()
        };
        let poller = LogPoller::new(chain.clone(), heads.clone(), store.clone(), config).unwrap();
        (chain, heads, store, poller)
    }

    #[tokio::test]
    async fn register_rejects_invalid_filters() {
        let (_, _, _, poller) = setup();
        let err = poller
            .register_filter(Filter::new("f", Vec::<String>::new(), [SIG]))
            .await
            .unwrap_err();
        assert!(matches!(err, PollerError::InvalidFilter(_)));
        assert!(!poller.has_filter("f"));
    }

    #[tokio::test]
    async fn register_is_idempotent_and_persisted() {
        let (_, _, store, poller) = setup();
        poller.register_filter(Filter::new("f", [ADDR], [SIG])).await.unwrap();
        poller.register_filter(Filter::new("f", [ADDR], [SIG])).await.unwrap();
        assert_eq!(poller.filters().len(), 1);
        assert_eq!(store.load_filters().await.unwrap().len(), 1);

        poller.unregister_filter("f").await.unwrap();
        assert!(store.load_filters().await.unwrap().is_empty());
        let err = poller.unregister_filter("f").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn start_reloads_filters() {
        let (chain, heads, store, poller) = setup();
        poller.register_filter(Filter::new("f", [ADDR], [SIG])).await.unwrap();

        let second = LogPoller::new(chain, heads, store, PollerConfig::default()).unwrap();
        assert!(!second.has_filter("f"));
        second.start().await.unwrap();
        assert!(second.has_filter("f"));
        second.close().await;
    }

    #[tokio::test]
    async fn replay_validation() {
        let (chain, heads, _, poller) = setup();
        chain.extend(10);
        heads.follow(&chain, 2);

        assert!(matches!(poller.replay(5).await, Err(PollerError::Stopped(_))));
        poller.start().await.unwrap();
        assert!(matches!(
            poller.replay(0).await,
            Err(PollerError::InvalidReplayBlock { requested: 0, latest: 10 })
        ));
        assert!(matches!(
            poller.replay(11).await,
            Err(PollerError::InvalidReplayBlock { requested: 11, latest: 10 })
        ));
        poller.replay(3).await.unwrap();
        poller.close().await;
        assert!(matches!(poller.replay(3).await, Err(PollerError::Stopped(_))));
    }

    #[tokio::test]
    async fn query_argument_validation() {
        let (_, _, _, poller) = setup();
        assert!(matches!(poller.logs(5, 4, SIG, ADDR).await, Err(PollerError::InvalidArgument(_))));
        assert!(matches!(
            poller.indexed_logs(SIG, ADDR, 0, &["0x01"], Confirmations::Depth(0)).await,
            Err(PollerError::InvalidArgument(_))
        ));
        assert!(matches!(
            poller.indexed_logs(SIG, ADDR, 4, &["0x01"], Confirmations::Depth(0)).await,
            Err(PollerError::InvalidArgument(_))
        ));
        assert!(poller
            .latest_log_by_event_sig_with_confs(SIG, ADDR, Confirmations::Depth(0))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(poller.latest_block().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn empty_signature_lists_are_rejected() {
        let (_, _, _, poller) = setup();
        assert!(matches!(
            poller.logs_with_sigs(1, 10, &[], ADDR).await,
            Err(PollerError::InvalidArgument(_))
        ));
        assert!(matches!(
            poller.latest_logs_by_event_sigs_addrs_with_confs(1, &[], &[ADDR], Confirmations::Depth(0)).await,
            Err(PollerError::InvalidArgument(_))
        ));
        assert!(matches!(
            poller.latest_block_by_event_sigs_addrs_with_confs(1, &[SIG], &[], Confirmations::Depth(0)).await,
            Err(PollerError::InvalidArgument(_))
        ));
        assert_eq!(
            poller
                .latest_block_by_event_sigs_addrs_with_confs(1, &[SIG], &[ADDR], Confirmations::Depth(0))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn word_queries_validate_arguments() {
        let (_, _, _, poller) = setup();
        assert!(matches!(
            poller.logs_data_word_greater_than(SIG, ADDR, 0, "0xnothex", Confirmations::Depth(0)).await,
            Err(PollerError::InvalidArgument(_))
        ));
        assert!(matches!(
            poller.indexed_logs_topic_range(SIG, ADDR, 4, "0x1", "0x2", Confirmations::Depth(0)).await,
            Err(PollerError::InvalidArgument(_))
        ));
        assert!(matches!(
            poller.indexed_logs_with_sigs_excluding(SIG, SIG, 1, ADDR, 5, 4, Confirmations::Depth(0)).await,
            Err(PollerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn poll_once_rejected_while_running() {
        let (chain, heads, _, poller) = setup();
        chain.extend(3);
        heads.follow(&chain, 1);
        poller.start().await.unwrap();
        assert!(matches!(poller.poll_once().await, Err(PollerError::AlreadyStarted(_))));
        poller.close().await;
        poller.close().await;
        assert_eq!(poller.status(), PollerStatus::Stopped);
    }

    #[tokio::test]
    async fn reorg_listener_keeps_lowest_rollback() {
        let (_, _, _, poller) = setup();
        let event = |ancestor: i64| ReorgEvent {
            chain_id: ChainId(1),
            common_ancestor: Block::new(ancestor, "0x1", "0x0", 0),
            new_head: Block::new(ancestor + 3, "0x2", "0x1", 0),
            dropped: vec![],
        };
        let listener = poller.reorg_listener();
        listener.on_reorg(&event(9));
        listener.on_reorg(&event(6));
        listener.on_reorg(&event(8));
        assert_eq!(poller.inner.take_pending_rollback(), Some(7));
        assert_eq!(poller.inner.take_pending_rollback(), None);
    }
}
