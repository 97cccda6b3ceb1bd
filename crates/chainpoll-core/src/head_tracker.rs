//! Head tracker: follows one chain's head, keeps a window of recent heads,
//! detects reorgs and notifies listeners.
//!
//! # State machine
//!
//! ```text
//! Created ──start──▶ Running ◀──▶ Reconciling
//!                       │
//!                     close / fatal error
//!                       ▼
//!                    Stopped
//! ```

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::client::{ChainClient, HeadStream};
use crate::config::{FinalityMode, HeadTrackerConfig};
use crate::error::PollerError;
use crate::reorg::{HeadEvent, HeadListener, ReorgEvent};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::store::HeadStore;
use crate::tracker::HeadWindow;
use crate::types::{Block, ChainId};

/// Non-blocking read access to the latest accepted head.
pub trait HeadSource: Send + Sync {
    fn latest_head(&self) -> Option<Block>;
    fn latest_finalized(&self) -> Option<Block>;
}

/// Lifecycle state of a [`HeadTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Created,
    Running,
    Reconciling,
    Stopped,
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    head: Option<Block>,
    finalized: Option<Block>,
}

/// What one head did to the window.
enum Outcome {
    Unchanged,
    /// The window was empty or the head was too far ahead to link.
    Reset(Block),
    /// New blocks on top of the previous head, ascending.
    Extended(Vec<Block>),
    Reorg(ReorgEvent, Vec<Block>),
}

struct Inner {
    chain_id: ChainId,
    config: HeadTrackerConfig,
    client: Arc<dyn ChainClient>,
    head_store: Option<Arc<dyn HeadStore>>,
    retry: RetryPolicy,
    /// Held for the whole reconciliation of one head.
    window: tokio::sync::Mutex<HeadWindow>,
    snapshot: RwLock<Snapshot>,
    state: Mutex<TrackerState>,
    listeners: RwLock<Vec<Arc<dyn HeadListener>>>,
    events: broadcast::Sender<HeadEvent>,
    fatal: Mutex<Option<PollerError>>,
    shutdown: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Follows the head of one chain. Cheap to clone; clones share the tracker.
#[derive(Clone)]
pub struct HeadTracker {
    inner: Arc<Inner>,
}

enum Step {
    Shutdown,
    Poll,
    Pushed(Option<Result<Block, PollerError>>),
}

impl HeadTracker {
    pub fn new(
        client: Arc<dyn ChainClient>,
        config: HeadTrackerConfig,
        head_store: Option<Arc<dyn HeadStore>>,
    ) -> Result<Self, PollerError> {
        config.validate()?;
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                chain_id: client.chain_id(),
                retry: RetryPolicy::new(config.retry.clone()),
                window: tokio::sync::Mutex::new(HeadWindow::new(config.history_depth as usize)),
                config,
                client,
                head_store,
                snapshot: RwLock::new(Snapshot::default()),
                state: Mutex::new(TrackerState::Created),
                listeners: RwLock::new(Vec::new()),
                events,
                fatal: Mutex::new(None),
                shutdown,
                task: tokio::sync::Mutex::new(None),
            }),
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.inner.chain_id
    }

    /// Register a synchronous reorg listener.
    pub fn add_listener(&self, listener: Arc<dyn HeadListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Subscribe to every accepted head and reorg.
    pub fn subscribe(&self) -> broadcast::Receiver<HeadEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> TrackerState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The error that halted the loop, if any.
    pub fn health(&self) -> Option<PollerError> {
        self.inner.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Seed the window, accept the node's current head and spawn the loop.
    ///
    /// Fails without retrying if the node cannot be reached.
    pub async fn start(&self) -> Result<(), PollerError> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                TrackerState::Created => *state = TrackerState::Running,
                TrackerState::Stopped => return Err(PollerError::Stopped("head tracker")),
                _ => return Err(PollerError::AlreadyStarted("head tracker")),
            }
        }

        if let Err(e) = self.inner.seed().await {
            self.inner.set_state(TrackerState::Stopped);
            return Err(e);
        }

        let once = RetryPolicy::new(RetryConfig::none());
        let client = &self.inner.client;
        let head = once
            .run("latest_block", self.inner.config.rpc_timeout(), || client.latest_block())
            .await;
        let accepted = match head {
            Ok(head) => self.inner.handle_head(head).await,
            Err(e) => Err(e),
        };
        if let Err(e) = accepted {
            self.inner.set_state(TrackerState::Stopped);
            if e.is_fatal() {
                self.inner.set_fatal(e.clone());
            }
            return Err(e);
        }

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move { inner.run(shutdown).await });
        *self.inner.task.lock().await = Some(handle);

        tracing::info!(
            chain_id = %self.inner.chain_id,
            head = self.latest_head().map(|h| h.number),
            "head tracker started"
        );
        Ok(())
    }

    /// Stop the loop and wait for in-flight work. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(chain_id = %self.inner.chain_id, error = %e, "head tracker task panicked");
            }
        }
        self.inner.set_state(TrackerState::Stopped);
    }

    /// Accept a head as if the node had pushed it.
    pub async fn process_head(&self, head: Block) -> Result<(), PollerError> {
        self.inner.handle_head(head).await
    }
}

impl HeadSource for HeadTracker {
    fn latest_head(&self) -> Option<Block> {
        self.inner.snapshot.read().unwrap_or_else(PoisonError::into_inner).head.clone()
    }

    fn latest_finalized(&self) -> Option<Block> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .finalized
            .clone()
    }
}

impl Inner {
    fn set_state(&self, next: TrackerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != TrackerState::Stopped {
            *state = next;
        }
    }

    fn set_fatal(&self, e: PollerError) {
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
    }

    fn finalized_number(&self) -> i64 {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .finalized
            .as_ref()
            .map_or(-1, |b| b.number)
    }

    async fn seed(&self) -> Result<(), PollerError> {
        let Some(store) = &self.head_store else {
            return Ok(());
        };
        let heads = store.load_heads(self.config.history_depth as usize).await?;
        if heads.is_empty() {
            return Ok(());
        }
        let seeded = HeadWindow::from_blocks(self.config.history_depth as usize, heads);
        tracing::debug!(
            chain_id = %self.chain_id,
            heads = seeded.len(),
            head = seeded.head().map(|h| h.number),
            "seeded head window from store"
        );
        *self.window.lock().await = seeded;
        Ok(())
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut subscription = match self.client.subscribe_new_heads().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(chain_id = %self.chain_id, error = %e, "head subscription unavailable, polling");
                None
            }
        };
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let polling = subscription.is_none();
            let step = tokio::select! {
                _ = shutdown.changed() => Step::Shutdown,
                pushed = next_pushed(&mut subscription), if !polling => Step::Pushed(pushed),
                _ = ticker.tick(), if polling => Step::Poll,
            };

            let result = match step {
                Step::Shutdown => break,
                Step::Poll => {
                    let client = &self.client;
                    match self
                        .retry
                        .run("latest_block", self.config.rpc_timeout(), || client.latest_block())
                        .await
                    {
                        Ok(head) => self.handle_head(head).await,
                        Err(e) => Err(e),
                    }
                }
                Step::Pushed(Some(Ok(head))) => self.handle_head(head).await,
                Step::Pushed(Some(Err(e))) => {
                    tracing::warn!(chain_id = %self.chain_id, error = %e, "head subscription failed, falling back to polling");
                    subscription = None;
                    Ok(())
                }
                Step::Pushed(None) => {
                    tracing::warn!(chain_id = %self.chain_id, "head subscription ended, falling back to polling");
                    subscription = None;
                    Ok(())
                }
            };

            if let Err(e) = result {
                if e.is_fatal() {
                    tracing::error!(chain_id = %self.chain_id, error = %e, "head tracker halted");
                    self.set_fatal(e);
                    self.set_state(TrackerState::Stopped);
                    break;
                }
                tracing::warn!(chain_id = %self.chain_id, error = %e, "failed to process head");
            }
        }
        tracing::debug!(chain_id = %self.chain_id, "head tracker loop exited");
    }

    async fn fetch_block(&self, number: i64) -> Result<Block, PollerError> {
        let client = &self.client;
        self.retry
            .run("block_by_number", self.config.rpc_timeout(), || client.block_by_number(number))
            .await
    }

    async fn handle_head(&self, head: Block) -> Result<(), PollerError> {
        let mut window = self.window.lock().await;
        let outcome = self.reconcile(&mut window, head).await;
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == TrackerState::Reconciling {
                *state = TrackerState::Running;
            }
        }
        let outcome = outcome?;

        let (accepted, reorg) = match outcome {
            Outcome::Unchanged => return Ok(()),
            Outcome::Reset(block) => (self.backfill_window(&mut window, block).await, None),
            Outcome::Extended(blocks) => (blocks, None),
            Outcome::Reorg(event, blocks) => (blocks, Some(event)),
        };
        let Some(new_head) = accepted.last().cloned() else {
            return Ok(());
        };

        let finalized = self.next_finalized(&window, &new_head).await;
        self.persist(&window, &accepted, reorg.as_ref()).await;
        drop(window);

        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(event) = &reorg {
            tracing::warn!(
                chain_id = %self.chain_id,
                depth = event.depth(),
                ancestor = event.common_ancestor.number,
                new_head = event.new_head.number,
                "reorg detected"
            );
            for l in &listeners {
                l.on_reorg(event);
            }
        }
        for l in &listeners {
            l.on_new_head(&new_head);
        }

        {
            let mut snap = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            snap.head = Some(new_head.clone());
            if let Some(f) = finalized {
                snap.finalized = Some(f);
            }
        }

        tracing::debug!(chain_id = %self.chain_id, number = new_head.number, hash = %new_head.hash, "new head");
        if let Some(event) = reorg {
            let _ = self.events.send(HeadEvent::Reorg(event));
        }
        let _ = self.events.send(HeadEvent::NewHead(new_head));
        Ok(())
    }

    async fn reconcile(&self, window: &mut HeadWindow, head: Block) -> Result<Outcome, PollerError> {
        let (Some(current), Some(oldest)) = (window.head().cloned(), window.oldest().cloned()) else {
            window.reset(head.clone());
            return Ok(Outcome::Reset(head));
        };

        if window.get(head.number).is_some_and(|known| known.hash == head.hash) {
            return Ok(Outcome::Unchanged);
        }

        if head.number < oldest.number {
            tracing::warn!(
                chain_id = %self.chain_id,
                number = head.number,
                oldest = oldest.number,
                "stale head below the tracked window, ignoring"
            );
            return Ok(Outcome::Unchanged);
        }

        let history = self.config.history_depth as i64;
        if head.number > current.number + history {
            tracing::warn!(
                chain_id = %self.chain_id,
                from = current.number,
                to = head.number,
                "head gap exceeds history depth, resetting window"
            );
            window.reset(head.clone());
            return Ok(Outcome::Reset(head));
        }

        if !head.extends(&current) {
            self.set_state(TrackerState::Reconciling);
        }

        // Walk back from the new head until its parent is in the window.
        let finalized = self.finalized_number();
        let mut branch = vec![head.clone()];
        let ancestor = loop {
            let tip = &branch[branch.len() - 1];
            let parent_number = tip.number - 1;
            match window.get(parent_number) {
                Some(stored) if stored.hash == tip.parent_hash => break stored.clone(),
                Some(stored) if stored.number <= finalized => {
                    return Err(PollerError::ReorgDepthExceeded { at: stored.number, floor: finalized });
                }
                None if parent_number < oldest.number => {
                    return Err(PollerError::ReorgDepthExceeded { at: parent_number, floor: oldest.number });
                }
                _ => {}
            }
            if branch.len() as i64 > history {
                return Err(PollerError::ReorgDepthExceeded {
                    at: parent_number,
                    floor: head.number - history,
                });
            }
            let parent = self.fetch_block(parent_number).await?;
            if parent.hash != tip.parent_hash {
                return Err(PollerError::TransientRpc(format!(
                    "chain moved while walking ancestors of block {}",
                    head.number
                )));
            }
            branch.push(parent);
        };

        let dropped = window.rewind_to(ancestor.number);
        branch.reverse();
        for b in &branch {
            window.append(b.clone());
        }

        if dropped.is_empty() {
            Ok(Outcome::Extended(branch))
        } else {
            let event = ReorgEvent {
                chain_id: self.chain_id,
                common_ancestor: ancestor,
                new_head: head,
                dropped,
            };
            Ok(Outcome::Reorg(event, branch))
        }
    }

    /// Fill a freshly reset window with the ancestors of `head`. Returns the
    /// window's blocks, ascending.
    async fn backfill_window(&self, window: &mut HeadWindow, head: Block) -> Vec<Block> {
        let from = (head.number - self.config.history_depth as i64 + 1).max(0);
        let numbers: Vec<i64> = (from..head.number).collect();
        if numbers.is_empty() {
            return vec![head];
        }
        let client = &self.client;
        let fetched = self
            .retry
            .run("blocks_by_numbers", self.config.rpc_timeout(), || client.blocks_by_numbers(&numbers))
            .await;
        match fetched {
            Ok(mut blocks) => {
                blocks.push(head);
                *window = HeadWindow::from_blocks(window.capacity(), blocks);
                window.iter().cloned().collect()
            }
            Err(e) => {
                tracing::warn!(chain_id = %self.chain_id, error = %e, "failed to backfill head window");
                vec![head]
            }
        }
    }

    /// Finalized block for `head`; never lower than the current one.
    async fn next_finalized(&self, window: &HeadWindow, head: &Block) -> Option<Block> {
        let candidate = match self.config.finality {
            FinalityMode::FixedDepth { depth } => {
                let number = (head.number - depth as i64).max(0);
                match window.get(number) {
                    Some(b) => Ok(b.clone()),
                    None => self.fetch_block(number).await,
                }
            }
            FinalityMode::FinalizedTag => {
                let client = &self.client;
                self.retry
                    .run("finalized_block", self.config.rpc_timeout(), || client.finalized_block())
                    .await
            }
        };
        let candidate = match candidate {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(chain_id = %self.chain_id, error = %e, "failed to fetch finalized block");
                return None;
            }
        };
        let current = self.finalized_number();
        if candidate.number < current {
            tracing::warn!(
                chain_id = %self.chain_id,
                current,
                reported = candidate.number,
                "finalized block moved backwards, ignoring"
            );
            return None;
        }
        Some(candidate)
    }

    async fn persist(&self, window: &HeadWindow, accepted: &[Block], reorg: Option<&ReorgEvent>) {
        let Some(store) = &self.head_store else {
            return;
        };
        let result = async {
            if let Some(event) = reorg {
                store.delete_heads_after(event.common_ancestor.number).await?;
            }
            store.save_heads(accepted).await?;
            if let Some(oldest) = window.oldest() {
                store.trim_heads_below(oldest.number).await?;
            }
            Ok::<_, PollerError>(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(chain_id = %self.chain_id, error = %e, "failed to persist heads");
        }
    }
}

async fn next_pushed(subscription: &mut Option<HeadStream>) -> Option<Result<Block, PollerError>> {
    match subscription {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
