//! In-memory store backend.
//!
//! Data lives in one partition per chain id, each behind its own lock, so
//! writers on one chain never contend with readers on another. Every write
//! takes the partition's write lock for its whole duration, which gives
//! readers the same before-or-after view a database transaction would.
//! All data is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PollerError;
use crate::filter::{Filter, RetentionRule};
use crate::store::{confirmation_bound, excess_logs, HeadStore, LogSelection, LogStore};
use crate::types::{Block, ChainId, Log, PollerState};

#[derive(Debug, Default)]
struct Partition {
    blocks: BTreeMap<i64, Block>,
    /// Keyed by `(block_number, log_index)`; at most one hash is current
    /// per block number.
    logs: BTreeMap<(i64, i64), Log>,
    filters: BTreeMap<String, Filter>,
    state: Option<PollerState>,
    heads: BTreeMap<i64, Block>,
}

impl Partition {
    fn upsert_block(&mut self, block: &Block) {
        if let Some(existing) = self.blocks.get(&block.number) {
            if existing.hash != block.hash {
                let stale: Vec<_> = self
                    .logs
                    .range((block.number, i64::MIN)..=(block.number, i64::MAX))
                    .filter(|(_, l)| l.block_hash != block.hash)
                    .map(|(k, _)| *k)
                    .collect();
                for key in stale {
                    self.logs.remove(&key);
                }
            }
        }
        self.blocks.insert(block.number, block.clone());
    }

    fn insert_log(&mut self, log: &Log) {
        let key = (log.block_number, log.log_index);
        match self.logs.get(&key) {
            Some(existing) if existing.block_hash == log.block_hash => {}
            _ => {
                self.logs.insert(key, log.clone());
            }
        }
    }

    fn delete_from(&mut self, from: i64) {
        self.blocks.split_off(&from);
        self.logs.split_off(&(from, i64::MIN));
    }

    fn bound(&self, selection: &LogSelection) -> Option<Option<i64>> {
        match selection.confirmations {
            None => Some(None),
            Some(c) => {
                let latest = self.blocks.keys().next_back().copied();
                let finalized = self.state.map_or(0, |s| s.last_finalized_block);
                confirmation_bound(c, latest, finalized).map(Some)
            }
        }
    }

    fn select<'a>(&'a self, selection: &'a LogSelection) -> Box<dyn DoubleEndedIterator<Item = &'a Log> + 'a> {
        let Some(bound) = self.bound(selection) else {
            return Box::new(std::iter::empty());
        };
        Box::new(
            self.logs
                .values()
                .filter(move |l| bound.map_or(true, |b| l.block_number <= b))
                .filter(move |l| selection.matches(l))
                .filter(move |l| match &selection.without_counterpart {
                    Some(c) => !self
                        .logs
                        .values()
                        .any(|other| selection.in_counterpart_range(other, bound) && c.pairs(l, other)),
                    None => true,
                }),
        )
    }

    /// Logs matching `filter` at or below `up_to`, newest first, past the
    /// filter's cap.
    fn over_cap(&self, filter: &Filter, up_to: i64) -> Vec<Log> {
        self.logs
            .range(..=(up_to, i64::MAX))
            .rev()
            .map(|(_, l)| l)
            .filter(|l| filter.matches(l))
            .skip(filter.max_logs_kept as usize)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct Shared {
    data: RwLock<Partition>,
    fail_writes: AtomicUsize,
}

/// Arena of per-chain partitions. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    partitions: Arc<Mutex<HashMap<ChainId, Arc<Shared>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store handle for one chain. Handles for the same chain share data.
    pub fn scoped(&self, chain_id: ChainId) -> MemoryChainStore {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let shared = partitions.entry(chain_id).or_default().clone();
        MemoryChainStore { chain_id, shared }
    }
}

/// A [`LogStore`] and [`HeadStore`] over one chain's partition.
#[derive(Debug, Clone)]
pub struct MemoryChainStore {
    chain_id: ChainId,
    shared: Arc<Shared>,
}

impl MemoryChainStore {
    /// Make the next `n` write transactions fail with a storage error.
    pub fn fail_next_writes(&self, n: usize) {
        self.shared.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of stored logs.
    pub fn log_count(&self) -> usize {
        self.read().logs.len()
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.read().blocks.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Partition> {
        self.shared.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Partition>, PollerError> {
        let injected = self
            .shared
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PollerError::Storage("injected write failure".into()));
        }
        Ok(self.shared.data.write().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl LogStore for MemoryChainStore {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn ping(&self) -> Result<(), PollerError> {
        Ok(())
    }

    async fn insert_blocks_and_logs(
        &self,
        blocks: &[Block],
        logs: &[Log],
        state: PollerState,
    ) -> Result<(), PollerError> {
        let mut p = self.write()?;
        for b in blocks {
            p.upsert_block(b);
        }
        for l in logs {
            p.insert_log(l);
        }
        p.state = Some(state);
        Ok(())
    }

    async fn replace_from_block(
        &self,
        from: i64,
        blocks: &[Block],
        logs: &[Log],
        state: PollerState,
    ) -> Result<(), PollerError> {
        let mut p = self.write()?;
        p.delete_from(from);
        for b in blocks {
            p.upsert_block(b);
        }
        for l in logs {
            p.insert_log(l);
        }
        p.state = Some(state);
        Ok(())
    }

    async fn delete_from_block(&self, from: i64) -> Result<(), PollerError> {
        let mut p = self.write()?;
        p.delete_from(from);
        if let Some(state) = p.state.as_mut() {
            state.last_processed_block = state.last_processed_block.min(from - 1);
        }
        Ok(())
    }

    async fn poller_state(&self) -> Result<Option<PollerState>, PollerError> {
        Ok(self.read().state)
    }

    async fn latest_block(&self) -> Result<Option<Block>, PollerError> {
        Ok(self.read().blocks.values().next_back().cloned())
    }

    async fn oldest_block(&self) -> Result<Option<Block>, PollerError> {
        Ok(self.read().blocks.values().next().cloned())
    }

    async fn block_by_number(&self, number: i64) -> Result<Option<Block>, PollerError> {
        Ok(self.read().blocks.get(&number).cloned())
    }

    async fn blocks_range(&self, from: i64, to: i64) -> Result<Vec<Block>, PollerError> {
        if from > to {
            return Ok(vec![]);
        }
        Ok(self.read().blocks.range(from..=to).map(|(_, b)| b.clone()).collect())
    }

    async fn select_logs(&self, selection: &LogSelection) -> Result<Vec<Log>, PollerError> {
        let p = self.read();
        let out = p.select(selection).cloned().collect();
        Ok(out)
    }

    async fn select_latest_log(&self, selection: &LogSelection) -> Result<Option<Log>, PollerError> {
        let p = self.read();
        let out = p.select(selection).next_back().cloned();
        Ok(out)
    }

    async fn insert_filter(&self, filter: &Filter) -> Result<(), PollerError> {
        self.write()?.filters.insert(filter.name.clone(), filter.clone());
        Ok(())
    }

    async fn delete_filter(&self, name: &str) -> Result<bool, PollerError> {
        Ok(self.write()?.filters.remove(name).is_some())
    }

    async fn load_filters(&self) -> Result<Vec<Filter>, PollerError> {
        Ok(self.read().filters.values().cloned().collect())
    }

    async fn delete_blocks_before(&self, end: i64, limit: u64) -> Result<u64, PollerError> {
        let mut p = self.write()?;
        let limit = if limit == 0 { usize::MAX } else { limit as usize };
        let doomed: Vec<i64> = p
            .blocks
            .range(..end)
            .map(|(n, _)| *n)
            .filter(|n| p.logs.range((*n, i64::MIN)..=(*n, i64::MAX)).next().is_none())
            .take(limit)
            .collect();
        for n in &doomed {
            p.blocks.remove(n);
        }
        Ok(doomed.len() as u64)
    }

    async fn delete_expired_logs(
        &self,
        rules: &[RetentionRule],
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64, PollerError> {
        let mut p = self.write()?;
        let limit = if limit == 0 { usize::MAX } else { limit as usize };
        let now = now.timestamp();
        let doomed: Vec<(i64, i64)> = p
            .logs
            .iter()
            .filter(|(_, l)| {
                rules.iter().any(|r| {
                    r.address == l.address
                        && r.event_sig == l.event_sig
                        && l.block_timestamp < now - r.max_age.as_secs() as i64
                })
            })
            .map(|(k, _)| *k)
            .take(limit)
            .collect();
        for key in &doomed {
            p.logs.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn delete_excess_logs(&self, filters: &[Filter], up_to: i64, limit: u64) -> Result<u64, PollerError> {
        let mut p = self.write()?;
        let over_cap = filters
            .iter()
            .filter(|f| f.max_logs_kept > 0)
            .map(|f| (f.name.as_str(), p.over_cap(f, up_to)))
            .collect();
        let doomed = excess_logs(filters, over_cap, limit);
        for log in &doomed {
            p.logs.remove(&(log.block_number, log.log_index));
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl HeadStore for MemoryChainStore {
    async fn save_heads(&self, heads: &[Block]) -> Result<(), PollerError> {
        let mut p = self.write()?;
        for h in heads {
            p.heads.insert(h.number, h.clone());
        }
        Ok(())
    }

    async fn load_heads(&self, limit: usize) -> Result<Vec<Block>, PollerError> {
        let p = self.read();
        let mut heads: Vec<Block> = p.heads.values().rev().take(limit).cloned().collect();
        heads.reverse();
        Ok(heads)
    }

    async fn delete_heads_after(&self, number: i64) -> Result<(), PollerError> {
        self.write()?.heads.split_off(&(number + 1));
        Ok(())
    }

    async fn trim_heads_below(&self, number: i64) -> Result<(), PollerError> {
        let mut p = self.write()?;
        let keep = p.heads.split_off(&number);
        p.heads = keep;
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
