//! A scriptable in-memory chain for tests and local experiments.
//!
//! The chain starts with a genesis block and grows with [`MockChainClient::extend`].
//! [`MockChainClient::reorg`] swaps the tail for a fresh fork, dropping the
//! logs attached to the replaced blocks. Failures and result-size limits can
//! be injected to exercise the retry and batch-halving paths.
//!
//! Compiled for this crate's tests and behind the `test-utils` feature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::client::{ChainClient, LogQuery, RawLog};
use crate::error::PollerError;
use crate::head_tracker::HeadSource;
use crate::types::{normalize_hex, Block, ChainId};

const GENESIS_TIMESTAMP: i64 = 1_700_000_000;
const BLOCK_TIME: i64 = 12;

#[derive(Debug, Default)]
struct MockChain {
    /// Canonical blocks; index == block number.
    blocks: Vec<Block>,
    /// Logs by block hash.
    logs: HashMap<String, Vec<RawLog>>,
    fork: u64,
    finalized: Option<i64>,
    fail_next: usize,
    max_log_range: Option<i64>,
}

impl MockChain {
    fn make_block(&self, number: i64, parent_hash: &str) -> Block {
        Block::new(
            number,
            format!("0x{:016x}{:048x}", self.fork, number),
            parent_hash,
            GENESIS_TIMESTAMP + number * BLOCK_TIME,
        )
    }

    fn push_block(&mut self) -> Block {
        let number = self.blocks.len() as i64;
        let parent = self
            .blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| format!("0x{:064x}", 0));
        let block = self.make_block(number, &parent);
        self.blocks.push(block.clone());
        block
    }

    fn take_failure(&mut self, call: &str) -> Result<(), PollerError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(PollerError::TransientRpc(format!("injected failure in {call}")));
        }
        Ok(())
    }
}

/// In-memory [`ChainClient`].
#[derive(Debug)]
pub struct MockChainClient {
    chain_id: ChainId,
    chain: Mutex<MockChain>,
    calls: AtomicUsize,
    log_calls: AtomicUsize,
}

impl MockChainClient {
    /// A chain holding only its genesis block.
    pub fn new(chain_id: ChainId) -> Self {
        let mut chain = MockChain::default();
        chain.push_block();
        Self {
            chain_id,
            chain: Mutex::new(chain),
            calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockChain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mine `n` blocks; returns the new head.
    pub fn extend(&self, n: usize) -> Block {
        let mut chain = self.lock();
        for _ in 0..n {
            chain.push_block();
        }
        chain.blocks[chain.blocks.len() - 1].clone()
    }

    /// Replace every block at or above `from` with `len` blocks of a new fork.
    pub fn reorg(&self, from: i64, len: usize) -> Block {
        let mut chain = self.lock();
        let start = (from.max(1) as usize).min(chain.blocks.len());
        let dropped: Vec<Block> = chain.blocks.drain(start..).collect();
        for b in dropped {
            chain.logs.remove(&b.hash);
        }
        chain.fork += 1;
        for _ in 0..len {
            chain.push_block();
        }
        chain.blocks[chain.blocks.len() - 1].clone()
    }

    /// Attach a log to the canonical block `number`. Returns it.
    ///
    /// Panics if `number` is not on the chain.
    pub fn add_log(&self, number: i64, address: &str, topics: &[&str], data: Vec<u8>) -> RawLog {
        let mut chain = self.lock();
        let block = chain.blocks[number as usize].clone();
        let entry = chain.logs.entry(block.hash.clone()).or_default();
        let log = RawLog {
            block_number: number,
            block_hash: block.hash.clone(),
            tx_hash: format!("0x{:064x}", ((number as u64) << 16) | entry.len() as u64),
            log_index: entry.len() as i64,
            address: normalize_hex(address),
            topics: topics.iter().map(normalize_hex).collect(),
            data,
            removed: false,
        };
        entry.push(log.clone());
        log
    }

    pub fn head(&self) -> Block {
        let chain = self.lock();
        chain.blocks[chain.blocks.len() - 1].clone()
    }

    pub fn block(&self, number: i64) -> Option<Block> {
        self.lock().blocks.get(usize::try_from(number).ok()?).cloned()
    }

    /// Value reported by the `finalized` tag; `None` means genesis.
    pub fn set_finalized(&self, number: Option<i64>) {
        self.lock().finalized = number;
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Reject `filter_logs` ranges wider than `blocks` with `LimitExceeded`.
    pub fn set_max_log_range(&self, blocks: Option<i64>) {
        self.lock().max_log_range = blocks;
    }

    /// Total calls made, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn latest_block(&self) -> Result<Block, PollerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut chain = self.lock();
        chain.take_failure("latest_block")?;
        Ok(chain.blocks[chain.blocks.len() - 1].clone())
    }

    async fn finalized_block(&self) -> Result<Block, PollerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut chain = self.lock();
        chain.take_failure("finalized_block")?;
        let n = chain.finalized.unwrap_or(0).clamp(0, chain.blocks.len() as i64 - 1);
        Ok(chain.blocks[n as usize].clone())
    }

    async fn block_by_number(&self, number: i64) -> Result<Block, PollerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut chain = self.lock();
        chain.take_failure("block_by_number")?;
        usize::try_from(number)
            .ok()
            .and_then(|n| chain.blocks.get(n).cloned())
            .ok_or_else(|| PollerError::NotFound(format!("block {number}")))
    }

    async fn blocks_by_numbers(&self, numbers: &[i64]) -> Result<Vec<Block>, PollerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut chain = self.lock();
        chain.take_failure("blocks_by_numbers")?;
        numbers
            .iter()
            .map(|&number| {
                usize::try_from(number)
                    .ok()
                    .and_then(|n| chain.blocks.get(n).cloned())
                    .ok_or_else(|| PollerError::NotFound(format!("block {number}")))
            })
            .collect()
    }

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, PollerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        let mut chain = self.lock();
        chain.take_failure("filter_logs")?;
        if let Some(max) = chain.max_log_range {
            if query.to_block - query.from_block + 1 > max {
                return Err(PollerError::LimitExceeded(format!(
                    "query returned more than {max} blocks of results"
                )));
            }
        }

        let head = chain.blocks.len() as i64 - 1;
        let mut out = Vec::new();
        for number in query.from_block.max(0)..=query.to_block.min(head) {
            let hash = &chain.blocks[number as usize].hash;
            let Some(logs) = chain.logs.get(hash) else {
                continue;
            };
            for log in logs {
                let address_ok = query.addresses.is_empty() || query.addresses.contains(&log.address);
                let topics_ok = query.topics.iter().enumerate().all(|(i, accepted)| {
                    accepted.is_empty() || log.topics.get(i).is_some_and(|t| accepted.contains(t))
                });
                if address_ok && topics_ok {
                    out.push(log.clone());
                }
            }
        }
        Ok(out)
    }
}

// ─── MockHeads ────────────────────────────────────────────────────────────────

/// A [`HeadSource`] set by hand, for driving a poller without a tracker.
#[derive(Debug, Default)]
pub struct MockHeads {
    heads: Mutex<(Option<Block>, Option<Block>)>,
}

impl MockHeads {
    pub fn set(&self, head: Block, finalized: Option<Block>) {
        *self.heads.lock().unwrap_or_else(PoisonError::into_inner) = (Some(head), finalized);
    }

    /// Point at `chain`'s head with `finality_depth` blocks to finality.
    pub fn follow(&self, chain: &MockChainClient, finality_depth: i64) {
        let head = chain.head();
        let finalized = chain.block((head.number - finality_depth).max(0));
        self.set(head, finalized);
    }
}

impl HeadSource for MockHeads {
    fn latest_head(&self) -> Option<Block> {
        self.heads.lock().unwrap_or_else(PoisonError::into_inner).0.clone()
    }

    fn latest_finalized(&self) -> Option<Block> {
        self.heads.lock().unwrap_or_else(PoisonError::into_inner).1.clone()
    }
}
