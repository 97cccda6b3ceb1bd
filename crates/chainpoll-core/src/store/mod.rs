//! Store traits for indexed blocks, logs, filters and tracked heads.
//!
//! A store handle is scoped to one chain: every row it reads or writes
//! belongs to [`LogStore::chain_id`]. Backends partition their data by
//! chain id so independent engines never see each other's rows.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PollerError;
use crate::filter::{Filter, RetentionRule};
use crate::types::{word_hex, Block, ChainId, Confirmations, Log, PollerState, Word};

pub use memory::MemoryStore;

// ─── Selection ────────────────────────────────────────────────────────────────

/// Equality match on one indexed topic position (1..=3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch {
    pub index: usize,
    pub values: Vec<String>,
}

/// Byte-order comparison against a 32-byte word of the log. Logs too short
/// to carry the word never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WordMatch {
    /// `min <= data[index] <= max`; a `None` bound is open.
    DataRange { index: usize, min: Option<Word>, max: Option<Word> },
    /// `data[lower] <= value <= data[upper]`.
    DataBetween { lower: usize, upper: usize, value: Word },
    /// `min <= topics[index] <= max` for a full-width topic; a `None` bound
    /// is open.
    TopicRange { index: usize, min: Option<Word>, max: Option<Word> },
}

impl WordMatch {
    pub fn matches(&self, log: &Log) -> bool {
        match self {
            Self::DataRange { index, min, max } => log.data_word(*index).is_some_and(|w| {
                min.as_ref().map_or(true, |m| w >= &m[..]) && max.as_ref().map_or(true, |m| w <= &m[..])
            }),
            Self::DataBetween { lower, upper, value } => {
                match (log.data_word(*lower), log.data_word(*upper)) {
                    (Some(lo), Some(hi)) => lo <= &value[..] && hi >= &value[..],
                    _ => false,
                }
            }
            // Equal-length lowercase hex orders like the bytes it encodes.
            Self::TopicRange { index, min, max } => log.topic(*index).is_some_and(|t| {
                t.len() == TOPIC_HEX_LEN
                    && min.as_ref().map_or(true, |m| t >= word_hex(m).as_str())
                    && max.as_ref().map_or(true, |m| t <= word_hex(m).as_str())
            }),
        }
    }
}

/// Length of a stored full-width topic: `0x` and 64 hex digits.
pub const TOPIC_HEX_LEN: usize = 66;

/// Excludes a log when a counterpart exists: a log from the same address
/// with `event_sig` whose topic at `topic_index` equals the log's own, inside
/// the same block range and confirmation bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterpart {
    pub event_sig: String,
    pub topic_index: usize,
}

impl Counterpart {
    /// Returns `true` if `other` is a counterpart of `log`.
    pub fn pairs(&self, log: &Log, other: &Log) -> bool {
        other.address == log.address
            && other.event_sig == self.event_sig
            && other.topic(self.topic_index).is_some()
            && other.topic(self.topic_index) == log.topic(self.topic_index)
    }
}

/// Read predicate shared by every log query. Empty vectors and `None`
/// fields do not restrict the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSelection {
    pub addresses: Vec<String>,
    pub event_sigs: Vec<String>,
    /// Inclusive lower block bound.
    pub from_block: Option<i64>,
    /// Inclusive upper block bound.
    pub to_block: Option<i64>,
    pub topic: Option<TopicMatch>,
    pub tx_hash: Option<String>,
    /// Strictly after this persistence time.
    pub created_after: Option<DateTime<Utc>>,
    pub confirmations: Option<Confirmations>,
    pub word: Option<WordMatch>,
    pub without_counterpart: Option<Counterpart>,
}

impl LogSelection {
    /// Checks every field except `confirmations` and `without_counterpart`,
    /// which need store state.
    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        if !self.event_sigs.is_empty() && !self.event_sigs.contains(&log.event_sig) {
            return false;
        }
        if self.from_block.is_some_and(|from| log.block_number < from) {
            return false;
        }
        if self.to_block.is_some_and(|to| log.block_number > to) {
            return false;
        }
        if let Some(t) = &self.topic {
            match log.topic(t.index) {
                Some(v) if t.values.iter().any(|x| x == v) => {}
                _ => return false,
            }
        }
        if let Some(tx) = &self.tx_hash {
            if &log.tx_hash != tx {
                return false;
            }
        }
        if self.created_after.is_some_and(|after| log.created_at <= after) {
            return false;
        }
        if self.word.as_ref().is_some_and(|w| !w.matches(log)) {
            return false;
        }
        true
    }

    /// Whether `other` may serve as a counterpart for this selection: inside
    /// the block range and under `bound`.
    pub fn in_counterpart_range(&self, other: &Log, bound: Option<i64>) -> bool {
        self.from_block.map_or(true, |from| other.block_number >= from)
            && self.to_block.map_or(true, |to| other.block_number <= to)
            && bound.map_or(true, |b| other.block_number <= b)
    }
}

/// Picks the logs to delete for per-filter log caps.
///
/// `over_cap` holds, per capped filter name, the logs ranked past that
/// filter's `max_logs_kept`. A log is deleted only if every filter in
/// `filters` that matches it is capped and ranks it past its cap. Returns
/// at most `limit` logs (0 = unlimited), oldest first.
pub fn excess_logs(filters: &[Filter], over_cap: Vec<(&str, Vec<Log>)>, limit: u64) -> Vec<Log> {
    let mut candidates: BTreeMap<(i64, i64, String), (Log, BTreeSet<&str>)> = BTreeMap::new();
    for (name, logs) in over_cap {
        for log in logs {
            let key = (log.block_number, log.log_index, log.block_hash.clone());
            candidates.entry(key).or_insert_with(|| (log, BTreeSet::new())).1.insert(name);
        }
    }
    let limit = if limit == 0 { usize::MAX } else { limit as usize };
    candidates
        .into_values()
        .filter(|(log, marked)| {
            filters
                .iter()
                .filter(|f| f.matches(log))
                .all(|f| f.max_logs_kept > 0 && marked.contains(f.name.as_str()))
        })
        .map(|(log, _)| log)
        .take(limit)
        .collect()
}

/// Highest block number a confirmation-bounded read may return, given the
/// latest stored block and the stored finalized block. `None` means no
/// block qualifies.
pub fn confirmation_bound(
    confirmations: Confirmations,
    latest: Option<i64>,
    last_finalized: i64,
) -> Option<i64> {
    match confirmations {
        Confirmations::Depth(n) => {
            let latest = latest?;
            let bound = latest - i64::try_from(n).unwrap_or(i64::MAX);
            (bound >= 0).then_some(bound)
        }
        Confirmations::Finalized => (last_finalized > 0).then_some(last_finalized),
    }
}

// ─── LogStore ─────────────────────────────────────────────────────────────────

/// Durable per-chain storage of indexed blocks and logs.
///
/// Every write method is one transaction: readers observe either the state
/// before it or the state after it.
#[async_trait]
pub trait LogStore: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Fails if the backend is unreachable.
    async fn ping(&self) -> Result<(), PollerError>;

    /// Upsert blocks and logs and write `state`.
    ///
    /// A block whose stored hash differs replaces the stored one and drops
    /// the logs that referenced the old hash. Existing log keys are kept.
    async fn insert_blocks_and_logs(
        &self,
        blocks: &[Block],
        logs: &[Log],
        state: PollerState,
    ) -> Result<(), PollerError>;

    /// Delete every block and log at or above `from`, insert the
    /// replacement rows and write `state`.
    async fn replace_from_block(
        &self,
        from: i64,
        blocks: &[Block],
        logs: &[Log],
        state: PollerState,
    ) -> Result<(), PollerError>;

    /// Delete every block and log at or above `from` and clamp
    /// `last_processed_block` to `from - 1`.
    async fn delete_from_block(&self, from: i64) -> Result<(), PollerError>;

    async fn poller_state(&self) -> Result<Option<PollerState>, PollerError>;

    /// Highest stored block.
    async fn latest_block(&self) -> Result<Option<Block>, PollerError>;

    /// Lowest stored block.
    async fn oldest_block(&self) -> Result<Option<Block>, PollerError>;

    async fn block_by_number(&self, number: i64) -> Result<Option<Block>, PollerError>;

    /// Stored blocks in `[from, to]`, ascending.
    async fn blocks_range(&self, from: i64, to: i64) -> Result<Vec<Block>, PollerError>;

    /// Matching logs ordered by `(block_number, log_index)` ascending.
    async fn select_logs(&self, selection: &LogSelection) -> Result<Vec<Log>, PollerError>;

    /// The matching log with the highest `(block_number, log_index)`.
    async fn select_latest_log(&self, selection: &LogSelection) -> Result<Option<Log>, PollerError>;

    /// Insert or replace a filter by name.
    async fn insert_filter(&self, filter: &Filter) -> Result<(), PollerError>;

    /// Returns `false` if no filter had that name.
    async fn delete_filter(&self, name: &str) -> Result<bool, PollerError>;

    async fn load_filters(&self) -> Result<Vec<Filter>, PollerError>;

    /// Delete up to `limit` blocks below `end` that carry no logs
    /// (`limit == 0` is unlimited). Returns the number deleted.
    async fn delete_blocks_before(&self, end: i64, limit: u64) -> Result<u64, PollerError>;

    /// Delete up to `limit` logs whose block timestamp is older than their
    /// rule's `max_age` at `now`. Returns the number deleted.
    async fn delete_expired_logs(
        &self,
        rules: &[RetentionRule],
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<u64, PollerError>;

    /// Delete up to `limit` logs at or below `up_to` that exceed the
    /// `max_logs_kept` of every filter matching them; see [`excess_logs`].
    /// Returns the number deleted.
    async fn delete_excess_logs(&self, filters: &[Filter], up_to: i64, limit: u64) -> Result<u64, PollerError>;
}

// ─── HeadStore ────────────────────────────────────────────────────────────────

/// Persistence for the head tracker's window.
#[async_trait]
pub trait HeadStore: Send + Sync {
    /// Upsert heads by number.
    async fn save_heads(&self, heads: &[Block]) -> Result<(), PollerError>;

    /// The `limit` highest heads, ascending.
    async fn load_heads(&self, limit: usize) -> Result<Vec<Block>, PollerError>;

    async fn delete_heads_after(&self, number: i64) -> Result<(), PollerError>;

    async fn trim_heads_below(&self, number: i64) -> Result<(), PollerError>;
}
