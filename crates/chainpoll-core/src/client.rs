//! The chain client seam: everything the engine needs from a node.
//!
//! Implementations classify their failures into [`PollerError`] variants:
//! `TransientRpc` is retried, `LimitExceeded` makes the poller halve its
//! batch, and `NotFound` means the block does not exist (yet).

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::PollerError;
use crate::types::{normalize_hex, Block, ChainId};

/// A log as returned by the node, before the poller stamps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub block_number: i64,
    pub block_hash: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub address: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    /// Set by nodes that report logs dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

impl RawLog {
    /// Lowercases every hex field.
    pub fn normalized(mut self) -> Self {
        self.block_hash = normalize_hex(&self.block_hash);
        self.tx_hash = normalize_hex(&self.tx_hash);
        self.address = normalize_hex(&self.address);
        self.topics = self.topics.iter().map(normalize_hex).collect();
        self
    }

    /// `topics[0]`, or `None` for anonymous events.
    pub fn event_sig(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// An `eth_getLogs`-style range query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogQuery {
    pub from_block: i64,
    pub to_block: i64,
    /// Any of these addresses (empty = any).
    pub addresses: Vec<String>,
    /// Per-position topic alternatives; `topics[0]` holds event signatures.
    /// An empty position matches anything.
    pub topics: Vec<Vec<String>>,
}

/// A stream of new head headers pushed by the node.
pub type HeadStream = BoxStream<'static, Result<Block, PollerError>>;

/// Read access to one chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// The node's current head header.
    async fn latest_block(&self) -> Result<Block, PollerError>;

    /// The node's `finalized` tagged header.
    async fn finalized_block(&self) -> Result<Block, PollerError>;

    /// Header by number; `NotFound` if the node does not have it.
    async fn block_by_number(&self, number: i64) -> Result<Block, PollerError>;

    /// Headers for `numbers`, in the same order. Nodes that support batching
    /// should override this.
    async fn blocks_by_numbers(&self, numbers: &[i64]) -> Result<Vec<Block>, PollerError> {
        let mut out = Vec::with_capacity(numbers.len());
        for &n in numbers {
            out.push(self.block_by_number(n).await?);
        }
        Ok(out)
    }

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, PollerError>;

    /// Push subscription for new heads, if the transport supports one.
    /// `Ok(None)` makes the head tracker fall back to polling.
    async fn subscribe_new_heads(&self) -> Result<Option<HeadStream>, PollerError> {
        Ok(None)
    }
}
