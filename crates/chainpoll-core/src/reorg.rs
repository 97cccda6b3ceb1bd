//! Reorg signals emitted by the head tracker.
//!
//! Two delivery paths exist:
//! 1. [`HeadListener`]s are called synchronously, before the head tracker
//!    publishes the new head, so a log poller can never observe the new
//!    head without having seen the reorg first.
//! 2. [`HeadEvent`]s are broadcast to any number of async subscribers.

use serde::{Deserialize, Serialize};

use crate::types::{Block, ChainId};

/// Describes a detected chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgEvent {
    pub chain_id: ChainId,
    /// Highest block shared by the old and the new branch.
    pub common_ancestor: Block,
    /// The new canonical head.
    pub new_head: Block,
    /// Blocks of the old branch that were dropped, newest first.
    pub dropped: Vec<Block>,
}

impl ReorgEvent {
    /// Number of blocks rolled back (old head minus common ancestor).
    pub fn depth(&self) -> u64 {
        self.dropped.len() as u64
    }

    /// First block number whose contents must be re-fetched.
    pub fn rollback_from(&self) -> i64 {
        self.common_ancestor.number + 1
    }
}

/// Notification fanned out for every accepted head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadEvent {
    NewHead(Block),
    Reorg(ReorgEvent),
}

/// Synchronous reorg listener registered with a head tracker.
///
/// Implementations must not block: they run on the tracker's loop.
pub trait HeadListener: Send + Sync {
    fn on_reorg(&self, event: &ReorgEvent);

    fn on_new_head(&self, _head: &Block) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_and_rollback_point() {
        let ancestor = Block::new(8, "0x8", "0x7", 96);
        let event = ReorgEvent {
            chain_id: ChainId(1),
            common_ancestor: ancestor,
            new_head: Block::new(12, "0xc2", "0xb2", 144),
            dropped: vec![
                Block::new(11, "0xb", "0xa", 132),
                Block::new(10, "0xa", "0x9", 120),
                Block::new(9, "0x9", "0x8", 108),
            ],
        };
        assert_eq!(event.depth(), 3);
        assert_eq!(event.rollback_from(), 9);
    }
}
