//! Head tracker and log poller configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PollerError;
use crate::retry::RetryConfig;

// ─── Finality ─────────────────────────────────────────────────────────────────

/// How the head tracker decides which block is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FinalityMode {
    /// `finalized = latest - depth`, clamped at 0.
    FixedDepth { depth: u64 },
    /// The chain's `finalized` tagged block.
    FinalizedTag,
}

impl Default for FinalityMode {
    fn default() -> Self {
        Self::FixedDepth { depth: 50 }
    }
}

// ─── HeadTrackerConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadTrackerConfig {
    /// Latest-block polling period when no subscription is available.
    pub poll_interval_ms: u64,
    /// Number of recent heads kept; also the deepest reorg that can be
    /// reconciled.
    pub history_depth: u64,
    pub finality: FinalityMode,
    /// Per-call RPC timeout.
    pub rpc_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for HeadTrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            history_depth: 128,
            finality: FinalityMode::default(),
            rpc_timeout_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl HeadTrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), PollerError> {
        if self.poll_interval_ms == 0 {
            return Err(PollerError::Config("head_tracker.poll_interval_ms must be > 0".into()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(PollerError::Config("head_tracker.rpc_timeout_ms must be > 0".into()));
        }
        if self.history_depth == 0 {
            return Err(PollerError::Config("head_tracker.history_depth must be > 0".into()));
        }
        if let FinalityMode::FixedDepth { depth } = self.finality {
            if self.history_depth <= depth {
                return Err(PollerError::Config(format!(
                    "head_tracker.history_depth ({}) must exceed the finality depth ({depth})",
                    self.history_depth
                )));
            }
        }
        self.retry.validate()
    }
}

// ─── PollerConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub poll_interval_ms: u64,
    /// First block to index when the store is empty. `None` starts at the
    /// finalized block.
    pub start_block: Option<i64>,
    /// Maximum blocks covered by one `filter_logs` call and one store
    /// transaction.
    pub backfill_batch_size: u64,
    /// Maximum headers requested per batched header call.
    pub rpc_batch_size: u64,
    /// Deepest divergence the poller will walk back through.
    pub max_reorg_depth: u64,
    /// Blocks this far below finalized that carry no logs are pruned
    /// (0 = keep all blocks).
    pub keep_finalized_blocks_depth: u64,
    pub prune_interval_ms: u64,
    /// Maximum rows deleted per pruning statement (0 = unlimited).
    pub log_prune_page_size: u64,
    /// Run the backup poller every `delay × poll_interval` (0 = disabled).
    pub backup_poller_block_delay: u64,
    pub rpc_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            start_block: None,
            backfill_batch_size: 1000,
            rpc_batch_size: 100,
            max_reorg_depth: 128,
            keep_finalized_blocks_depth: 0,
            prune_interval_ms: 60_000,
            log_prune_page_size: 0,
            backup_poller_block_delay: 0,
            rpc_timeout_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl PollerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Backup poller period, if enabled.
    pub fn backup_interval(&self) -> Option<Duration> {
        (self.backup_poller_block_delay > 0).then(|| {
            Duration::from_millis(self.poll_interval_ms.saturating_mul(self.backup_poller_block_delay))
        })
    }

    pub fn validate(&self) -> Result<(), PollerError> {
        let non_zero = [
            ("poller.poll_interval_ms", self.poll_interval_ms),
            ("poller.backfill_batch_size", self.backfill_batch_size),
            ("poller.rpc_batch_size", self.rpc_batch_size),
            ("poller.max_reorg_depth", self.max_reorg_depth),
            ("poller.prune_interval_ms", self.prune_interval_ms),
            ("poller.rpc_timeout_ms", self.rpc_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(PollerError::Config(format!("{name} must be > 0")));
            }
        }
        if let Some(start) = self.start_block {
            if start < 0 {
                return Err(PollerError::Config("poller.start_block must be >= 0".into()));
            }
        }
        self.retry.validate()
    }
}
