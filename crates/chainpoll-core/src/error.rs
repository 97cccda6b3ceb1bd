//! Error types for the head tracker and log poller.

use thiserror::Error;

/// Errors surfaced by the indexing engine, its chain client and its store.
#[derive(Debug, Clone, Error)]
pub enum PollerError {
    /// Network failure, timeout or rate limit. Retried with backoff.
    #[error("transient RPC error: {0}")]
    TransientRpc(String),

    /// The node refused the request because the result set is too large.
    #[error("RPC result limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Divergence deeper than the tracked window or the last finalized block.
    #[error("reorg at block {at} is deeper than the tracked window (floor {floor})")]
    ReorgDepthExceeded { at: i64, floor: i64 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid replay block {requested}, acceptable range [1, {latest}]")]
    InvalidReplayBlock { requested: i64, latest: i64 },

    #[error("replay aborted: {0}")]
    ReplayAborted(String),

    #[error("replay request cancelled, but replay is already in progress")]
    ReplayInProgress,

    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    #[error("{0} is not running")]
    Stopped(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl PollerError {
    /// Returns `true` if the error is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientRpc(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` if the error halts the chain's engine until an operator
    /// intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ReorgDepthExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(PollerError::TransientRpc("timeout".into()).is_retryable());
        assert!(!PollerError::LimitExceeded("too many".into()).is_retryable());
        assert!(!PollerError::Storage("locked".into()).is_retryable());
        assert!(PollerError::NotFound("block 7".into()).is_not_found());
        assert!(PollerError::ReorgDepthExceeded { at: 10, floor: 4 }.is_fatal());
        assert!(!PollerError::InvalidFilter("empty".into()).is_fatal());
    }

    #[test]
    fn display_includes_range() {
        let e = PollerError::InvalidReplayBlock { requested: 0, latest: 42 };
        assert_eq!(e.to_string(), "invalid replay block 0, acceptable range [1, 42]");
    }
}
