//! chainpoll-core: reorg-safe chain log indexing.
//!
//! # Architecture
//!
//! ```text
//! EngineBuilder → ChainEngine
//!                     ├── HeadTracker    (head window, finality, reorg events)
//!                     ├── LogPoller      (backfill, reorg replacement, replay, pruning)
//!                     │     └── FilterRegistry (what to index, retention)
//!                     ├── ChainClient    (node access, retried with backoff)
//!                     └── LogStore / HeadStore (memory / SQLite)
//! ```
//!
//! One engine runs per chain. The poll loop is the only writer of a chain's
//! partition; readers go straight to the store.

pub mod client;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod filter;
pub mod head_tracker;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
mod poll_loop;
pub mod poller;
pub mod reorg;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod types;

pub use client::{ChainClient, LogQuery, RawLog};
pub use config::{FinalityMode, HeadTrackerConfig, PollerConfig};
pub use decode::{DecodedLog, DecoderRegistry, FnDecoder, LogDecoder};
pub use engine::{ChainEngine, EngineBuilder};
pub use error::PollerError;
pub use filter::{filter_name, Filter, FilterRegistry, RetentionRule};
pub use head_tracker::{HeadSource, HeadTracker, TrackerState};
pub use poller::{LogPoller, PollerStatus};
pub use reorg::{HeadEvent, HeadListener, ReorgEvent};
pub use retry::{RetryConfig, RetryPolicy};
pub use store::{HeadStore, LogSelection, LogStore, MemoryStore, TopicMatch};
pub use tracker::HeadWindow;
pub use types::{Block, ChainId, Confirmations, Log, PollerState};
