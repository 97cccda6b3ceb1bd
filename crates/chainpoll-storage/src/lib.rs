//! chainpoll-storage: durable storage backends for ChainPoll.
//!
//! Backends:
//! - [`MemoryStore`]: in-memory (dev/testing, no persistence), re-exported
//!   from `chainpoll-core`
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Every backend hands out handles scoped to one chain id; each handle
//! implements both [`LogStore`](chainpoll_core::LogStore) and
//! [`HeadStore`](chainpoll_core::HeadStore).

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chainpoll_core::store::memory::{MemoryChainStore, MemoryStore};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteChainStore, SqliteStorage};
