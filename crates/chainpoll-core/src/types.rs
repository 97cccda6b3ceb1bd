//! Shared types for the indexing engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PollerError;

// ─── ChainId ──────────────────────────────────────────────────────────────────

/// Opaque chain identifier. Every block, log, filter and poller state row is
/// scoped by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block header, enough to link the chain and detect reorgs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: i64,
    /// Block hash (`0x…`, lowercase).
    pub hash: String,
    /// Parent block hash (`0x…`, lowercase).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl Block {
    pub fn new(
        number: i64,
        hash: impl Into<String>,
        parent_hash: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            number,
            hash: normalize_hex(hash.into()),
            parent_hash: normalize_hex(parent_hash.into()),
            timestamp,
        }
    }

    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── Log ──────────────────────────────────────────────────────────────────────

/// An indexed event log. Unique on `(block_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub block_number: i64,
    pub block_hash: String,
    pub tx_hash: String,
    /// Position of the log within its block.
    pub log_index: i64,
    /// Emitting contract address (lowercase).
    pub address: String,
    /// `topics[0]`, the event signature hash.
    pub event_sig: String,
    /// All topics including the event signature at index 0.
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    /// Timestamp of the containing block.
    pub block_timestamp: i64,
    /// When the poller persisted the log.
    pub created_at: DateTime<Utc>,
}

impl Log {
    /// Returns the topic at `index` (0 is the event signature).
    pub fn topic(&self, index: usize) -> Option<&str> {
        self.topics.get(index).map(String::as_str)
    }

    /// Returns the 32-byte data word at `index`, if present.
    pub fn data_word(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(32)?;
        self.data.get(start..start + 32)
    }
}

// ─── PollerState ──────────────────────────────────────────────────────────────

/// The single per-chain progress row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerState {
    /// Highest block for which every block up to and including it is persisted.
    pub last_processed_block: i64,
    /// Highest finalized block seen when the last batch was committed.
    pub last_finalized_block: i64,
}

// ─── Confirmations ────────────────────────────────────────────────────────────

/// How far behind the latest indexed block a log must be to be returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmations {
    /// `block_number <= latest - n`. `Depth(0)` includes the head block.
    Depth(u64),
    /// `block_number <= last finalized block`.
    Finalized,
}

impl From<u64> for Confirmations {
    fn from(n: u64) -> Self {
        Self::Depth(n)
    }
}

impl Default for Confirmations {
    fn default() -> Self {
        Self::Depth(0)
    }
}

/// Lowercases a hex string and ensures the `0x` prefix.
pub fn normalize_hex(s: impl AsRef<str>) -> String {
    let s = s.as_ref().trim();
    let body = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    format!("0x{}", body.to_ascii_lowercase())
}

/// Returns `true` if the hex string is empty or all zeroes.
pub fn is_zero_hex(s: &str) -> bool {
    let body = s.strip_prefix("0x").unwrap_or(s);
    body.chars().all(|c| c == '0')
}

// ─── Word ─────────────────────────────────────────────────────────────────────

/// A 32-byte ABI word: one data slot or one indexed topic.
pub type Word = [u8; 32];

/// Parses a hex value into a word, left-padding short values the way the
/// ABI encodes unsigned integers.
pub fn parse_word(s: &str) -> Result<Word, PollerError> {
    let body = normalize_hex(s);
    let body = &body[2..];
    let padded = if body.len() % 2 == 1 { format!("0{body}") } else { body.to_string() };
    let bytes = hex::decode(&padded).map_err(|e| PollerError::InvalidArgument(format!("invalid hex word {s}: {e}")))?;
    if bytes.len() > 32 {
        return Err(PollerError::InvalidArgument(format!("word {s} is longer than 32 bytes")));
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(word)
}

/// `0x`-prefixed lowercase hex of a word, the stored form of a topic.
pub fn word_hex(word: &Word) -> String {
    format!("0x{}", hex::encode(word))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_extends_parent() {
        let parent = Block::new(100, "0xAAA", "0x000", 1000);
        let child = Block::new(101, "0xbbb", "0xaaa", 1012);
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = Block::new(100, "0xaaa", "0x000", 1000);
        let b = Block::new(102, "0xccc", "0xaaa", 1024);
        assert!(!b.extends(&a));
    }

    #[test]
    fn normalize_hex_variants() {
        assert_eq!(normalize_hex("0xABcd"), "0xabcd");
        assert_eq!(normalize_hex("ABCD"), "0xabcd");
        assert_eq!(normalize_hex(" 0X01 "), "0x01");
    }

    #[test]
    fn zero_hex() {
        assert!(is_zero_hex("0x0000"));
        assert!(is_zero_hex("0x"));
        assert!(!is_zero_hex("0x0001"));
    }

    #[test]
    fn data_word_bounds() {
        let mut data = vec![0u8; 64];
        data[32] = 7;
        let log = Log {
            block_number: 1,
            block_hash: "0x1".into(),
            tx_hash: "0x2".into(),
            log_index: 0,
            address: "0xa".into(),
            event_sig: "0xe".into(),
            topics: vec!["0xe".into()],
            data,
            block_timestamp: 0,
            created_at: Utc::now(),
        };
        assert_eq!(log.data_word(1).map(|w| w[0]), Some(7));
        assert!(log.data_word(2).is_none());
        assert_eq!(log.topic(0), Some("0xe"));
        assert_eq!(log.topic(1), None);
    }

    #[test]
    fn words_are_left_padded() {
        let w = parse_word("0x5").unwrap();
        assert_eq!(w[31], 5);
        assert!(w[..31].iter().all(|b| *b == 0));
        assert_eq!(word_hex(&w), format!("0x{}5", "0".repeat(63)));
        assert_eq!(parse_word(&word_hex(&w)).unwrap(), w);
        assert!(matches!(parse_word("0xzz"), Err(PollerError::InvalidArgument(_))));
        assert!(matches!(parse_word(&format!("0x{}", "11".repeat(33))), Err(PollerError::InvalidArgument(_))));
    }
}
