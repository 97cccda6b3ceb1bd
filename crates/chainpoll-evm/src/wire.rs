//! Conversions between `eth_*` JSON shapes and the engine's types.

use serde::Deserialize;
use serde_json::{json, Value};

use chainpoll_core::{Block, LogQuery, PollerError, RawLog};

/// A log as returned by `eth_getLogs`, every number still hex-encoded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    pub block_number: String,
    pub block_hash: String,
    pub transaction_hash: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RpcLog {
    pub fn into_raw(self) -> Result<RawLog, PollerError> {
        Ok(RawLog {
            block_number: parse_quantity(&self.block_number)?,
            block_hash: self.block_hash,
            tx_hash: self.transaction_hash,
            log_index: parse_quantity(&self.log_index)?,
            address: self.address,
            topics: self.topics,
            data: parse_bytes(&self.data)?,
            removed: self.removed.unwrap_or(false),
        }
        .normalized())
    }
}

// ─── Scalars ──────────────────────────────────────────────────────────────────

/// Parse a hex `QUANTITY` (`"0x1b4"`) into an `i64`.
pub fn parse_quantity(s: &str) -> Result<i64, PollerError> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if digits.is_empty() {
        return Err(malformed("quantity", s));
    }
    let value = u64::from_str_radix(digits, 16).map_err(|_| malformed("quantity", s))?;
    i64::try_from(value).map_err(|_| malformed("quantity", s))
}

/// Encode a block number as a hex `QUANTITY`.
pub fn to_quantity(n: i64) -> String {
    format!("0x{n:x}")
}

/// Decode hex `DATA` (`"0x"` is empty).
pub fn parse_bytes(s: &str) -> Result<Vec<u8>, PollerError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(digits).map_err(|_| malformed("data", s))
}

fn malformed(what: &str, value: &str) -> PollerError {
    PollerError::Other(format!("malformed {what} in RPC response: {value:?}"))
}

// ─── Blocks ───────────────────────────────────────────────────────────────────

/// Build a [`Block`] from an `eth_getBlockByNumber` result.
pub fn block_from_json(value: &Value) -> Result<Block, PollerError> {
    let field = |name: &str| -> Result<&str, PollerError> {
        value
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| PollerError::Other(format!("block response missing `{name}`")))
    };
    Ok(Block::new(
        parse_quantity(field("number")?)?,
        field("hash")?,
        field("parentHash")?,
        parse_quantity(field("timestamp")?)?,
    ))
}

// ─── Logs ─────────────────────────────────────────────────────────────────────

/// Parse an `eth_getLogs` result array.
pub fn logs_from_json(value: Value) -> Result<Vec<RawLog>, PollerError> {
    let logs: Vec<RpcLog> = serde_json::from_value(value)
        .map_err(|e| PollerError::Other(format!("malformed eth_getLogs response: {e}")))?;
    logs.into_iter().map(RpcLog::into_raw).collect()
}

/// The filter object sent as the single `eth_getLogs` parameter.
///
/// Trailing empty topic positions are dropped; inner empty positions become
/// `null` (wildcard).
pub fn log_filter_params(query: &LogQuery) -> Value {
    let mut topics: Vec<Value> = query
        .topics
        .iter()
        .map(|alts| if alts.is_empty() { Value::Null } else { json!(alts) })
        .collect();
    while topics.last().is_some_and(Value::is_null) {
        topics.pop();
    }

    let mut params = json!({
        "fromBlock": to_quantity(query.from_block),
        "toBlock": to_quantity(query.to_block),
    });
    if !query.addresses.is_empty() {
        params["address"] = json!(query.addresses);
    }
    if !topics.is_empty() {
        params["topics"] = Value::Array(topics);
    }
    params
}
