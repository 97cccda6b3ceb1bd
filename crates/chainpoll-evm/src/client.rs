//! [`ChainClient`] over Ethereum JSON-RPC.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use chainpoll_core::{Block, ChainClient, ChainId, LogQuery, PollerError, RawLog};

use crate::rpc::{HttpTransport, JsonRpcRequest, RpcTransport};
use crate::wire::{block_from_json, log_filter_params, logs_from_json, parse_quantity, to_quantity};

/// Reads blocks and logs of one EVM chain.
pub struct EvmChainClient {
    chain_id: ChainId,
    transport: Arc<dyn RpcTransport>,
    next_id: AtomicU64,
}

impl EvmChainClient {
    pub fn new(chain_id: ChainId, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            chain_id,
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    /// Client over HTTP with a per-request timeout.
    pub fn http(
        chain_id: ChainId,
        url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, PollerError> {
        Ok(Self::new(chain_id, Arc::new(HttpTransport::new(url, request_timeout)?)))
    }

    pub fn url(&self) -> &str {
        self.transport.url()
    }

    /// Fail with `Config` unless the node serves the configured chain.
    pub async fn verify_chain_id(&self) -> Result<(), PollerError> {
        let value = self.request("eth_chainId", vec![]).await?;
        let reported = value
            .as_str()
            .ok_or_else(|| PollerError::Other(format!("eth_chainId returned {value}")))
            .and_then(parse_quantity)?;
        if reported as u64 != self.chain_id.0 {
            return Err(PollerError::Config(format!(
                "node at {} serves chain {reported}, expected {}",
                self.url(),
                self.chain_id
            )));
        }
        tracing::debug!(chain_id = %self.chain_id, url = %self.url(), "chain id verified");
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, PollerError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        self.transport.send(req).await?.into_result()
    }

    async fn block_by_tag(&self, tag: Value) -> Result<Block, PollerError> {
        let label = tag.to_string();
        let value = self.request("eth_getBlockByNumber", vec![tag, json!(false)]).await?;
        if value.is_null() {
            return Err(PollerError::NotFound(format!("block {label}")));
        }
        block_from_json(&value)
    }
}

impl std::fmt::Debug for EvmChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmChainClient")
            .field("chain_id", &self.chain_id)
            .field("url", &self.transport.url())
            .finish()
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn latest_block(&self) -> Result<Block, PollerError> {
        self.block_by_tag(json!("latest")).await
    }

    async fn finalized_block(&self) -> Result<Block, PollerError> {
        self.block_by_tag(json!("finalized")).await
    }

    async fn block_by_number(&self, number: i64) -> Result<Block, PollerError> {
        self.block_by_tag(json!(to_quantity(number))).await
    }

    /// One batched request; responses are matched back by id.
    async fn blocks_by_numbers(&self, numbers: &[i64]) -> Result<Vec<Block>, PollerError> {
        if numbers.is_empty() {
            return Ok(vec![]);
        }
        let reqs: Vec<JsonRpcRequest> = numbers
            .iter()
            .map(|&n| {
                JsonRpcRequest::new(
                    self.next_id(),
                    "eth_getBlockByNumber",
                    vec![json!(to_quantity(n)), json!(false)],
                )
            })
            .collect();
        let ids: Vec<u64> = reqs.iter().map(|r| r.id).collect();

        let mut by_id: HashMap<u64, _> = self
            .transport
            .send_batch(reqs)
            .await?
            .into_iter()
            .filter_map(|resp| resp.id_u64().map(|id| (id, resp)))
            .collect();

        let mut blocks = Vec::with_capacity(numbers.len());
        for (id, &number) in ids.iter().zip(numbers) {
            let resp = by_id.remove(id).ok_or_else(|| {
                PollerError::TransientRpc(format!("batch response missing block {number}"))
            })?;
            let value = resp.into_result()?;
            if value.is_null() {
                return Err(PollerError::NotFound(format!("block {number}")));
            }
            blocks.push(block_from_json(&value)?);
        }
        Ok(blocks)
    }

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, PollerError> {
        let value = self.request("eth_getLogs", vec![log_filter_params(query)]).await?;
        let logs = logs_from_json(value)?;
        tracing::trace!(
            chain_id = %self.chain_id,
            from = query.from_block,
            to = query.to_block,
            count = logs.len(),
            "eth_getLogs"
        );
        Ok(logs)
    }
}
