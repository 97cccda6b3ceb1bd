//! chainpoll-evm: Ethereum JSON-RPC access for ChainPoll.
//!
//! [`EvmChainClient`] implements [`ChainClient`](chainpoll_core::ChainClient)
//! with `eth_getBlockByNumber` (batched for ranges) and `eth_getLogs`.
//! Head subscriptions are not offered; the head tracker polls instead.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use chainpoll_core::ChainId;
//! use chainpoll_evm::EvmChainClient;
//!
//! # async fn run() -> Result<(), chainpoll_core::PollerError> {
//! let client = EvmChainClient::http(ChainId(1), "https://eth.llamarpc.com", Duration::from_secs(10))?;
//! client.verify_chain_id().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod rpc;
pub mod wire;

pub use client::EvmChainClient;
pub use rpc::{HttpTransport, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcTransport};
