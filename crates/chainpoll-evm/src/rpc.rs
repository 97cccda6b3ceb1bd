//! JSON-RPC 2.0 request/response types and the HTTP transport.
//!
//! Every failure leaves this module already classified as a [`PollerError`]:
//! network errors, timeouts, rate limits and 5xx become `TransientRpc`,
//! result-size refusals become `LimitExceeded`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainpoll_core::PollerError;

/// Error code nodes return when an `eth_getLogs` result would be too large.
pub const LIMIT_EXCEEDED: i64 = -32005;

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Value::from(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Value::from(id),
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
        }
    }

    /// The numeric id, if the node echoed one.
    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_u64()
    }

    /// The result value (`Value::Null` when absent), or the classified error.
    pub fn into_result(self) -> Result<Value, PollerError> {
        match self.error {
            Some(err) => Err(classify_rpc_error(&err)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Classification ───────────────────────────────────────────────────────────

const LIMIT_MARKERS: &[&str] = &[
    "query returned more than",
    "limit exceeded",
    "too many",
    "block range",
    "response size",
];

const NOT_FOUND_MARKERS: &[&str] = &["header not found", "unknown block", "block not found"];

const TRANSIENT_MARKERS: &[&str] = &["rate limit", "timeout", "timed out", "try again", "busy"];

/// Map a JSON-RPC error object to the engine's error taxonomy.
pub fn classify_rpc_error(err: &JsonRpcError) -> PollerError {
    let message = err.message.to_ascii_lowercase();
    let detail = format!("RPC error {}: {}", err.code, err.message);
    let has = |markers: &[&str]| markers.iter().any(|m| message.contains(m));

    if err.code == 429 {
        PollerError::TransientRpc(detail)
    } else if err.code == LIMIT_EXCEEDED || has(LIMIT_MARKERS) {
        PollerError::LimitExceeded(detail)
    } else if has(NOT_FOUND_MARKERS) {
        PollerError::NotFound(detail)
    } else if err.code == -32603 || has(TRANSIENT_MARKERS) {
        PollerError::TransientRpc(detail)
    } else {
        PollerError::Other(detail)
    }
}

/// Map an HTTP status outside 2xx.
pub fn classify_http_status(status: u16, body: &str) -> PollerError {
    let detail = format!("HTTP {status}: {body}");
    if status == 429 || status == 408 || status >= 500 {
        PollerError::TransientRpc(detail)
    } else if status == 413 {
        PollerError::LimitExceeded(detail)
    } else {
        PollerError::Other(detail)
    }
}

// ─── Transport ────────────────────────────────────────────────────────────────

/// Moves JSON-RPC messages to a node.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, PollerError>;

    /// Send requests together. Responses may come back in any order.
    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, PollerError> {
        let mut responses = Vec::with_capacity(reqs.len());
        for req in reqs {
            responses.push(self.send(req).await?);
        }
        Ok(responses)
    }

    /// Endpoint identifier for logs.
    fn url(&self) -> &str;
}

/// JSON-RPC over HTTP POST, with true array batching.
#[derive(Clone)]
pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, PollerError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PollerError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { url: url.into(), http })
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        body: &B,
    ) -> Result<R, PollerError> {
        let resp = self
            .http
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| PollerError::TransientRpc(format!("{}: {e}", self.url)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), &body));
        }

        resp.json::<R>()
            .await
            .map_err(|e| PollerError::TransientRpc(format!("undecodable response from {}: {e}", self.url)))
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").field("url", &self.url).finish()
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, PollerError> {
        tracing::trace!(method = %req.method, id = req.id, url = %self.url, "rpc request");
        self.post(&req).await
    }

    async fn send_batch(
        &self,
        reqs: Vec<JsonRpcRequest>,
    ) -> Result<Vec<JsonRpcResponse>, PollerError> {
        if reqs.is_empty() {
            return Ok(vec![]);
        }
        tracing::trace!(size = reqs.len(), url = %self.url, "rpc batch");
        self.post(&reqs).await
    }

    fn url(&self) -> &str {
        &self.url
    }
}
