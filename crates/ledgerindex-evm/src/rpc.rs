//! HTTP JSON-RPC [`ChainClient`] backed by `reqwest`.
//!
//! Features:
//! - JSON-RPC 2.0 wire types
//! - Automatic retry with exponential backoff for transport failures
//! - Live log delivery via `eth_newFilter` / `eth_getFilterChanges` polling

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use ledgerindex_core::error::IndexerError;

use crate::client::{
    parse_hex_u64, parse_word, sort_logs, BlockHeader, BlockTag, ChainClient, LogFilter,
    LogSubscription, RawLog,
};
use crate::retry::{Backoff, BackoffConfig};

// ─── Wire types ──────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap the result value or return the node's error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ─── Transport errors ────────────────────────────────────────────────────────

/// Errors raised below the [`ChainClient`] surface.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failure or non-2xx HTTP status.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Node-side error object.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("{method} timed out after {ms}ms")]
    Timeout { method: String, ms: u64 },

    /// The result did not have the expected shape.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Returns `true` if resending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }
}

impl From<TransportError> for IndexerError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout { method, ms } => IndexerError::Timeout { method, ms },
            other => IndexerError::Rpc(other.to_string()),
        }
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// Configuration for [`HttpChainClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub retry: BackoffConfig,
    /// Upper bound for a single HTTP round trip.
    pub request_timeout: Duration,
    /// How often a live subscription polls `eth_getFilterChanges`.
    pub filter_poll_interval: Duration,
    /// Batches buffered per subscription before the poller waits.
    pub subscription_buffer: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: BackoffConfig::default(),
            request_timeout: Duration::from_secs(30),
            filter_poll_interval: Duration::from_secs(4),
            subscription_buffer: 16,
        }
    }
}

/// HTTP JSON-RPC client for an EVM node. Cheap to clone.
#[derive(Clone)]
pub struct HttpChainClient {
    url: Arc<str>,
    http: reqwest::Client,
    retry: Backoff,
    request_timeout: Duration,
    filter_poll_interval: Duration,
    subscription_buffer: usize,
    next_id: Arc<AtomicU64>,
}

impl HttpChainClient {
    /// Create a client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, IndexerError> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(IndexerError::Config(format!("unsupported RPC url: {url}")));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexerError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            retry: Backoff::new(config.retry),
            request_timeout: config.request_timeout,
            filter_poll_interval: config.filter_poll_interval.max(Duration::from_millis(1)),
            subscription_buffer: config.subscription_buffer.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, IndexerError> {
        Self::new(url, HttpClientConfig::default())
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let resp = self.http.post(&*self.url).json(req).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    method: req.method.clone(),
                    ms: self.request_timeout.as_millis() as u64,
                }
            } else {
                TransportError::Http(e.to_string())
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    /// Send one JSON-RPC call, retrying transport failures.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.send_once(&req).await {
                Ok(resp) => return resp.into_result().map_err(TransportError::Rpc),
                Err(e) if e.is_retryable() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            method,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(method, attempt, error = %e, "max retries exceeded");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn filter_changes(&self, filter_id: &str) -> Result<Vec<RawLog>, TransportError> {
        let value = self.call("eth_getFilterChanges", vec![json!(filter_id)]).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn quantity(value: &Value, method: &str) -> Result<u64, IndexerError> {
    value
        .as_str()
        .and_then(parse_hex_u64)
        .ok_or_else(|| IndexerError::Rpc(format!("{method}: unexpected result {value}")))
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn block_number(&self) -> Result<u64, IndexerError> {
        let value = self.call("eth_blockNumber", vec![]).await?;
        quantity(&value, "eth_blockNumber")
    }

    async fn get_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: BlockTag,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let params = vec![filter.to_rpc(BlockTag::Number(from), to)];
        let value = self.call("eth_getLogs", params).await?;
        serde_json::from_value(value).map_err(|e| TransportError::from(e).into())
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        let params = vec![json!(BlockTag::Number(number).to_rpc()), json!(false)];
        let value = self.call("eth_getBlockByNumber", params).await?;
        if value.is_null() {
            return Ok(None);
        }
        BlockHeader::from_json(&value)
            .map(Some)
            .ok_or_else(|| IndexerError::Rpc(format!("malformed header for block {number}")))
    }

    async fn get_storage_at(&self, address: &str, slot: U256) -> Result<[u8; 32], IndexerError> {
        let params = vec![json!(address), json!(format!("0x{slot:x}")), json!("latest")];
        let value = self.call("eth_getStorageAt", params).await?;
        value
            .as_str()
            .and_then(parse_word)
            .ok_or_else(|| IndexerError::Rpc(format!("eth_getStorageAt: unexpected result {value}")))
    }

    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogSubscription, IndexerError> {
        let params = vec![json!({ "address": filter.address, "topics": [filter.topic0] })];
        let value = self.call("eth_newFilter", params).await?;
        let filter_id = value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| IndexerError::Rpc(format!("eth_newFilter: unexpected result {value}")))?;

        let (tx, rx) = mpsc::channel(self.subscription_buffer);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let client = self.clone();
        let address = filter.address.clone();

        tracing::debug!(token = %address, filter_id = %filter_id, "log filter installed");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.filter_poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match client.filter_changes(&filter_id).await {
                    Ok(logs) if logs.is_empty() => {}
                    Ok(mut logs) => {
                        sort_logs(&mut logs);
                        if tx.send(logs).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(token = %address, error = %e, "log filter poll failed");
                        break;
                    }
                }
            }
            if let Err(e) = client.call("eth_uninstallFilter", vec![json!(filter_id)]).await {
                tracing::debug!(token = %address, error = %e, "failed to uninstall log filter");
            }
        });

        Ok(LogSubscription::new(rx, cancel))
    }
}
