//! The chain-facing interface consumed by the fetcher, decoder and slot reader.
//!
//! [`ChainClient`] is implemented by [`crate::rpc::HttpChainClient`] for real
//! nodes and by scripted clients in tests. A client handle is built once and
//! passed explicitly (as `Arc<C>`) to every component that needs it.

use std::future::Future;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ledgerindex_core::error::IndexerError;

/// A raw EVM log as returned by `eth_getLogs` / `eth_getFilterChanges`.
///
/// Position fields are optional because nodes report pending logs with
/// `null` block and transaction data; the decoder rejects those.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<String>,
    #[serde(rename = "blockHash", default)]
    pub block_hash: Option<String>,
    #[serde(rename = "transactionHash", default)]
    pub tx_hash: Option<String>,
    #[serde(rename = "logIndex", default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    /// Returns the block number, if present and well-formed.
    pub fn block_number_u64(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(parse_hex_u64)
    }

    /// Returns the log index, if present and well-formed.
    pub fn log_index_u64(&self) -> Option<u64> {
        self.log_index.as_deref().and_then(parse_hex_u64)
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Emission-order key: block number, then log index.
    pub fn order_key(&self) -> (u64, u64) {
        (
            self.block_number_u64().unwrap_or(u64::MAX),
            self.log_index_u64().unwrap_or(u64::MAX),
        )
    }
}

/// Sort logs into emission order (ascending block, then log index).
pub fn sort_logs(logs: &mut [RawLog]) {
    logs.sort_by_key(RawLog::order_key);
}

/// Upper bound of a block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockTag {
    /// The chain head at the time of the call.
    Latest,
    Number(u64),
}

impl BlockTag {
    /// JSON-RPC encoding (`"latest"` or `0x`-hex quantity).
    pub fn to_rpc(&self) -> String {
        match self {
            Self::Latest => "latest".into(),
            Self::Number(n) => format!("0x{n:x}"),
        }
    }
}

impl std::fmt::Display for BlockTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Address + topic0 log filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Emitting contract.
    pub address: String,
    /// Event signature hash (`0x…`).
    pub topic0: String,
}

impl LogFilter {
    pub fn new(address: impl Into<String>, topic0: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topic0: topic0.into(),
        }
    }

    /// `eth_getLogs` / `eth_newFilter` filter object.
    pub fn to_rpc(&self, from: BlockTag, to: BlockTag) -> Value {
        json!({
            "address": self.address,
            "topics": [self.topic0],
            "fromBlock": from.to_rpc(),
            "toBlock": to.to_rpc(),
        })
    }
}

/// The subset of a block header the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
}

impl BlockHeader {
    /// Parse an `eth_getBlockByNumber` result.
    pub fn from_json(v: &Value) -> Option<Self> {
        Some(Self {
            number: parse_hex_u64(v["number"].as_str()?)?,
            hash: v["hash"].as_str()?.to_string(),
            timestamp: parse_hex_u64(v["timestamp"].as_str()?)?,
        })
    }
}

/// A live stream of log batches.
///
/// Dropping the subscription cancels the producer behind it.
pub struct LogSubscription {
    receiver: mpsc::Receiver<Vec<RawLog>>,
    cancel: CancellationToken,
}

impl LogSubscription {
    /// Wrap a receiver; `cancel` is triggered when the subscription is dropped.
    pub fn new(receiver: mpsc::Receiver<Vec<RawLog>>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// Wait for the next batch. `None` means the producer has ended and the
    /// caller should re-subscribe.
    pub async fn next_batch(&mut self) -> Option<Vec<RawLog>> {
        self.receiver.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Read-only access to an EVM node.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Current head block number.
    async fn block_number(&self) -> Result<u64, IndexerError>;

    /// All logs matching `filter` in `[from, to]`.
    async fn get_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: BlockTag,
    ) -> Result<Vec<RawLog>, IndexerError>;

    /// Header of block `number`, `None` if the node does not know it.
    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError>;

    /// The 32-byte word stored at `slot` of `address`.
    async fn get_storage_at(&self, address: &str, slot: U256) -> Result<[u8; 32], IndexerError>;

    /// Deliver new matching logs as they appear.
    async fn subscribe_logs(&self, filter: &LogFilter) -> Result<LogSubscription, IndexerError>;
}

/// Bound `fut` by `timeout`; expiry becomes a transient [`IndexerError::Timeout`].
pub async fn timed<T, F>(method: &str, timeout: Duration, fut: F) -> Result<T, IndexerError>
where
    F: Future<Output = Result<T, IndexerError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(IndexerError::Timeout {
            method: method.to_string(),
            ms: timeout.as_millis() as u64,
        }),
    }
}

/// Parse a hex-encoded quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

/// Decode a hex string of at most 32 bytes into a left-padded word.
pub fn parse_word(s: &str) -> Option<[u8; 32]> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = if s.len() % 2 == 1 {
        hex::decode(format!("0{s}")).ok()?
    } else {
        hex::decode(s).ok()?
    };
    if bytes.len() > 32 {
        return None;
    }
    let mut word = [0u8; 32];
    word[32 - bytes.len()..].copy_from_slice(&bytes);
    Some(word)
}
