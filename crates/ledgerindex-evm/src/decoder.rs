//! ERC-20 `Transfer` log decoding.
//!
//! `Transfer(address indexed from, address indexed to, uint256 value)`:
//!   topics[0] = event signature hash
//!   topics[1] = from (left-padded to 32 bytes)
//!   topics[2] = to   (left-padded to 32 bytes)
//!   data      = value (one 32-byte big-endian word)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};

use ledgerindex_core::error::IndexerError;
use ledgerindex_core::types::{normalize_address, TransferRecord};

use crate::client::{timed, ChainClient, RawLog};
use crate::fingerprint::transfer_topic;
use crate::slots::address_from_word;

/// The validated, timestamp-less content of a `Transfer` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferShape {
    pub tx_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
}

/// Result of decoding one batch of logs.
#[derive(Debug, Clone, Default)]
pub struct DecodedBatch {
    /// Valid records, in input order.
    pub records: Vec<TransferRecord>,
    /// Number of malformed logs dropped.
    pub skipped: usize,
}

impl DecodedBatch {
    /// Highest block among the valid records.
    pub fn highest_block(&self) -> Option<u64> {
        self.records.iter().map(|r| r.block_number).max()
    }
}

/// A `0x`-prefixed hex string of exactly 32 bytes.
fn exact_word(hex_str: &str) -> Option<B256> {
    if !hex_str.starts_with("0x") {
        return None;
    }
    hex_str.parse().ok()
}

fn lower_hex(address: &Address) -> String {
    normalize_address(&address.to_string())
}

/// Validate `log` as a `Transfer` emitted by `token`.
pub fn decode_shape(token: &str, log: &RawLog) -> Result<TransferShape, IndexerError> {
    let malformed = |reason: &str| IndexerError::MalformedLog {
        tx_hash: log.tx_hash.clone().unwrap_or_else(|| "<pending>".into()),
        log_index: log.log_index.clone().unwrap_or_else(|| "<pending>".into()),
        reason: reason.to_string(),
    };

    if log.is_removed() {
        return Err(malformed("log was removed by a reorg"));
    }
    if normalize_address(&log.address) != normalize_address(token) {
        return Err(malformed("emitted by a different contract"));
    }
    if log.topics.len() != 3 {
        return Err(malformed(&format!("expected 3 topics, got {}", log.topics.len())));
    }
    if !log.topics[0].eq_ignore_ascii_case(&transfer_topic()) {
        return Err(malformed("topic0 is not the Transfer signature"));
    }
    let from = exact_word(&log.topics[1])
        .and_then(|w| address_from_word(&w))
        .ok_or_else(|| malformed("topic1 is not an address word"))?;
    let to = exact_word(&log.topics[2])
        .and_then(|w| address_from_word(&w))
        .ok_or_else(|| malformed("topic2 is not an address word"))?;
    let amount = exact_word(&log.data)
        .map(|w| U256::from_be_bytes(w.0))
        .ok_or_else(|| malformed("data is not a single 32-byte word"))?;
    let tx_hash = log
        .tx_hash
        .as_deref()
        .map(str::to_lowercase)
        .ok_or_else(|| malformed("missing transaction hash"))?;
    let block_number = log
        .block_number_u64()
        .ok_or_else(|| malformed("missing or invalid block number"))?;
    let log_index = log
        .log_index_u64()
        .ok_or_else(|| malformed("missing or invalid log index"))?;

    Ok(TransferShape {
        tx_hash,
        block_number,
        log_index,
        from,
        to,
        amount,
    })
}

/// Turns raw logs into [`TransferRecord`]s, resolving block timestamps.
pub struct EventDecoder<C> {
    client: Arc<C>,
    rpc_timeout: Duration,
}

impl<C: ChainClient> EventDecoder<C> {
    pub fn new(client: Arc<C>, rpc_timeout: Duration) -> Self {
        Self {
            client,
            rpc_timeout,
        }
    }

    async fn block_timestamp(&self, number: u64) -> Result<DateTime<Utc>, IndexerError> {
        let header = timed("eth_getBlockByNumber", self.rpc_timeout, self.client.get_block(number))
            .await?
            .ok_or(IndexerError::BlockNotFound(number))?;
        let out_of_range = || IndexerError::Rpc(format!("block {number} has an out-of-range timestamp"));
        let secs = i64::try_from(header.timestamp).map_err(|_| out_of_range())?;
        DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(out_of_range)
    }

    /// Decode every log of a batch.
    ///
    /// Malformed logs are skipped; a failure to resolve a timestamp fails the
    /// whole batch.
    pub async fn decode_batch(&self, token: &str, logs: &[RawLog]) -> Result<DecodedBatch, IndexerError> {
        let token = normalize_address(token);
        let mut batch = DecodedBatch::default();
        let mut timestamps: HashMap<u64, DateTime<Utc>> = HashMap::new();

        for log in logs {
            let shape = match decode_shape(&token, log) {
                Ok(shape) => shape,
                Err(e) if e.is_skippable() => {
                    tracing::warn!(
                        token = %token,
                        tx = log.tx_hash.as_deref().unwrap_or("<pending>"),
                        log_index = log.log_index.as_deref().unwrap_or("<pending>"),
                        error = %e,
                        "skipping malformed log"
                    );
                    batch.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let timestamp = match timestamps.get(&shape.block_number) {
                Some(ts) => *ts,
                None => {
                    let ts = self.block_timestamp(shape.block_number).await?;
                    timestamps.insert(shape.block_number, ts);
                    ts
                }
            };

            batch.records.push(TransferRecord {
                tx_hash: shape.tx_hash,
                block_number: shape.block_number,
                log_index: shape.log_index,
                from: lower_hex(&shape.from),
                to: lower_hex(&shape.to),
                amount: shape.amount.to_string(),
                token_address: token.clone(),
                timestamp,
            });
        }

        Ok(batch)
    }
}
