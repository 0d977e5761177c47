//! Error types for the ledgerindex pipeline.

use thiserror::Error;

/// Errors that can occur while indexing transfers or reading contract storage.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC call '{method}' timed out after {ms}ms")]
    Timeout { method: String, ms: u64 },

    #[error("Block {0} not found")]
    BlockNotFound(u64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Malformed log in tx {tx_hash} (log index {log_index}): {reason}")]
    MalformedLog {
        tx_hash: String,
        log_index: String,
        reason: String,
    },

    #[error("Invalid field layout at slot {slot}: {reason}")]
    InvalidFieldLayout { slot: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` for network-side failures that the next scheduled
    /// cycle should retry. These never advance a checkpoint.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Rpc(_) | Self::Timeout { .. } | Self::BlockNotFound(_)
        )
    }

    /// Returns `true` if only the offending record should be dropped and the
    /// rest of the batch can continue.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::MalformedLog { .. })
    }
}
