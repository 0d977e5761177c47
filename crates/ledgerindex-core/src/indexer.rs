//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{is_valid_address, normalize_address};

/// Configuration shared by every per-token loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Chain label used in logs (e.g. `"ethereum"`).
    pub chain: String,
    /// Token contracts to index, one loop each.
    pub tokens: Vec<String>,
    /// First block to index for tokens without a checkpoint.
    pub genesis_block: u64,
    /// Optional end block (bounded backfill). `None` = run until shutdown.
    pub to_block: Option<u64>,
    /// Maximum number of blocks per `eth_getLogs` call.
    pub batch_size: u64,
    /// Interval of the historical re-poll (milliseconds).
    pub poll_interval_ms: u64,
    /// Upper bound for a single RPC call (milliseconds).
    pub rpc_timeout_ms: u64,
    /// Open a live log subscription next to the re-poll timer.
    pub subscribe: bool,
    /// Capacity of each token's work queue.
    pub queue_capacity: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain: "ethereum".into(),
            tokens: vec![],
            genesis_block: 0,
            to_block: None,
            batch_size: 1000,
            poll_interval_ms: 300_000,
            rpc_timeout_ms: 30_000,
            subscribe: true,
            queue_capacity: 64,
        }
    }
}

impl IndexerConfig {
    /// Check invariants and canonicalise token addresses.
    pub fn validate(mut self) -> Result<Self, IndexerError> {
        if self.tokens.is_empty() {
            return Err(IndexerError::Config("at least one token address is required".into()));
        }
        if let Some(bad) = self.tokens.iter().find(|t| !is_valid_address(t)) {
            return Err(IndexerError::Config(format!("invalid token address: {bad}")));
        }
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be greater than zero".into()));
        }
        if self.poll_interval_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(IndexerError::Config(
                "poll_interval_ms and rpc_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(IndexerError::Config("queue_capacity must be greater than zero".into()));
        }
        if let Some(to) = self.to_block {
            if to < self.genesis_block {
                return Err(IndexerError::Config(format!(
                    "to_block {to} is before genesis_block {}",
                    self.genesis_block
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        self.tokens = self
            .tokens
            .iter()
            .map(|t| normalize_address(t))
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Ok(self)
    }
}

/// Runtime state of a token loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Fetching historical ranges up to the chain head.
    CatchingUp,
    /// Applying live subscription batches.
    Live,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::Live => write!(f, "live"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
