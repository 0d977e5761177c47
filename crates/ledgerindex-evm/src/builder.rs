//! Fluent builder API for indexer configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use ledgerindex_evm::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .chain("ethereum")
//!     .token("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")
//!     .genesis_block(19_000_000)
//!     .batch_size(500)
//!     .build()
//!     .unwrap();
//! ```

use ledgerindex_core::error::IndexerError;
use ledgerindex_core::indexer::IndexerConfig;

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Set the chain label used in logs.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Track one more token contract.
    pub fn token(mut self, address: impl Into<String>) -> Self {
        self.config.tokens.push(address.into());
        self
    }

    /// Track several token contracts.
    pub fn tokens<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tokens.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Set the first block for tokens without a checkpoint.
    pub fn genesis_block(mut self, block: u64) -> Self {
        self.config.genesis_block = block;
        self
    }

    /// Set the end block (for bounded backfill).
    pub fn to_block(mut self, block: u64) -> Self {
        self.config.to_block = Some(block);
        self
    }

    /// Set the number of blocks per `eth_getLogs` batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the historical re-poll interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the per-call RPC timeout in milliseconds.
    pub fn rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.config.rpc_timeout_ms = ms;
        self
    }

    /// Enable or disable the live subscription.
    pub fn subscribe(mut self, enabled: bool) -> Self {
        self.config.subscribe = enabled;
        self
    }

    /// Set the per-token work queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Build the `IndexerConfig` without validation.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Build and validate the `IndexerConfig`.
    pub fn build(self) -> Result<IndexerConfig, IndexerError> {
        self.config.validate()
    }
}
