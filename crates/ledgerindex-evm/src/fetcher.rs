//! Transfer log fetcher.
//!
//! Uses `eth_getLogs` with range batching for the historical path and a
//! [`LogSubscription`] for the live path.

use std::sync::Arc;
use std::time::Duration;

use ledgerindex_core::error::IndexerError;
use ledgerindex_core::types::normalize_address;

use crate::client::{sort_logs, timed, BlockTag, ChainClient, LogFilter, LogSubscription, RawLog};
use crate::fingerprint::transfer_topic;

/// Fetches `Transfer` logs for tracked tokens.
pub struct LogFetcher<C> {
    client: Arc<C>,
    batch_size: u64,
    rpc_timeout: Duration,
}

impl<C: ChainClient> LogFetcher<C> {
    /// `batch_size` is the maximum number of blocks per `eth_getLogs` call.
    pub fn new(client: Arc<C>, batch_size: u64, rpc_timeout: Duration) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            rpc_timeout,
        }
    }

    /// The `Transfer` filter for `token`.
    pub fn filter(token: &str) -> LogFilter {
        LogFilter::new(normalize_address(token), transfer_topic())
    }

    /// Current chain head.
    pub async fn head(&self) -> Result<u64, IndexerError> {
        timed("eth_blockNumber", self.rpc_timeout, self.client.block_number()).await
    }

    /// Resolve `Latest` to the current head.
    pub async fn resolve_to(&self, to: BlockTag) -> Result<u64, IndexerError> {
        match to {
            BlockTag::Latest => self.head().await,
            BlockTag::Number(n) => Ok(n),
        }
    }

    /// Split `[from, to]` into inclusive pages of at most `batch_size` blocks.
    pub fn pages(&self, from: u64, to: u64) -> Vec<(u64, u64)> {
        let mut pages = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.batch_size - 1).min(to);
            pages.push((start, end));
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        pages
    }

    /// Logs of one page, in emission order.
    pub async fn fetch_page(&self, token: &str, from: u64, to: u64) -> Result<Vec<RawLog>, IndexerError> {
        let filter = Self::filter(token);
        let mut logs = timed(
            "eth_getLogs",
            self.rpc_timeout,
            self.client.get_logs(&filter, from, BlockTag::Number(to)),
        )
        .await?;
        tracing::trace!(token = %filter.address, from, to, logs = logs.len(), "fetched page");
        sort_logs(&mut logs);
        Ok(logs)
    }

    /// All `Transfer` logs of `token` in `[from, to]`, in emission order.
    pub async fn fetch_range(&self, token: &str, from: u64, to: BlockTag) -> Result<Vec<RawLog>, IndexerError> {
        let to = self.resolve_to(to).await?;
        let mut all = Vec::new();
        for (start, end) in self.pages(from, to) {
            all.extend(self.fetch_page(token, start, end).await?);
        }
        sort_logs(&mut all);
        Ok(all)
    }

    /// Open a live subscription for `token`.
    pub async fn subscribe(&self, token: &str) -> Result<LogSubscription, IndexerError> {
        let filter = Self::filter(token);
        timed("subscribe_logs", self.rpc_timeout, self.client.subscribe_logs(&filter)).await
    }
}
