//! Checkpoint manager. Persists each token's indexing position.
//!
//! A checkpoint stores the last block whose transfers are durably in the
//! ledger. On restart the indexer resumes from `checkpoint + 1`; anything
//! after the checkpoint is simply fetched again and absorbed by the ledger's
//! idempotent upsert.
//!
//! Checkpoints only move forward. Stores enforce this themselves so that a
//! stale writer can never rewind progress.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::normalize_address;

/// A persisted checkpoint for one tracked token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Lower-cased token contract address.
    pub token_address: String,
    /// Last block whose transfers are fully persisted.
    pub last_processed_block: u64,
    /// Unix timestamp of when this checkpoint was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading checkpoints.
///
/// Implementations include `MemoryCheckpointStore`, `InMemoryStorage` and
/// `SqliteStorage`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a token.
    async fn load(&self, token_address: &str) -> Result<Option<Checkpoint>, IndexerError>;

    /// Save a checkpoint if it is strictly ahead of the stored one.
    ///
    /// Returns `true` if the stored value changed, `false` if the save was
    /// rejected as a no-op (equal or backward move).
    async fn save(&self, checkpoint: Checkpoint) -> Result<bool, IndexerError>;

    /// Delete a checkpoint (e.g. when re-indexing a token from genesis).
    async fn delete(&self, token_address: &str) -> Result<(), IndexerError>;
}

/// Reads and advances checkpoints on behalf of the per-token loops.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    genesis_block: u64,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, genesis_block: u64) -> Self {
        Self {
            store,
            genesis_block,
        }
    }

    /// The configured first block for tokens that have no checkpoint yet.
    pub fn genesis_block(&self) -> u64 {
        self.genesis_block
    }

    /// Load the raw checkpoint (returns `None` if none exists).
    pub async fn load(&self, token_address: &str) -> Result<Option<Checkpoint>, IndexerError> {
        self.store.load(&normalize_address(token_address)).await
    }

    /// Last processed block, or the genesis block for a fresh token.
    pub async fn get(&self, token_address: &str) -> Result<u64, IndexerError> {
        Ok(self
            .load(token_address)
            .await?
            .map(|cp| cp.last_processed_block)
            .unwrap_or(self.genesis_block))
    }

    /// First block the next historical fetch should request.
    pub async fn resume_block(&self, token_address: &str) -> Result<u64, IndexerError> {
        Ok(match self.load(token_address).await? {
            Some(cp) => cp.last_processed_block.saturating_add(1),
            None => self.genesis_block,
        })
    }

    /// Move the checkpoint forward to `block_number`.
    ///
    /// Call only after every record up to `block_number` has been persisted.
    /// Moving backward (or staying put) is a no-op that returns `false`.
    pub async fn advance(&self, token_address: &str, block_number: u64) -> Result<bool, IndexerError> {
        let cp = Checkpoint {
            token_address: normalize_address(token_address),
            last_processed_block: block_number,
            updated_at: chrono::Utc::now().timestamp(),
        };
        let advanced = self.store.save(cp).await?;
        if advanced {
            tracing::debug!(token = %token_address, block = block_number, "checkpoint advanced");
        } else {
            tracing::trace!(token = %token_address, block = block_number, "checkpoint not advanced");
        }
        Ok(advanced)
    }

    /// Forget a token's progress.
    pub async fn reset(&self, token_address: &str) -> Result<(), IndexerError> {
        self.store.delete(&normalize_address(token_address)).await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory checkpoint store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared monotonic-save rule for map-backed stores.
pub fn save_if_ahead(map: &mut HashMap<String, Checkpoint>, checkpoint: Checkpoint) -> bool {
    let key = normalize_address(&checkpoint.token_address);
    match map.get(&key) {
        Some(existing) if existing.last_processed_block >= checkpoint.last_processed_block => false,
        _ => {
            map.insert(key, checkpoint);
            true
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, token_address: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.data.lock().unwrap().get(&normalize_address(token_address)).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<bool, IndexerError> {
        Ok(save_if_ahead(&mut self.data.lock().unwrap(), checkpoint))
    }

    async fn delete(&self, token_address: &str) -> Result<(), IndexerError> {
        self.data.lock().unwrap().remove(&normalize_address(token_address));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn manager(genesis: u64) -> CheckpointManager {
        CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()), genesis)
    }

    #[tokio::test]
    async fn fresh_token_defaults_to_genesis() {
        let mgr = manager(19_000_000);
        assert!(mgr.load(TOKEN).await.unwrap().is_none());
        assert_eq!(mgr.get(TOKEN).await.unwrap(), 19_000_000);
        assert_eq!(mgr.resume_block(TOKEN).await.unwrap(), 19_000_000);
    }

    #[tokio::test]
    async fn advance_then_resume_after_checkpoint() {
        let mgr = manager(0);
        assert!(mgr.advance(TOKEN, 102).await.unwrap());
        assert_eq!(mgr.get(TOKEN).await.unwrap(), 102);
        assert_eq!(mgr.resume_block(TOKEN).await.unwrap(), 103);

        // Keys are case-insensitive.
        let cp = mgr.load(&TOKEN.to_lowercase()).await.unwrap().unwrap();
        assert_eq!(cp.token_address, TOKEN.to_lowercase());
    }

    #[tokio::test]
    async fn advance_never_moves_backward() {
        let mgr = manager(0);
        assert!(mgr.advance(TOKEN, 200).await.unwrap());
        assert!(!mgr.advance(TOKEN, 150).await.unwrap());
        assert!(!mgr.advance(TOKEN, 200).await.unwrap());
        assert_eq!(mgr.get(TOKEN).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn tokens_are_independent() {
        let mgr = manager(0);
        mgr.advance("0xaaaa", 10).await.unwrap();
        mgr.advance("0xbbbb", 99).await.unwrap();
        assert_eq!(mgr.get("0xaaaa").await.unwrap(), 10);
        assert_eq!(mgr.get("0xbbbb").await.unwrap(), 99);
    }

    #[tokio::test]
    async fn reset_returns_to_genesis() {
        let mgr = manager(5);
        mgr.advance(TOKEN, 500).await.unwrap();
        mgr.reset(TOKEN).await.unwrap();
        assert_eq!(mgr.get(TOKEN).await.unwrap(), 5);
    }
}
