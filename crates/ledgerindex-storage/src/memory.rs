//! In-memory storage backend.
//!
//! Stores transfer records and checkpoints in RAM.
//! Useful for testing and short-lived indexers that don't need persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use ledgerindex_core::checkpoint::{save_if_ahead, Checkpoint, CheckpointStore};
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::ledger::Ledger;
use ledgerindex_core::types::{normalize_address, TransferRecord, UpsertOutcome};

/// In-memory ledger and checkpoint storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
    transfers: Mutex<HashMap<String, TransferRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored records for a token, in chain order.
    pub fn transfers_for_token(&self, token_address: &str) -> Vec<TransferRecord> {
        let token = normalize_address(token_address);
        let mut out: Vec<_> = self
            .transfers
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.token_address == token)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.block_number, r.log_index));
        out
    }
}

#[async_trait]
impl Ledger for InMemoryStorage {
    async fn upsert(&self, record: &TransferRecord) -> Result<UpsertOutcome, IndexerError> {
        let mut transfers = self.transfers.lock().unwrap();
        let key = normalize_address(&record.tx_hash);
        if transfers.contains_key(&key) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }
        let record = TransferRecord {
            tx_hash: key.clone(),
            from: normalize_address(&record.from),
            to: normalize_address(&record.to),
            token_address: normalize_address(&record.token_address),
            ..record.clone()
        };
        transfers.insert(key, record);
        Ok(UpsertOutcome::Inserted)
    }

    async fn get(&self, tx_hash: &str) -> Result<Option<TransferRecord>, IndexerError> {
        Ok(self
            .transfers
            .lock()
            .unwrap()
            .get(&normalize_address(tx_hash))
            .cloned())
    }

    async fn transfers_for_address(
        &self,
        address: &str,
        limit: Option<u32>,
    ) -> Result<Vec<TransferRecord>, IndexerError> {
        let mut out: Vec<_> = self
            .transfers
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.involves(address))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (b.block_number, b.log_index).cmp(&(a.block_number, a.log_index))
        });
        if let Some(limit) = limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn count(&self) -> Result<u64, IndexerError> {
        Ok(self.transfers.lock().unwrap().len() as u64)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn load(&self, token_address: &str) -> Result<Option<Checkpoint>, IndexerError> {
        Ok(self.checkpoints.lock().unwrap().get(&normalize_address(token_address)).cloned())
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<bool, IndexerError> {
        Ok(save_if_ahead(&mut self.checkpoints.lock().unwrap(), checkpoint))
    }

    async fn delete(&self, token_address: &str) -> Result<(), IndexerError> {
        self.checkpoints.lock().unwrap().remove(&normalize_address(token_address));
        Ok(())
    }
}
