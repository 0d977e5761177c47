//! The transfer ledger and the batch persister in front of it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{TransferRecord, UpsertOutcome};

/// Durable, deduplicated storage for transfer records.
///
/// The transaction hash is the unique key: writing a record whose hash is
/// already present must leave the store untouched and report
/// [`UpsertOutcome::AlreadyPresent`]. Implementations must tolerate concurrent
/// upserts from several token loops.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert `record` unless its transaction hash is already stored.
    async fn upsert(&self, record: &TransferRecord) -> Result<UpsertOutcome, IndexerError>;

    /// Look up a record by transaction hash.
    async fn get(&self, tx_hash: &str) -> Result<Option<TransferRecord>, IndexerError>;

    /// Records sent or received by `address`, most recent first.
    async fn transfers_for_address(
        &self,
        address: &str,
        limit: Option<u32>,
    ) -> Result<Vec<TransferRecord>, IndexerError>;

    /// Total number of stored records.
    async fn count(&self) -> Result<u64, IndexerError>;
}

/// Summary of one persisted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub already_present: usize,
    /// Highest block among the batch's records (`None` for an empty batch).
    pub highest_block: Option<u64>,
}

/// Writes whole batches into a [`Ledger`].
#[derive(Clone)]
pub struct Persister {
    ledger: Arc<dyn Ledger>,
}

impl Persister {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Upsert every record in `records`, in order.
    ///
    /// Stops at the first storage error: the caller must not advance its
    /// checkpoint unless this returns `Ok`.
    pub async fn persist_batch(&self, records: &[TransferRecord]) -> Result<BatchOutcome, IndexerError> {
        let mut outcome = BatchOutcome::default();
        for record in records {
            match self.ledger.upsert(record).await? {
                UpsertOutcome::Inserted => outcome.inserted += 1,
                UpsertOutcome::AlreadyPresent => {
                    tracing::trace!(tx = %record.tx_hash, "transfer already stored");
                    outcome.already_present += 1;
                }
            }
            outcome.highest_block = Some(
                outcome
                    .highest_block
                    .map_or(record.block_number, |b| b.max(record.block_number)),
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapLedger {
        rows: Mutex<HashMap<String, TransferRecord>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Ledger for MapLedger {
        async fn upsert(&self, record: &TransferRecord) -> Result<UpsertOutcome, IndexerError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(IndexerError::Storage("database is locked".into()));
            }
            let mut rows = self.rows.lock().unwrap();
            if rows.contains_key(&record.tx_hash) {
                return Ok(UpsertOutcome::AlreadyPresent);
            }
            rows.insert(record.tx_hash.clone(), record.clone());
            Ok(UpsertOutcome::Inserted)
        }

        async fn get(&self, tx_hash: &str) -> Result<Option<TransferRecord>, IndexerError> {
            Ok(self.rows.lock().unwrap().get(tx_hash).cloned())
        }

        async fn transfers_for_address(
            &self,
            _address: &str,
            _limit: Option<u32>,
        ) -> Result<Vec<TransferRecord>, IndexerError> {
            Ok(vec![])
        }

        async fn count(&self) -> Result<u64, IndexerError> {
            Ok(self.rows.lock().unwrap().len() as u64)
        }
    }

    fn record(tx: u64, block: u64) -> TransferRecord {
        TransferRecord {
            tx_hash: format!("0x{tx:064x}"),
            block_number: block,
            log_index: 0,
            from: "0x1111111111111111111111111111111111111111".into(),
            to: "0x2222222222222222222222222222222222222222".into(),
            amount: "1000".into(),
            token_address: "0x5fbdb2315678afecb367f032d93f642f64180aa3".into(),
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn batch_counts_inserted_and_duplicates() {
        let ledger = Arc::new(MapLedger::default());
        let persister = Persister::new(ledger.clone());

        let first = persister
            .persist_batch(&[record(1, 100), record(2, 102), record(3, 101)])
            .await
            .unwrap();
        assert_eq!(first.inserted, 3);
        assert_eq!(first.highest_block, Some(102));

        let again = persister.persist_batch(&[record(1, 100), record(4, 103)]).await.unwrap();
        assert_eq!(again.inserted, 1);
        assert_eq!(again.already_present, 1);
        assert_eq!(ledger.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn empty_batch_has_no_highest_block() {
        let persister = Persister::new(Arc::new(MapLedger::default()));
        let outcome = persister.persist_batch(&[]).await.unwrap();
        assert_eq!(outcome, BatchOutcome::default());
    }

    #[tokio::test]
    async fn storage_error_aborts_batch() {
        let ledger = Arc::new(MapLedger::default());
        ledger.fail.store(true, Ordering::Relaxed);
        let persister = Persister::new(ledger);
        let err = persister.persist_batch(&[record(1, 100)]).await.unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
    }
}
