//! SQLite storage backend for LedgerIndex.
//!
//! Persists transfer records and checkpoints to a single SQLite file.
//! Uses `sqlx` with WAL mode so the query side can read while the indexer
//! writes.
//!
//! # Usage
//! ```rust,no_run
//! use ledgerindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./transfers.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use ledgerindex_core::checkpoint::{Checkpoint, CheckpointStore};
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::ledger::Ledger;
use ledgerindex_core::types::{normalize_address, TransferRecord, UpsertOutcome};

/// SQLite-backed ledger and checkpoint storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./transfers.db"`) or a full
    /// SQLite URL (`"sqlite:./transfers.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection to `:memory:` would see its own database, so
    /// the pool is pinned to a single connection that is never recycled.
    /// Ideal for tests.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                token_address        TEXT    PRIMARY KEY,
                last_processed_block INTEGER NOT NULL,
                updated_at           INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transfers (
                tx_hash       TEXT    PRIMARY KEY,
                block_number  INTEGER NOT NULL,
                log_index     INTEGER NOT NULL,
                from_address  TEXT    NOT NULL,
                to_address    TEXT    NOT NULL,
                amount        TEXT    NOT NULL,
                token_address TEXT    NOT NULL,
                timestamp     INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        // The address query filters on either side of the transfer.
        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers (from_address);",
            "CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers (to_address);",
            "CREATE INDEX IF NOT EXISTS idx_transfers_token_block ON transfers (token_address, block_number);",
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| IndexerError::Storage(e.to_string()))?;
        }

        Ok(())
    }

    fn record_from_row(row: &SqliteRow) -> Result<TransferRecord, IndexerError> {
        let ts: i64 = row.get("timestamp");
        let timestamp = DateTime::<Utc>::from_timestamp(ts, 0)
            .ok_or_else(|| IndexerError::Storage(format!("timestamp out of range: {ts}")))?;
        Ok(TransferRecord {
            tx_hash: row.get("tx_hash"),
            block_number: row.get::<i64, _>("block_number") as u64,
            log_index: row.get::<i64, _>("log_index") as u64,
            from: row.get("from_address"),
            to: row.get("to_address"),
            amount: row.get("amount"),
            token_address: row.get("token_address"),
            timestamp,
        })
    }
}

// ─── Ledger impl ─────────────────────────────────────────────────────────────

#[async_trait]
impl Ledger for SqliteStorage {
    async fn upsert(&self, record: &TransferRecord) -> Result<UpsertOutcome, IndexerError> {
        let result = sqlx::query(
            "INSERT INTO transfers
             (tx_hash, block_number, log_index, from_address, to_address, amount, token_address, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tx_hash) DO NOTHING",
        )
        .bind(normalize_address(&record.tx_hash))
        .bind(record.block_number as i64)
        .bind(record.log_index as i64)
        .bind(normalize_address(&record.from))
        .bind(normalize_address(&record.to))
        .bind(&record.amount)
        .bind(normalize_address(&record.token_address))
        .bind(record.timestamp.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(UpsertOutcome::AlreadyPresent);
        }
        debug!(tx = %record.tx_hash, block = record.block_number, "transfer stored");
        Ok(UpsertOutcome::Inserted)
    }

    async fn get(&self, tx_hash: &str) -> Result<Option<TransferRecord>, IndexerError> {
        let row = sqlx::query(
            "SELECT tx_hash, block_number, log_index, from_address, to_address, amount, token_address, timestamp
             FROM transfers WHERE tx_hash = ?",
        )
        .bind(normalize_address(tx_hash))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn transfers_for_address(
        &self,
        address: &str,
        limit: Option<u32>,
    ) -> Result<Vec<TransferRecord>, IndexerError> {
        let address = normalize_address(address);
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(i64::from).unwrap_or(-1);

        let rows = sqlx::query(
            "SELECT tx_hash, block_number, log_index, from_address, to_address, amount, token_address, timestamp
             FROM transfers
             WHERE from_address = ? OR to_address = ?
             ORDER BY block_number DESC, log_index DESC
             LIMIT ?",
        )
        .bind(&address)
        .bind(&address)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM transfers")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

// ─── CheckpointStore impl ────────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for SqliteStorage {
    async fn load(&self, token_address: &str) -> Result<Option<Checkpoint>, IndexerError> {
        let row = sqlx::query(
            "SELECT token_address, last_processed_block, updated_at
             FROM checkpoints WHERE token_address = ?",
        )
        .bind(normalize_address(token_address))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        Ok(row.map(|r| Checkpoint {
            token_address: r.get("token_address"),
            last_processed_block: r.get::<i64, _>("last_processed_block") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, checkpoint: Checkpoint) -> Result<bool, IndexerError> {
        // The WHERE clause on the upsert keeps the stored value monotonic.
        let result = sqlx::query(
            "INSERT INTO checkpoints (token_address, last_processed_block, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(token_address) DO UPDATE SET
                 last_processed_block = excluded.last_processed_block,
                 updated_at           = excluded.updated_at
             WHERE excluded.last_processed_block > checkpoints.last_processed_block",
        )
        .bind(normalize_address(&checkpoint.token_address))
        .bind(checkpoint.last_processed_block as i64)
        .bind(checkpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Storage(e.to_string()))?;

        let advanced = result.rows_affected() > 0;
        if advanced {
            debug!(
                token = %checkpoint.token_address,
                block = checkpoint.last_processed_block,
                "checkpoint saved"
            );
        }
        Ok(advanced)
    }

    async fn delete(&self, token_address: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM checkpoints WHERE token_address = ?")
            .bind(normalize_address(token_address))
            .execute(&self.pool)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
    const ALICE: &str = "0xd535f107588040c3a9dccc37743846edccbc7386";
    const BOB: &str = "0x7a250d5630b4cf539739df2c5dacb4c659f2488d";

    fn sample_transfer(tx: u64, block: u64, from: &str, to: &str) -> TransferRecord {
        TransferRecord {
            tx_hash: format!("0x{tx:064x}"),
            block_number: block,
            log_index: tx % 3,
            from: from.into(),
            to: to.into(),
            // Larger than u128 to check nothing is narrowed on the way.
            amount: "115792089237316195423570985008687907853269984665640564039457584007913129639935"
                .into(),
            token_address: TOKEN.into(),
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + block as i64 * 12, 0).unwrap(),
        }
    }

    fn checkpoint(block: u64) -> Checkpoint {
        Checkpoint {
            token_address: TOKEN.into(),
            last_processed_block: block,
            updated_at: 1_700_000_000,
        }
    }

    // ── Ledger ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_twice_keeps_one_row() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let rec = sample_transfer(1, 100, ALICE, BOB);

        assert_eq!(store.upsert(&rec).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&rec).await.unwrap(), UpsertOutcome::AlreadyPresent);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_roundtrip_preserves_amount_and_timestamp() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let rec = sample_transfer(7, 19_000_000, ALICE, BOB);
        store.upsert(&rec).await.unwrap();

        let loaded = store.get(&rec.tx_hash).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(store.get("0xdeadbeef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn addresses_are_lowercased_at_storage_time() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut rec = sample_transfer(2, 100, ALICE, BOB);
        rec.from = "0xD535F107588040C3A9DCCC37743846EDCCBC7386".into();
        store.upsert(&rec).await.unwrap();

        let loaded = store.get(&rec.tx_hash).await.unwrap().unwrap();
        assert_eq!(loaded.from, ALICE);

        let found = store
            .transfers_for_address("0xD535F107588040c3a9dcCc37743846EDCCbC7386", None)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn address_query_orders_by_recency() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.upsert(&sample_transfer(1, 100, ALICE, BOB)).await.unwrap();
        store.upsert(&sample_transfer(2, 300, BOB, ALICE)).await.unwrap();
        store.upsert(&sample_transfer(3, 200, ALICE, BOB)).await.unwrap();
        store
            .upsert(&sample_transfer(4, 400, BOB, "0x1111111111111111111111111111111111111111"))
            .await
            .unwrap();

        let alice = store.transfers_for_address(ALICE, None).await.unwrap();
        let blocks: Vec<_> = alice.iter().map(|r| r.block_number).collect();
        assert_eq!(blocks, vec![300, 200, 100]);

        let limited = store.transfers_for_address(BOB, Some(2)).await.unwrap();
        let blocks: Vec<_> = limited.iter().map(|r| r.block_number).collect();
        assert_eq!(blocks, vec![400, 300]);
    }

    // ── CheckpointStore ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.save(checkpoint(1_000)).await.unwrap());

        let loaded = store.load(TOKEN).await.unwrap().unwrap();
        assert_eq!(loaded.last_processed_block, 1_000);
        assert_eq!(loaded.updated_at, 1_700_000_000);
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backward() {
        let store = SqliteStorage::in_memory().await.unwrap();

        assert!(store.save(checkpoint(200)).await.unwrap());
        assert!(!store.save(checkpoint(100)).await.unwrap());
        assert!(!store.save(checkpoint(200)).await.unwrap());
        assert!(store.save(checkpoint(201)).await.unwrap());

        let loaded = store.load(TOKEN).await.unwrap().unwrap();
        assert_eq!(loaded.last_processed_block, 201);
    }

    #[tokio::test]
    async fn checkpoint_missing_returns_none() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.load("0xunknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_delete() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save(checkpoint(500)).await.unwrap();
        store.delete(TOKEN).await.unwrap();
        assert!(store.load(TOKEN).await.unwrap().is_none());
    }
}
