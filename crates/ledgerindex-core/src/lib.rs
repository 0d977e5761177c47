//! ledgerindex-core: foundation for the checkpointed ERC-20 transfer ledger.
//!
//! # Architecture
//!
//! ```text
//! TokenIndexer (one per token)
//!     ├── LogFetcher        (range queries + live subscription)
//!     ├── EventDecoder      (RawLog → TransferRecord)
//!     ├── Persister         (idempotent upsert keyed by tx hash)
//!     └── CheckpointManager (monotonic resume cursor per token)
//!
//! StorageSlotReader (on demand, independent of events)
//! ```
//!
//! This crate holds the chain-agnostic pieces: records, the error taxonomy,
//! the storage traits and the checkpoint manager.

pub mod checkpoint;
pub mod error;
pub mod indexer;
pub mod ledger;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use error::IndexerError;
pub use indexer::{IndexerConfig, IndexerState};
pub use ledger::{BatchOutcome, Ledger, Persister};
pub use types::{is_valid_address, normalize_address, TransferRecord, UpsertOutcome};
