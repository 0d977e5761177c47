//! ledgerindex-evm: EVM log fetching, transfer decoding, storage-slot
//! reading and the per-token index loop.

pub mod builder;
pub mod client;
pub mod decoder;
pub mod fetcher;
pub mod fingerprint;
pub mod index_loop;
pub mod retry;
pub mod rpc;
pub mod slots;

pub use builder::IndexerBuilder;
pub use client::{BlockHeader, BlockTag, ChainClient, LogFilter, LogSubscription, RawLog};
pub use decoder::{decode_shape, DecodedBatch, EventDecoder, TransferShape};
pub use fetcher::LogFetcher;
pub use fingerprint::{keccak256, transfer_topic};
pub use index_loop::{run_all, CycleReport, TokenIndexer};
pub use retry::{Backoff, BackoffConfig};
pub use rpc::{HttpChainClient, HttpClientConfig};
pub use slots::{
    array_element_slot, decode_address, decode_struct, decode_uint, FieldKind, FieldValue, LockRecord,
    StorageSlotReader, StorageWord,
};
