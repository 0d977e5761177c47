//! Raw contract storage decoding.
//!
//! Solidity lays out a dynamic array `T[] arr` declared at slot `p` as:
//!   - slot `p` holds `arr.length`
//!   - element `i` starts at `keccak256(be32(p)) + i * fields_per_element`
//!
//! Each field of a struct element occupies one 32-byte word, in declaration
//! order. This module computes those slots, reads them through a
//! [`ChainClient`] and decodes the words into typed values.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use futures::future::try_join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use ledgerindex_core::error::IndexerError;

use crate::client::{timed, ChainClient};
use crate::fingerprint::keccak256;

/// Element reads kept in flight by [`StorageSlotReader::read_locks`].
const READ_CONCURRENCY: usize = 16;

/// One raw storage word and the slot it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageWord {
    pub slot: U256,
    pub value: B256,
}

/// Declared type of a struct field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Address,
    Uint,
}

/// A decoded struct field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Address(Address),
    Uint(U256),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Address(a) => write!(f, "{a}"),
            Self::Uint(v) => write!(f, "{v}"),
        }
    }
}

/// Slot of the first field of element `index` of the array rooted at
/// `array_base_slot`. Arithmetic wraps modulo 2^256.
pub fn array_element_slot(array_base_slot: U256, index: U256, fields_per_element: u64) -> U256 {
    let data_start = U256::from_be_bytes(keccak256(&array_base_slot.to_be_bytes::<32>()));
    data_start.wrapping_add(index.wrapping_mul(U256::from(fields_per_element)))
}

/// Low 20 bytes of `word`, or `None` if any of the high 12 bytes is set.
pub fn address_from_word(word: &B256) -> Option<Address> {
    if word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(&word[12..]))
}

/// Decode an address field.
pub fn decode_address(word: &StorageWord) -> Result<Address, IndexerError> {
    address_from_word(&word.value).ok_or_else(|| IndexerError::InvalidFieldLayout {
        slot: format!("0x{:x}", word.slot),
        reason: "address field has non-zero high 12 bytes".into(),
    })
}

/// Decode a `uint256` field.
pub fn decode_uint(word: &StorageWord) -> U256 {
    U256::from_be_bytes(word.value.0)
}

/// Decode `words` according to `layout`, one word per field.
pub fn decode_struct(words: &[StorageWord], layout: &[FieldKind]) -> Result<Vec<FieldValue>, IndexerError> {
    if words.len() != layout.len() {
        return Err(IndexerError::InvalidFieldLayout {
            slot: words
                .first()
                .map(|w| format!("0x{:x}", w.slot))
                .unwrap_or_else(|| "-".into()),
            reason: format!("expected {} words, got {}", layout.len(), words.len()),
        });
    }
    words
        .iter()
        .zip(layout)
        .map(|(word, kind)| match kind {
            FieldKind::Address => decode_address(word).map(FieldValue::Address),
            FieldKind::Uint => Ok(FieldValue::Uint(decode_uint(word))),
        })
        .collect()
}

/// `struct Lock { address user; uint256 startTime; uint256 amount; }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub user: Address,
    pub start_time: U256,
    pub amount: U256,
}

impl LockRecord {
    pub const LAYOUT: [FieldKind; 3] = [FieldKind::Address, FieldKind::Uint, FieldKind::Uint];

    pub fn from_words(words: &[StorageWord]) -> Result<Self, IndexerError> {
        let mut fields = decode_struct(words, &Self::LAYOUT)?.into_iter();
        match (fields.next(), fields.next(), fields.next()) {
            (
                Some(FieldValue::Address(user)),
                Some(FieldValue::Uint(start_time)),
                Some(FieldValue::Uint(amount)),
            ) => Ok(Self {
                user,
                start_time,
                amount,
            }),
            _ => Err(IndexerError::Other("lock layout mismatch".into())),
        }
    }
}

/// Reads struct elements of dynamic storage arrays.
pub struct StorageSlotReader<C> {
    client: Arc<C>,
    rpc_timeout: Duration,
}

impl<C: ChainClient> StorageSlotReader<C> {
    pub fn new(client: Arc<C>, rpc_timeout: Duration) -> Self {
        Self {
            client,
            rpc_timeout,
        }
    }

    async fn read_word(&self, contract: &str, slot: U256) -> Result<StorageWord, IndexerError> {
        let value = timed(
            "eth_getStorageAt",
            self.rpc_timeout,
            self.client.get_storage_at(contract, slot),
        )
        .await?;
        Ok(StorageWord {
            slot,
            value: B256::from(value),
        })
    }

    /// Read the `field_count` words of element `index`, in declared field order.
    pub async fn read_struct(
        &self,
        contract: &str,
        array_base_slot: U256,
        index: U256,
        field_count: u64,
    ) -> Result<Vec<StorageWord>, IndexerError> {
        let start = array_element_slot(array_base_slot, index, field_count);
        tracing::debug!(contract, slot = %format!("0x{start:x}"), field_count, "reading struct");
        try_join_all((0..field_count).map(|i| self.read_word(contract, start.wrapping_add(U256::from(i))))).await
    }

    /// Length of the dynamic array rooted at `array_base_slot`.
    pub async fn array_length(&self, contract: &str, array_base_slot: U256) -> Result<U256, IndexerError> {
        Ok(decode_uint(&self.read_word(contract, array_base_slot).await?))
    }

    /// Decode element `index` of a `Lock[]` array.
    pub async fn read_lock(&self, contract: &str, array_base_slot: U256, index: U256) -> Result<LockRecord, IndexerError> {
        let words = self
            .read_struct(contract, array_base_slot, index, LockRecord::LAYOUT.len() as u64)
            .await?;
        LockRecord::from_words(&words)
    }

    /// Decode every element of a `Lock[]` array.
    ///
    /// Fails without reading any element when the length word exceeds `max`,
    /// which usually means `array_base_slot` does not hold an array.
    pub async fn read_locks(
        &self,
        contract: &str,
        array_base_slot: U256,
        max: u64,
    ) -> Result<Vec<LockRecord>, IndexerError> {
        let len = self.array_length(contract, array_base_slot).await?;
        let count = u64::try_from(len)
            .ok()
            .filter(|n| *n <= max)
            .ok_or_else(|| IndexerError::InvalidFieldLayout {
                slot: format!("0x{array_base_slot:x}"),
                reason: format!("array length {len} exceeds the limit of {max} elements"),
            })?;

        stream::iter(0..count)
            .map(|i| self.read_lock(contract, array_base_slot, U256::from(i)))
            .buffered(READ_CONCURRENCY)
            .try_collect()
            .await
    }
}
