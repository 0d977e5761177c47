//! Keccak-256 helpers.
//!
//! The topic0 of an EVM event log is the keccak256 hash of its canonical
//! signature string, e.g.:
//!   keccak256("Transfer(address,address,uint256)")
//!   → 0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef
//!
//! The same hash locates dynamic-array elements in contract storage.

use tiny_keccak::{Hasher, Keccak};

/// Canonical ABI signature of the ERC-20 `Transfer` event.
pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// keccak256 over raw bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    output
}

/// `0x`-prefixed topic0 for an event signature string.
pub fn event_topic(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

/// topic0 of the ERC-20 `Transfer` event.
pub fn transfer_topic() -> String {
    event_topic(TRANSFER_EVENT_SIGNATURE)
}
