//! Shared record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A decoded ERC-20 `Transfer` ready to be persisted.
///
/// Addresses and hashes are canonical lower-case `0x…` hex; `amount` is the
/// raw token amount as a decimal string so no precision is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Transaction hash, the ledger's primary key.
    pub tx_hash: String,
    pub block_number: u64,
    /// Position of the log within its block.
    pub log_index: u64,
    pub from: String,
    pub to: String,
    /// Unsigned 256-bit amount in decimal.
    pub amount: String,
    /// Contract that emitted the transfer.
    pub token_address: String,
    /// Timestamp of the containing block.
    pub timestamp: DateTime<Utc>,
}

impl TransferRecord {
    /// Returns `true` if `address` is the sender or the recipient.
    pub fn involves(&self, address: &str) -> bool {
        self.from.eq_ignore_ascii_case(address) || self.to.eq_ignore_ascii_case(address)
    }
}

/// Outcome of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    /// A new row was written.
    Inserted,
    /// A row with the same transaction hash already existed; nothing changed.
    AlreadyPresent,
}

/// Canonical form of an address or hash: trimmed, lower-case, `0x`-prefixed.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    format!("0x{}", body.to_ascii_lowercase())
}

/// Returns `true` if `address` is a `0x`-prefixed 20-byte hex string.
pub fn is_valid_address(address: &str) -> bool {
    match address.trim().strip_prefix("0x") {
        Some(body) => body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_prefixes() {
        assert_eq!(normalize_address("0xAbCdEF"), "0xabcdef");
        assert_eq!(normalize_address("  ABCDEF "), "0xabcdef");
        assert_eq!(normalize_address("0XFF"), "0xff");
    }

    #[test]
    fn address_validation() {
        assert!(is_valid_address("0x5FbDB2315678afecb367f032d93F642f64180aa3"));
        assert!(!is_valid_address("5FbDB2315678afecb367f032d93F642f64180aa3"));
        assert!(!is_valid_address("0x5FbDB2315678afecb367f032d93F642f64180a"));
        assert!(!is_valid_address("0xZZbDB2315678afecb367f032d93F642f64180aa3"));
    }

    #[test]
    fn involves_is_case_insensitive() {
        let rec = TransferRecord {
            tx_hash: "0x01".into(),
            block_number: 1,
            log_index: 0,
            from: "0xaaaa".into(),
            to: "0xbbbb".into(),
            amount: "1".into(),
            token_address: "0xcccc".into(),
            timestamp: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        };
        assert!(rec.involves("0xAAAA"));
        assert!(rec.involves("0xBbBb"));
        assert!(!rec.involves("0xcccc"));
    }
}
