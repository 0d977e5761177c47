//! `ledgerindex read-struct` and `ledgerindex read-locks`.

use alloy_primitives::U256;
use anyhow::Result;

use ledgerindex_evm::{array_element_slot, decode_struct, FieldKind, StorageSlotReader};

use crate::Ctx;

/// Parse a decimal or `0x`-hex 256-bit integer.
pub fn parse_u256(s: &str) -> Result<U256, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => U256::from_str_radix(hex, 16),
        None => U256::from_str_radix(s, 10),
    };
    parsed.map_err(|e| format!("invalid 256-bit integer '{s}': {e}"))
}

pub fn parse_field_kind(s: &str) -> Result<FieldKind, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "address" => Ok(FieldKind::Address),
        "uint" | "uint256" => Ok(FieldKind::Uint),
        other => Err(format!("unknown field kind '{other}' (expected address or uint)")),
    }
}

pub async fn read_struct(
    ctx: &Ctx,
    contract: &str,
    slot: U256,
    index: U256,
    fields: &[FieldKind],
    as_json: bool,
) -> Result<()> {
    let reader = StorageSlotReader::new(ctx.client(None)?, ctx.rpc_timeout);
    let words = reader.read_struct(contract, slot, index, fields.len() as u64).await?;
    let values = decode_struct(&words, fields)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else {
        let start = array_element_slot(slot, index, fields.len() as u64);
        println!("element {index} of array at slot {slot} (first slot 0x{start:x}):");
        for (i, (word, value)) in words.iter().zip(&values).enumerate() {
            println!("  [{i}] slot 0x{:x}: {value}", word.slot);
        }
    }
    Ok(())
}

pub async fn read_locks(ctx: &Ctx, contract: &str, slot: U256, limit: u64, as_json: bool) -> Result<()> {
    let reader = StorageSlotReader::new(ctx.client(None)?, ctx.rpc_timeout);
    let locks = reader.read_locks(contract, slot, limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&locks)?);
    } else {
        println!("locks.length = {}", locks.len());
        for (i, lock) in locks.iter().enumerate() {
            println!(
                "locks[{i}]: user: {}, startTime: {}, amount: {}",
                lock.user, lock.start_time, lock.amount
            );
        }
    }
    Ok(())
}
