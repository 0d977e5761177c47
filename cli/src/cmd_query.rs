//! `ledgerindex transfers` and `ledgerindex checkpoint`.

use anyhow::Result;

use ledgerindex_core::checkpoint::CheckpointStore;
use ledgerindex_core::ledger::Ledger;
use ledgerindex_core::types::{is_valid_address, normalize_address};

use crate::Ctx;

pub async fn transfers(ctx: &Ctx, address: &str, limit: Option<u32>) -> Result<()> {
    if !is_valid_address(address) {
        anyhow::bail!("invalid address '{address}'");
    }
    let storage = ctx.storage().await?;
    let records = storage.transfers_for_address(address, limit).await?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

pub async fn checkpoint(ctx: &Ctx, token: &str, reset: bool) -> Result<()> {
    let token = normalize_address(token);
    let storage = ctx.storage().await?;
    if reset {
        storage.delete(&token).await?;
        println!("{token}: checkpoint reset");
        return Ok(());
    }
    match storage.load(&token).await? {
        Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
        None => println!("{token}: no checkpoint"),
    }
    Ok(())
}
