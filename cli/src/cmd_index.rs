//! `ledgerindex index` and `ledgerindex backfill`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use ledgerindex_core::checkpoint::CheckpointManager;
use ledgerindex_evm::{run_all, ChainClient, IndexerBuilder, TokenIndexer};

use crate::Ctx;

pub struct IndexOpts {
    pub tokens: Vec<String>,
    pub from_block: u64,
    pub batch_size: u64,
    pub poll_interval_ms: u64,
    pub filter_poll: Duration,
    pub subscribe: bool,
}

pub async fn run(ctx: &Ctx, opts: IndexOpts, shutdown: CancellationToken) -> Result<()> {
    let config = IndexerBuilder::new()
        .tokens(opts.tokens)
        .genesis_block(opts.from_block)
        .batch_size(opts.batch_size)
        .poll_interval_ms(opts.poll_interval_ms)
        .rpc_timeout_ms(ctx.rpc_timeout.as_millis() as u64)
        .subscribe(opts.subscribe)
        .build()?;

    let client = ctx.client(Some(opts.filter_poll))?;
    let storage = Arc::new(ctx.storage().await?);

    tracing::info!(rpc = %ctx.rpc, db = %ctx.db, tokens = ?config.tokens, "indexer starting");
    run_all(config, client, storage.clone(), storage, shutdown).await?;
    Ok(())
}

pub async fn backfill(
    ctx: &Ctx,
    token: &str,
    from_block: u64,
    to_block: Option<u64>,
    batch_size: u64,
    reset: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let client = ctx.client(None)?;
    let to_block = match to_block {
        Some(block) => block,
        None => client.block_number().await.context("failed to read chain head")?,
    };

    let config = IndexerBuilder::new()
        .token(token)
        .genesis_block(from_block)
        .to_block(to_block)
        .batch_size(batch_size)
        .rpc_timeout_ms(ctx.rpc_timeout.as_millis() as u64)
        .subscribe(false)
        .build()?;

    let storage = Arc::new(ctx.storage().await?);
    let checkpoints = CheckpointManager::new(storage.clone(), from_block);
    if reset {
        checkpoints.reset(token).await?;
    }

    let indexer = TokenIndexer::new(token, config, client, storage.clone(), storage.clone());
    indexer.run(shutdown).await?;

    match checkpoints.load(token).await? {
        Some(cp) => println!("{token}: checkpoint at block {}", cp.last_processed_block),
        None => println!("{token}: no checkpoint"),
    }
    Ok(())
}
