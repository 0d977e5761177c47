//! The per-token index loop.
//!
//! Two producers feed one bounded queue per token:
//!   - a timer enqueuing `CatchUp` every `poll_interval_ms`
//!   - a subscription task that opens the live subscription, enqueues a
//!     `Resync`, then forwards every live batch as `Live(logs)`
//!
//! A single consumer drains the queue, so historical and live batches for
//! one token never run concurrently.
//!
//! # CatchUp
//! From `checkpoint + 1` to the chain head (or `to_block`), page by page:
//! fetch → decode → persist → advance checkpoint to the page end.
//!
//! # Resync
//! Marks the backlog as uncovered, then runs a `CatchUp`.
//!
//! # Live
//! decode → persist → advance checkpoint to the highest valid block.
//!
//! A live batch only moves the checkpoint once a catch-up has succeeded after
//! the current subscription opened. Until then the blocks between the
//! checkpoint and the subscription start may still be missing from the
//! ledger, so live records are stored but the checkpoint stays put and the
//! next catch-up fills the gap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ledgerindex_core::checkpoint::{CheckpointManager, CheckpointStore};
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::indexer::{IndexerConfig, IndexerState};
use ledgerindex_core::ledger::{BatchOutcome, Ledger, Persister};
use ledgerindex_core::types::normalize_address;

use crate::client::{ChainClient, RawLog};
use crate::decoder::EventDecoder;
use crate::fetcher::LogFetcher;
use crate::retry::{Backoff, BackoffConfig};

/// A unit of work for a token's consumer.
#[derive(Debug)]
enum Work {
    CatchUp,
    /// A live subscription was (re)opened.
    Resync,
    Live(Vec<RawLog>),
}

/// Totals for one catch-up or live batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub inserted: usize,
    pub already_present: usize,
    pub skipped: usize,
    /// Checkpoint after the cycle, if one exists.
    pub checkpoint: Option<u64>,
}

impl CycleReport {
    fn absorb(&mut self, outcome: &BatchOutcome, skipped: usize) {
        self.inserted += outcome.inserted;
        self.already_present += outcome.already_present;
        self.skipped += skipped;
    }
}

/// Indexes `Transfer` events of a single token.
pub struct TokenIndexer<C> {
    token: String,
    config: IndexerConfig,
    fetcher: Arc<LogFetcher<C>>,
    decoder: EventDecoder<C>,
    persister: Persister,
    checkpoints: CheckpointManager,
    state: IndexerState,
    /// Set by a successful catch-up to the head, cleared when a subscription
    /// opens.
    backlog_covered: bool,
}

impl<C: ChainClient> TokenIndexer<C> {
    pub fn new(
        token: &str,
        config: IndexerConfig,
        client: Arc<C>,
        ledger: Arc<dyn Ledger>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let rpc_timeout = Duration::from_millis(config.rpc_timeout_ms);
        Self {
            token: normalize_address(token),
            fetcher: Arc::new(LogFetcher::new(client.clone(), config.batch_size, rpc_timeout)),
            decoder: EventDecoder::new(client, rpc_timeout),
            persister: Persister::new(ledger),
            checkpoints: CheckpointManager::new(checkpoints, config.genesis_block),
            state: IndexerState::Idle,
            backlog_covered: false,
            config,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> IndexerState {
        self.state
    }

    /// Whether live batches may currently advance the checkpoint.
    pub fn backlog_covered(&self) -> bool {
        self.backlog_covered
    }

    /// Index from the resume block up to the head (or `to_block`).
    pub async fn catch_up(&mut self) -> Result<CycleReport, IndexerError> {
        let report = self.index_backlog().await?;
        // a run capped at `to_block` never reaches the head
        self.backlog_covered = self.config.to_block.is_none();
        Ok(report)
    }

    async fn index_backlog(&mut self) -> Result<CycleReport, IndexerError> {
        self.state = IndexerState::CatchingUp;
        let from = self.checkpoints.resume_block(&self.token).await?;
        let head = self.fetcher.head().await?;
        let target = self.config.to_block.map_or(head, |to| to.min(head));

        let mut report = CycleReport {
            checkpoint: self.checkpoints.load(&self.token).await?.map(|cp| cp.last_processed_block),
            ..Default::default()
        };
        if from > target {
            tracing::trace!(token = %self.token, from, head, "nothing to catch up");
            return Ok(report);
        }

        tracing::info!(token = %self.token, chain = %self.config.chain, from, to = target, "catching up");

        for (start, end) in self.fetcher.pages(from, target) {
            let logs = self.fetcher.fetch_page(&self.token, start, end).await?;
            let batch = self.decoder.decode_batch(&self.token, &logs).await?;
            let outcome = self.persister.persist_batch(&batch.records).await?;
            self.checkpoints.advance(&self.token, end).await?;

            report.absorb(&outcome, batch.skipped);
            report.checkpoint = Some(end);

            tracing::info!(
                token = %self.token,
                from = start,
                to = end,
                logs = logs.len(),
                inserted = outcome.inserted,
                skipped = batch.skipped,
                "page indexed"
            );
        }

        Ok(report)
    }

    /// Apply one batch delivered by the live subscription.
    ///
    /// Records are always stored. The checkpoint only advances once the
    /// backlog behind the subscription is covered.
    pub async fn process_live(&mut self, logs: Vec<RawLog>) -> Result<CycleReport, IndexerError> {
        self.state = IndexerState::Live;
        let batch = self.decoder.decode_batch(&self.token, &logs).await?;
        let outcome = self.persister.persist_batch(&batch.records).await?;

        let mut report = CycleReport::default();
        report.absorb(&outcome, batch.skipped);
        match batch.highest_block() {
            Some(block) if self.backlog_covered => {
                self.checkpoints.advance(&self.token, block).await?;
            }
            Some(block) => {
                tracing::debug!(token = %self.token, block, "checkpoint held until the backlog is indexed");
            }
            None => {}
        }
        report.checkpoint = self.checkpoints.load(&self.token).await?.map(|cp| cp.last_processed_block);

        tracing::info!(
            token = %self.token,
            logs = logs.len(),
            inserted = outcome.inserted,
            skipped = batch.skipped,
            block = ?batch.highest_block(),
            "live batch indexed"
        );
        Ok(report)
    }

    async fn handle(&mut self, work: Work) {
        let result = match work {
            Work::CatchUp => self.catch_up().await,
            Work::Resync => {
                self.backlog_covered = false;
                self.catch_up().await
            }
            Work::Live(logs) => self.process_live(logs).await,
        };
        if let Err(e) = result {
            if e.is_transient() {
                tracing::warn!(token = %self.token, error = %e, "cycle abandoned, will retry");
            } else {
                tracing::error!(token = %self.token, error = %e, "cycle failed");
            }
        }
    }

    async fn reached_to_block(&self, to_block: u64) -> bool {
        match self.checkpoints.load(&self.token).await {
            Ok(cp) => cp.is_some_and(|cp| cp.last_processed_block >= to_block),
            Err(e) => {
                tracing::error!(token = %self.token, error = %e, "failed to read checkpoint");
                false
            }
        }
    }

    /// Run until `shutdown` is cancelled, or until `to_block` is reached in
    /// bounded mode.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), IndexerError> {
        tracing::info!(token = %self.token, chain = %self.config.chain, "starting token indexer");
        let result = match self.config.to_block {
            Some(to_block) => self.run_bounded(to_block, shutdown).await,
            None => self.run_live(shutdown).await,
        };
        self.state = IndexerState::Stopped;
        tracing::info!(token = %self.token, "token indexer stopped");
        result
    }

    async fn run_bounded(&mut self, to_block: u64, shutdown: CancellationToken) -> Result<(), IndexerError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            self.handle(Work::CatchUp).await;
            if self.reached_to_block(to_block).await {
                tracing::info!(token = %self.token, to_block, "bounded run complete");
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.state = IndexerState::Stopping;
                    return Ok(());
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn run_live(&mut self, shutdown: CancellationToken) -> Result<(), IndexerError> {
        let (tx, mut rx) = mpsc::channel::<Work>(self.config.queue_capacity.max(1));
        let producers = shutdown.child_token();

        let mut handles: Vec<JoinHandle<()>> = vec![tokio::spawn(poll_timer(
            tx.clone(),
            Duration::from_millis(self.config.poll_interval_ms),
            producers.clone(),
        ))];
        if self.config.subscribe {
            handles.push(tokio::spawn(subscription_feed(
                self.token.clone(),
                self.fetcher.clone(),
                tx.clone(),
                producers.clone(),
            )));
        }
        drop(tx);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                work = rx.recv() => match work {
                    Some(work) => self.handle(work).await,
                    None => break,
                },
            }
        }

        self.state = IndexerState::Stopping;
        producers.cancel();
        drop(rx);
        for handle in handles {
            handle
                .await
                .map_err(|e| IndexerError::Other(format!("producer task failed: {e}")))?;
        }
        Ok(())
    }
}

async fn enqueue(tx: &mpsc::Sender<Work>, work: Work, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(work) => sent.is_ok(),
    }
}

async fn poll_timer(tx: mpsc::Sender<Work>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if !enqueue(&tx, Work::CatchUp, &cancel).await {
                    return;
                }
            }
        }
    }
}

async fn subscription_feed<C: ChainClient>(
    token: String,
    fetcher: Arc<LogFetcher<C>>,
    tx: mpsc::Sender<Work>,
    cancel: CancellationToken,
) {
    let backoff = Backoff::new(BackoffConfig {
        max_retries: u32::MAX,
        initial: Duration::from_secs(1),
        max: Duration::from_secs(60),
        multiplier: 2.0,
    });
    let mut attempt = 0u32;

    loop {
        match fetcher.subscribe(&token).await {
            Ok(mut sub) => {
                attempt = 0;
                tracing::debug!(token = %token, "live subscription open");
                if !enqueue(&tx, Work::Resync, &cancel).await {
                    return;
                }
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        batch = sub.next_batch() => match batch {
                            Some(logs) => {
                                if !enqueue(&tx, Work::Live(logs), &cancel).await {
                                    return;
                                }
                            }
                            None => break,
                        },
                    }
                }
                tracing::warn!(token = %token, "live subscription ended");
            }
            Err(e) => tracing::warn!(token = %token, error = %e, "failed to open live subscription"),
        }

        attempt = attempt.saturating_add(1);
        let delay = backoff.delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Run one [`TokenIndexer`] per configured token until `shutdown` fires (or,
/// in bounded mode, until every token reaches `to_block`).
pub async fn run_all<C: ChainClient>(
    config: IndexerConfig,
    client: Arc<C>,
    ledger: Arc<dyn Ledger>,
    checkpoints: Arc<dyn CheckpointStore>,
    shutdown: CancellationToken,
) -> Result<(), IndexerError> {
    let config = config.validate()?;
    tracing::info!(chain = %config.chain, tokens = config.tokens.len(), "starting indexer");

    let handles: Vec<_> = config
        .tokens
        .iter()
        .map(|token| {
            let indexer = TokenIndexer::new(
                token,
                config.clone(),
                client.clone(),
                ledger.clone(),
                checkpoints.clone(),
            );
            tokio::spawn(indexer.run(shutdown.clone()))
        })
        .collect();

    let mut first_error = None;
    for (token, joined) in config.tokens.iter().zip(futures::future::join_all(handles).await) {
        let result = joined
            .map_err(|e| IndexerError::Other(format!("token task failed: {e}")))
            .and_then(|r| r);
        if let Err(e) = result {
            tracing::error!(token = %token, error = %e, "token indexer failed");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
