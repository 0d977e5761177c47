//! End-to-end pipeline tests against a scripted chain.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use ledgerindex_core::checkpoint::{CheckpointManager, CheckpointStore};
use ledgerindex_core::error::IndexerError;
use ledgerindex_core::indexer::{IndexerConfig, IndexerState};
use ledgerindex_core::ledger::Ledger;
use ledgerindex_evm::{
    run_all, transfer_topic, BlockHeader, BlockTag, ChainClient, IndexerBuilder, LogFilter,
    LogSubscription, RawLog, TokenIndexer,
};
use ledgerindex_storage::{InMemoryStorage, SqliteStorage};

const TOKEN: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
const OTHER_TOKEN: &str = "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512";

// ─── Scripted chain ──────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedChain {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    fail_get_logs: AtomicBool,
    live: Mutex<Option<mpsc::Sender<Vec<RawLog>>>>,
}

impl ScriptedChain {
    fn with_head(head: u64) -> Self {
        let chain = Self::default();
        chain.head.store(head, Ordering::SeqCst);
        chain
    }

    fn push(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    fn live_sender(&self) -> Option<mpsc::Sender<Vec<RawLog>>> {
        self.live.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn block_number(&self) -> Result<u64, IndexerError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(&self, filter: &LogFilter, from: u64, to: BlockTag) -> Result<Vec<RawLog>, IndexerError> {
        if self.fail_get_logs.load(Ordering::SeqCst) {
            return Err(IndexerError::Rpc("connection reset by peer".into()));
        }
        let to = match to {
            BlockTag::Latest => self.head.load(Ordering::SeqCst),
            BlockTag::Number(n) => n,
        };
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.address == filter.address)
            .filter(|l| l.block_number_u64().is_some_and(|b| b >= from && b <= to))
            .cloned()
            .collect())
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        Ok(Some(BlockHeader {
            number,
            hash: format!("0x{number:064x}"),
            timestamp: 1_700_000_000 + number * 12,
        }))
    }

    async fn get_storage_at(&self, _address: &str, _slot: U256) -> Result<[u8; 32], IndexerError> {
        Ok([0u8; 32])
    }

    async fn subscribe_logs(&self, _filter: &LogFilter) -> Result<LogSubscription, IndexerError> {
        let (tx, rx) = mpsc::channel(8);
        *self.live.lock().unwrap() = Some(tx);
        Ok(LogSubscription::new(rx, CancellationToken::new()))
    }
}

fn address_topic(byte: u8) -> String {
    format!("0x{}{}", "00".repeat(12), format!("{byte:02x}").repeat(20))
}

fn transfer(token: &str, tx: u64, block: u64, amount: u64) -> RawLog {
    RawLog {
        address: token.into(),
        topics: vec![transfer_topic(), address_topic(0x11), address_topic(0x22)],
        data: format!("0x{amount:064x}"),
        block_number: Some(format!("0x{block:x}")),
        block_hash: Some(format!("0x{block:064x}")),
        tx_hash: Some(format!("0x{tx:064x}")),
        log_index: Some("0x0".into()),
        removed: Some(false),
    }
}

fn config(genesis: u64) -> IndexerConfig {
    IndexerBuilder::new()
        .token(TOKEN)
        .genesis_block(genesis)
        .poll_interval_ms(3_600_000)
        .rpc_timeout_ms(1_000)
        .build()
        .unwrap()
}

fn indexer(
    chain: &Arc<ScriptedChain>,
    config: IndexerConfig,
    ledger: Arc<dyn Ledger>,
    checkpoints: Arc<dyn CheckpointStore>,
) -> TokenIndexer<ScriptedChain> {
    TokenIndexer::new(TOKEN, config, chain.clone(), ledger, checkpoints)
}

async fn checkpoint_of(store: &Arc<InMemoryStorage>, token: &str) -> Option<u64> {
    store.load(token).await.unwrap().map(|cp| cp.last_processed_block)
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn historical_range_persists_and_checkpoints() {
    let chain = Arc::new(ScriptedChain::with_head(102));
    for (tx, block) in [(1, 100), (2, 101), (3, 102)] {
        chain.push(transfer(TOKEN, tx, block, 1_000));
    }
    let store = Arc::new(InMemoryStorage::new());
    let mut idx = indexer(&chain, config(100), store.clone(), store.clone());

    let report = idx.catch_up().await.unwrap();

    assert_eq!(report.inserted, 3);
    assert_eq!(report.checkpoint, Some(102));
    assert_eq!(store.count().await.unwrap(), 3);
    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(102));
    assert_eq!(idx.state(), IndexerState::CatchingUp);

    let records = store.transfers_for_token(TOKEN);
    assert_eq!(records[0].from, format!("0x{}", "11".repeat(20)));
    assert_eq!(records[0].amount, "1000");
    assert_eq!(records[2].timestamp.timestamp(), 1_700_000_000 + 102 * 12);
}

#[tokio::test]
async fn rerun_after_crash_before_checkpoint_is_idempotent() {
    let chain = Arc::new(ScriptedChain::with_head(102));
    for (tx, block) in [(1, 100), (2, 101), (3, 102)] {
        chain.push(transfer(TOKEN, tx, block, 1_000));
    }
    let store = Arc::new(SqliteStorage::in_memory().await.unwrap());

    let mut first = indexer(&chain, config(100), store.clone(), store.clone());
    first.catch_up().await.unwrap();

    // Rows are durable but the checkpoint commit is lost.
    CheckpointManager::new(store.clone(), 100).reset(TOKEN).await.unwrap();

    let mut second = indexer(&chain, config(100), store.clone(), store.clone());
    let report = second.catch_up().await.unwrap();

    assert_eq!(report.inserted, 0);
    assert_eq!(report.already_present, 3);
    assert_eq!(store.count().await.unwrap(), 3);
    assert_eq!(store.load(TOKEN).await.unwrap().unwrap().last_processed_block, 102);
}

#[tokio::test]
async fn malformed_log_is_skipped() {
    // head is behind genesis, so the catch-up only covers the backlog
    let chain = Arc::new(ScriptedChain::with_head(99));
    let store = Arc::new(InMemoryStorage::new());
    let mut idx = indexer(&chain, config(100), store.clone(), store.clone());
    idx.catch_up().await.unwrap();

    let mut broken = transfer(TOKEN, 2, 101, 5);
    broken.topics.pop();
    let batch = vec![transfer(TOKEN, 1, 100, 5), broken, transfer(TOKEN, 3, 102, 5)];

    let report = idx.process_live(batch).await.unwrap();

    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(102));
}

#[tokio::test]
async fn malformed_log_in_fetched_range_is_skipped_and_logged() {
    let chain = Arc::new(ScriptedChain::with_head(102));
    let mut broken = transfer(TOKEN, 2, 101, 5);
    broken.topics.pop();
    chain.push(transfer(TOKEN, 1, 100, 5));
    chain.push(broken);
    chain.push(transfer(TOKEN, 3, 102, 5));
    let store = Arc::new(InMemoryStorage::new());
    let mut idx = indexer(&chain, config(100), store.clone(), store.clone());

    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(capture.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let report = idx.catch_up().await.unwrap();

    assert_eq!(report.inserted, 2);
    assert_eq!(report.skipped, 1);
    assert!(store.get(&format!("0x{:064x}", 2)).await.unwrap().is_none());
    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(102));

    let logs = capture.contents();
    let line = logs
        .lines()
        .find(|l| l.contains("skipping malformed log"))
        .expect("no warning for the malformed log");
    assert!(line.contains("WARN"));
    assert!(line.contains(&format!("0x{:064x}", 2)));
    assert!(line.contains("log_index"));
}

#[tokio::test]
async fn live_checkpoint_stops_at_highest_valid_block() {
    let chain = Arc::new(ScriptedChain::with_head(99));
    let store = Arc::new(InMemoryStorage::new());
    let mut idx = indexer(&chain, config(100), store.clone(), store.clone());
    idx.catch_up().await.unwrap();

    let mut broken = transfer(TOKEN, 3, 102, 5);
    broken.data = "0x".into();
    idx.process_live(vec![transfer(TOKEN, 1, 100, 5), transfer(TOKEN, 2, 101, 5), broken])
        .await
        .unwrap();

    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(101));
    assert_eq!(idx.state(), IndexerState::Live);
}

#[tokio::test]
async fn transient_failure_leaves_checkpoint_untouched() {
    let chain = Arc::new(ScriptedChain::with_head(102));
    chain.push(transfer(TOKEN, 1, 100, 1));
    chain.fail_get_logs.store(true, Ordering::SeqCst);
    let store = Arc::new(InMemoryStorage::new());
    let mut idx = indexer(&chain, config(100), store.clone(), store.clone());

    let err = idx.catch_up().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(checkpoint_of(&store, TOKEN).await, None);
    assert_eq!(store.count().await.unwrap(), 0);

    // the next cycle retries the same range
    chain.fail_get_logs.store(false, Ordering::SeqCst);
    let report = idx.catch_up().await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(102));
}

#[tokio::test]
async fn live_batch_after_failed_catch_up_holds_checkpoint() {
    let chain = Arc::new(ScriptedChain::with_head(500));
    chain.push(transfer(TOKEN, 1, 200, 1));
    chain.push(transfer(TOKEN, 2, 500, 1));
    chain.fail_get_logs.store(true, Ordering::SeqCst);
    let store = Arc::new(InMemoryStorage::new());
    let mut idx = indexer(&chain, config(100), store.clone(), store.clone());

    assert!(idx.catch_up().await.is_err());
    assert!(!idx.backlog_covered());

    let report = idx.process_live(vec![transfer(TOKEN, 2, 500, 1)]).await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.checkpoint, None);
    assert_eq!(checkpoint_of(&store, TOKEN).await, None);

    chain.fail_get_logs.store(false, Ordering::SeqCst);
    let report = idx.catch_up().await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(report.already_present, 1);
    assert!(store.get(&format!("0x{:064x}", 1)).await.unwrap().is_some());
    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(500));
    assert!(idx.backlog_covered());

    idx.process_live(vec![transfer(TOKEN, 3, 510, 1)]).await.unwrap();
    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(510));
}

#[tokio::test]
async fn run_holds_live_checkpoint_until_resync_succeeds() {
    let chain = Arc::new(ScriptedChain::with_head(500));
    chain.push(transfer(TOKEN, 1, 200, 1));
    chain.fail_get_logs.store(true, Ordering::SeqCst);
    let store = Arc::new(InMemoryStorage::new());
    let mut cfg = config(100);
    cfg.poll_interval_ms = 50;
    let idx = indexer(&chain, cfg, store.clone(), store.clone());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(idx.run(shutdown.clone()));

    wait_for(|| {
        let chain = chain.clone();
        async move { chain.live_sender().is_some() }
    })
    .await;
    chain
        .live_sender()
        .unwrap()
        .send(vec![transfer(TOKEN, 2, 500, 1)])
        .await
        .unwrap();

    wait_for(|| {
        let store = store.clone();
        async move { store.count().await.unwrap() == 1 }
    })
    .await;
    assert_eq!(checkpoint_of(&store, TOKEN).await, None);

    chain.fail_get_logs.store(false, Ordering::SeqCst);
    wait_for(|| {
        let store = store.clone();
        async move { checkpoint_of(&store, TOKEN).await == Some(500) }
    })
    .await;
    assert_eq!(store.count().await.unwrap(), 2);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn resumes_after_checkpoint() {
    let chain = Arc::new(ScriptedChain::with_head(105));
    for (tx, block) in [(1, 100), (2, 103), (3, 105)] {
        chain.push(transfer(TOKEN, tx, block, 1));
    }
    let store = Arc::new(InMemoryStorage::new());
    CheckpointManager::new(store.clone(), 0).advance(TOKEN, 101).await.unwrap();

    let mut idx = indexer(&chain, config(100), store.clone(), store.clone());
    let report = idx.catch_up().await.unwrap();

    assert_eq!(report.inserted, 2);
    assert!(store.get(&format!("0x{:064x}", 1)).await.unwrap().is_none());
    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(105));
}

#[tokio::test]
async fn live_batches_flow_through_run() {
    let chain = Arc::new(ScriptedChain::with_head(100));
    chain.push(transfer(TOKEN, 1, 100, 1));
    let store = Arc::new(InMemoryStorage::new());
    let idx = indexer(&chain, config(100), store.clone(), store.clone());

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(idx.run(shutdown.clone()));

    wait_for(|| {
        let store = store.clone();
        async move { checkpoint_of(&store, TOKEN).await == Some(100) }
    })
    .await;
    wait_for(|| {
        let chain = chain.clone();
        async move { chain.live_sender().is_some() }
    })
    .await;

    let live = chain.live_sender().unwrap();
    live.send(vec![transfer(TOKEN, 2, 101, 7), transfer(TOKEN, 3, 102, 8)])
        .await
        .unwrap();

    wait_for(|| {
        let store = store.clone();
        async move { checkpoint_of(&store, TOKEN).await == Some(102) }
    })
    .await;
    assert_eq!(store.count().await.unwrap(), 3);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn bounded_run_stops_at_to_block() {
    let chain = Arc::new(ScriptedChain::with_head(110));
    for (tx, block) in [(1, 100), (2, 101), (3, 102)] {
        chain.push(transfer(TOKEN, tx, block, 1));
    }
    let store = Arc::new(InMemoryStorage::new());
    let mut cfg = config(100);
    cfg.to_block = Some(101);
    cfg.batch_size = 1;

    indexer(&chain, cfg, store.clone(), store.clone())
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(101));
}

#[tokio::test]
async fn tokens_are_indexed_independently() {
    let chain = Arc::new(ScriptedChain::with_head(200));
    chain.push(transfer(TOKEN, 1, 150, 1));
    chain.push(transfer(OTHER_TOKEN, 2, 160, 1));
    chain.push(transfer(OTHER_TOKEN, 3, 170, 1));
    let store = Arc::new(InMemoryStorage::new());
    CheckpointManager::new(store.clone(), 0).advance(OTHER_TOKEN, 165).await.unwrap();

    let cfg = IndexerBuilder::new()
        .tokens([TOKEN, OTHER_TOKEN])
        .genesis_block(100)
        .to_block(180)
        .subscribe(false)
        .build()
        .unwrap();

    run_all(cfg, chain.clone(), store.clone(), store.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(checkpoint_of(&store, TOKEN).await, Some(180));
    assert_eq!(checkpoint_of(&store, OTHER_TOKEN).await, Some(180));
    assert_eq!(store.transfers_for_token(TOKEN).len(), 1);
    // block 160 was behind OTHER_TOKEN's checkpoint
    let other: Vec<_> = store.transfers_for_token(OTHER_TOKEN).iter().map(|r| r.block_number).collect();
    assert_eq!(other, vec![170]);
}
