//! LedgerIndex CLI.
//!
//! # Commands
//! ```text
//! ledgerindex index       --token <addr>... [--from-block N]
//! ledgerindex backfill    --token <addr> --from-block N [--to-block M]
//! ledgerindex read-struct --contract <addr> --slot P --index I --fields address,uint,uint
//! ledgerindex read-locks  --contract <addr> [--slot P] [--limit N]
//! ledgerindex transfers   --address <addr> [--limit N]
//! ledgerindex checkpoint  --token <addr> [--reset]
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ledgerindex_evm::{HttpChainClient, HttpClientConfig};

mod cmd_index;
mod cmd_query;
mod cmd_storage;
mod tracing_setup;

#[derive(Parser)]
#[command(
    name = "ledgerindex",
    about = "ERC-20 transfer indexer and contract storage reader",
    long_about = "
LedgerIndex: index ERC-20 Transfer events into SQLite and decode struct
arrays straight from contract storage.

ENVIRONMENT VARIABLES:
  LEDGERINDEX_RPC_URL     JSON-RPC endpoint (http/https)
  LEDGERINDEX_DB          SQLite database path
  LEDGERINDEX_TOKENS      Comma-separated token contracts for `index`
  RUST_LOG                Log filter directives (overrides --log-level)
",
    version
)]
struct Cli {
    /// JSON-RPC endpoint
    #[arg(long, global = true, env = "LEDGERINDEX_RPC_URL", default_value = "http://127.0.0.1:8545")]
    rpc: String,

    /// SQLite database file
    #[arg(long, global = true, env = "LEDGERINDEX_DB", default_value = "./ledgerindex.db")]
    db: String,

    /// Per-call RPC timeout in milliseconds
    #[arg(long, global = true, env = "LEDGERINDEX_RPC_TIMEOUT_MS", default_value_t = 30_000)]
    rpc_timeout_ms: u64,

    /// Default log level
    #[arg(long, global = true, env = "LEDGERINDEX_LOG", default_value = "info")]
    log_level: String,

    /// Per-crate log level override, e.g. `ledgerindex-evm=debug`
    #[arg(long = "log-component", global = true, value_parser = parse_component)]
    log_components: Vec<(String, String)>,

    /// Emit JSON structured logs
    #[arg(long, global = true, env = "LEDGERINDEX_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index Transfer events of one or more tokens until Ctrl-C
    Index {
        /// Token contract address (repeatable)
        #[arg(long = "token", env = "LEDGERINDEX_TOKENS", value_delimiter = ',', required = true)]
        tokens: Vec<String>,
        /// First block for tokens without a checkpoint
        #[arg(long, env = "LEDGERINDEX_GENESIS_BLOCK", default_value_t = 0)]
        from_block: u64,
        /// Maximum blocks per eth_getLogs call
        #[arg(long, env = "LEDGERINDEX_BATCH_SIZE", default_value_t = 1000)]
        batch_size: u64,
        /// Historical re-poll interval in milliseconds
        #[arg(long, env = "LEDGERINDEX_POLL_INTERVAL_MS", default_value_t = 300_000)]
        poll_interval_ms: u64,
        /// How often the live filter is polled, in milliseconds
        #[arg(long, env = "LEDGERINDEX_FILTER_POLL_MS", default_value_t = 4_000)]
        filter_poll_ms: u64,
        /// Disable the live subscription (re-poll only)
        #[arg(long)]
        no_subscribe: bool,
    },

    /// Index one bounded block range for a single token, then exit
    Backfill {
        #[arg(long)]
        token: String,
        /// First block for a token without a checkpoint
        #[arg(long, default_value_t = 0)]
        from_block: u64,
        /// Last block (default: current head)
        #[arg(long)]
        to_block: Option<u64>,
        #[arg(long, default_value_t = 1000)]
        batch_size: u64,
        /// Forget the token's checkpoint first
        #[arg(long)]
        reset: bool,
    },

    /// Read and decode one struct element of a storage array
    #[command(name = "read-struct")]
    ReadStruct {
        #[arg(long)]
        contract: String,
        /// Storage slot of the array (decimal or 0x-hex)
        #[arg(long, default_value = "0", value_parser = cmd_storage::parse_u256)]
        slot: alloy_primitives::U256,
        /// Element index (decimal or 0x-hex)
        #[arg(long, value_parser = cmd_storage::parse_u256)]
        index: alloy_primitives::U256,
        /// Field layout, e.g. `address,uint,uint`
        #[arg(long, value_delimiter = ',', value_parser = cmd_storage::parse_field_kind, default_values = ["address", "uint", "uint"])]
        fields: Vec<ledgerindex_evm::FieldKind>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read every element of a `Lock[]` storage array
    #[command(name = "read-locks")]
    ReadLocks {
        #[arg(long)]
        contract: String,
        #[arg(long, default_value = "0", value_parser = cmd_storage::parse_u256)]
        slot: alloy_primitives::U256,
        /// Refuse arrays longer than this many elements
        #[arg(long, default_value_t = 10_000)]
        limit: u64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List stored transfers sent or received by an address, newest first
    Transfers {
        #[arg(long)]
        address: String,
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show (or reset) a token's checkpoint
    Checkpoint {
        #[arg(long)]
        token: String,
        #[arg(long)]
        reset: bool,
    },
}

fn parse_component(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(c, l)| (c.to_string(), l.to_string()))
        .ok_or_else(|| format!("expected <crate>=<level>, got '{s}'"))
}

/// Shared settings every command may need.
pub struct Ctx {
    pub rpc: String,
    pub db: String,
    pub rpc_timeout: Duration,
}

impl Ctx {
    pub fn client(&self, filter_poll: Option<Duration>) -> Result<Arc<HttpChainClient>> {
        let mut config = HttpClientConfig {
            request_timeout: self.rpc_timeout,
            ..Default::default()
        };
        if let Some(every) = filter_poll {
            config.filter_poll_interval = every;
        }
        let client = HttpChainClient::new(&self.rpc, config).context("invalid RPC configuration")?;
        Ok(Arc::new(client))
    }

    pub async fn storage(&self) -> Result<ledgerindex_storage::SqliteStorage> {
        ledgerindex_storage::SqliteStorage::open(&self.db)
            .await
            .with_context(|| format!("failed to open database '{}'", self.db))
    }
}

/// Cancelled on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, shutting down");
                trigger.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "failed to listen for Ctrl-C"),
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_setup::init_tracing(&tracing_setup::LogConfig {
        level: cli.log_level.clone(),
        components: cli.log_components.iter().cloned().collect::<HashMap<_, _>>(),
        json: cli.log_json,
    });

    let ctx = Ctx {
        rpc: cli.rpc,
        db: cli.db,
        rpc_timeout: Duration::from_millis(cli.rpc_timeout_ms),
    };

    match cli.command {
        Commands::Index { tokens, from_block, batch_size, poll_interval_ms, filter_poll_ms, no_subscribe } => {
            let opts = cmd_index::IndexOpts {
                tokens,
                from_block,
                batch_size,
                poll_interval_ms,
                filter_poll: Duration::from_millis(filter_poll_ms),
                subscribe: !no_subscribe,
            };
            cmd_index::run(&ctx, opts, shutdown_on_ctrl_c()).await
        }

        Commands::Backfill { token, from_block, to_block, batch_size, reset } => {
            cmd_index::backfill(&ctx, &token, from_block, to_block, batch_size, reset, shutdown_on_ctrl_c()).await
        }

        Commands::ReadStruct { contract, slot, index, fields, json } => {
            cmd_storage::read_struct(&ctx, &contract, slot, index, &fields, json).await
        }

        Commands::ReadLocks { contract, slot, limit, json } => {
            cmd_storage::read_locks(&ctx, &contract, slot, limit, json).await
        }

        Commands::Transfers { address, limit } => cmd_query::transfers(&ctx, &address, limit).await,

        Commands::Checkpoint { token, reset } => cmd_query::checkpoint(&ctx, &token, reset).await,
    }
}
