//! blockstream CLI: run the reorg reconciler and inspect its state.
//!
//! Usage:
//! ```bash
//! # Poll the block queue until Ctrl-C
//! blockstream drain --config blockstream.json
//!
//! # Drain whatever is queued, then exit
//! blockstream drain --once
//!
//! # Feed a batch of change records into the block queue
//! blockstream notify records.json
//!
//! # Show the current head for the configured network
//! blockstream status
//! ```

mod config;
mod logging;

use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use blockstream_core::{
    parse_batch, DrainWorker, NotificationConsumer, QueueLogSink, StateStore,
};
use blockstream_storage::{SqliteQueue, SqliteStorage};

use crate::config::WorkerConfig;
use crate::logging::init_tracing;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "drain" => cmd_drain(&args[2..]).await,
        "notify" => cmd_notify(&args[2..]).await,
        "status" => cmd_status(&args[2..]).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("blockstream {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("blockstream {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg reconciler for a durable block queue\n");
    println!("USAGE:");
    println!("    blockstream <COMMAND>\n");
    println!("COMMANDS:");
    println!("    drain    Run the drain worker (until Ctrl-C, or one pass with --once)");
    println!("    notify   Enqueue block keys from a JSON array of change records");
    println!("    status   Print the current state record");
    println!("    info     Show default configuration");
    println!("    version  Print version");
    println!("    help     Print this help\n");
    println!("FLAGS:");
    println!("    --config <FILE>   JSON worker config  [optional]");
    println!("    --once            drain: exit when the queue is empty\n");
    println!("ENVIRONMENT:");
    println!("    BLOCKSTREAM_NETWORK_ID, BLOCKSTREAM_DATABASE, LOG_JSON, RUST_LOG");
}

fn load_config(args: &[String]) -> anyhow::Result<WorkerConfig> {
    let path = parse_flag(args, "--config").map(PathBuf::from);
    WorkerConfig::load(path.as_deref())
}

struct Endpoints {
    storage: Arc<SqliteStorage>,
    blocks: Arc<SqliteQueue>,
    logs: Arc<SqliteQueue>,
}

async fn open_endpoints(config: &WorkerConfig) -> anyhow::Result<Endpoints> {
    let storage = SqliteStorage::open(&config.database)
        .await
        .with_context(|| format!("opening database {}", config.database))?;
    let visibility = Duration::from_secs(config.visibility_timeout_secs);
    let blocks = SqliteQueue::open(&storage, &config.block_queue, visibility)
        .await
        .with_context(|| format!("opening queue {}", config.block_queue))?;
    let logs = SqliteQueue::open(&storage, &config.log_queue, visibility)
        .await
        .with_context(|| format!("opening queue {}", config.log_queue))?;
    Ok(Endpoints {
        storage: Arc::new(storage),
        blocks: Arc::new(blocks),
        logs: Arc::new(logs),
    })
}

async fn cmd_drain(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    init_tracing(&config.log);
    let endpoints = open_endpoints(&config).await?;

    let worker = DrainWorker::new(
        config.drain.clone(),
        endpoints.blocks.clone(),
        endpoints.storage.clone(),
        endpoints.storage.clone(),
        Arc::new(QueueLogSink::new(endpoints.logs.clone())),
    );

    let stats = if has_flag(args, "--once") {
        worker.drain().await?
    } else {
        let shutdown = CancellationToken::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
            on_signal.cancel();
        });
        worker.run(shutdown).await
    };

    println!("Received:        {}", stats.received);
    println!("Acknowledged:    {}", stats.acknowledged);
    println!("Failed:          {}", stats.failed);
    println!("Malformed:       {}", stats.malformed);
    println!("Dead-lettered:   {}", stats.dead_lettered);
    println!("Logs added:      {}", stats.logs_added);
    println!("Logs retracted:  {}", stats.logs_retracted);

    endpoints.storage.close().await;
    Ok(())
}

async fn cmd_notify(args: &[String]) -> anyhow::Result<()> {
    let file = args
        .first()
        .filter(|a| !a.starts_with("--"))
        .context("notify requires a records file")?;
    let config = load_config(&args[1..])?;
    init_tracing(&config.log);

    let raw = std::fs::read_to_string(Path::new(file))
        .with_context(|| format!("reading {file}"))?;
    let records = parse_batch(&raw).with_context(|| format!("parsing {file}"))?;

    let endpoints = open_endpoints(&config).await?;
    let consumer = NotificationConsumer::new(endpoints.blocks.clone());
    let report = consumer.handle_batch(&records).await?;

    println!("Records:    {}", report.records);
    println!("Extracted:  {}", report.extracted);
    println!("Enqueued:   {}", report.sent);

    endpoints.storage.close().await;
    Ok(())
}

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let storage = SqliteStorage::open(&config.database)
        .await
        .with_context(|| format!("opening database {}", config.database))?;

    match storage.current_state(&config.drain.network_id).await? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => println!("No state recorded for network '{}'", config.drain.network_id),
    }

    storage.close().await;
    Ok(())
}

fn cmd_info() {
    let config = WorkerConfig::default();
    println!("Blockstream v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default network: {}", config.drain.network_id);
    println!("  Default database: {}", config.database);
    println!("  Queues: {} (blocks), {} (log events)", config.block_queue, config.log_queue);
    println!("  Visibility timeout: {}s", config.visibility_timeout_secs);
    println!("  Batch size: {} messages/poll", config.drain.batch_size);
    match config.drain.max_receive_count {
        Some(max) => println!("  Dead-letter after: {max} deliveries"),
        None => println!("  Dead-letter after: never"),
    }
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
