//! kubetraild — the kubetrail daemon.
//!
//! Single binary that assembles the history store:
//! - Store (redb, hour or day partitions)
//! - Ingestion runner fed with NDJSON watch records on stdin
//! - Retention loop
//!
//! # Usage
//!
//! ```text
//! kube-watch-dump | kubetraild run --config /etc/kubetrail/kubetraild.toml
//! kubetraild inspect --config /etc/kubetrail/kubetraild.toml
//! kubetraild purge --config /etc/kubetrail/kubetraild.toml --prefix /watch/001547546400
//! ```

mod config;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kubetrail_ingest::IngestRunner;
use kubetrail_retention::RetentionManager;
use kubetrail_store::{Store, Tables, WatchRecord};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::TrailConfig;

#[derive(Parser)]
#[command(name = "kubetraild", about = "kubetrail history daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest NDJSON watch records from stdin until EOF or Ctrl-C.
    Run {
        /// Path to kubetraild.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print table names, partition bounds, footprint, watch rows per kind
    /// and the key histogram.
    Inspect {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Delete every key under a prefix in batches.
    Purge {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Key prefix, e.g. `/watch/001547546400`.
        #[arg(long)]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kubetrail=debug"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run { config } => run(&TrailConfig::load(config.as_deref())?).await,
        Command::Inspect { config } => inspect(&TrailConfig::load(config.as_deref())?),
        Command::Purge { config, prefix } => {
            purge(&TrailConfig::load(config.as_deref())?, &prefix)
        }
    }
}

fn open_tables(config: &TrailConfig) -> anyhow::Result<Tables> {
    std::fs::create_dir_all(&config.store.data_dir).with_context(|| {
        format!("creating data dir {}", config.store.data_dir.display())
    })?;
    let db_path = config.db_path();
    let store = Store::open(&db_path, config.store.partition)?;
    info!(path = ?db_path, partition = %config.store.partition, "store opened");
    Ok(Tables::new(store))
}

async fn run(config: &TrailConfig) -> anyhow::Result<()> {
    info!("kubetrail daemon starting");
    let tables = open_tables(config)?;

    // ── Start background tasks ─────────────────────────────────

    let (records_tx, records_rx) = mpsc::channel(config.ingest.channel_capacity.max(1));
    let runner = IngestRunner::new(tables.clone(), config.ingest_options());
    let ingest_stats = runner.stats();
    let ingest_handle = runner.spawn(records_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let retention = RetentionManager::new(tables.clone(), config.retention()?);
    let retention_stats = retention.stats();
    let retention_handle = retention.spawn(shutdown_rx);

    // ── Feed stdin ─────────────────────────────────────────────

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no: u64 = 0;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            info!("stdin closed");
            break;
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: WatchRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed watch record");
                continue;
            }
        };
        if records_tx.send(record).await.is_err() {
            warn!("ingestion runner stopped early");
            break;
        }
    }

    // ── Shutdown ───────────────────────────────────────────────

    drop(records_tx);
    ingest_handle.await?;
    let _ = shutdown_tx.send(true);
    retention_handle.await?;

    info!(
        ingest = ?ingest_stats.snapshot(),
        retention = ?retention_stats.snapshot(),
        "kubetrail daemon stopped"
    );
    Ok(())
}

fn inspect(config: &TrailConfig) -> anyhow::Result<()> {
    let tables = open_tables(config)?;
    let store = tables.store();
    let bounds = tables.min_max_partition()?;

    let mut watch_kinds: BTreeMap<String, usize> = BTreeMap::new();
    if let Some((min, max)) = &bounds {
        let clock = tables.clock();
        let (found, stats) = store.view(|rows| {
            tables.watch().range_read(
                rows,
                None,
                |_| true,
                |_| true,
                clock.partition_start(min)?,
                clock.partition_start(max)?,
            )
        })?;
        stats.log("inspect");
        for key in found.keys() {
            *watch_kinds.entry(key.kind.clone()).or_default() += 1;
        }
    }

    let report = serde_json::json!({
        "path": store.path().map(Path::to_path_buf),
        "partition": config.store.partition,
        "tables": tables.table_names(),
        "min_partition": bounds.as_ref().map(|(min, _)| min),
        "max_partition": bounds.as_ref().map(|(_, max)| max),
        "footprint_bytes": store.footprint_bytes()?,
        "watch_rows_by_kind": watch_kinds,
        "partitions": store.partition_histogram()?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn purge(config: &TrailConfig, prefix: &str) -> anyhow::Result<()> {
    anyhow::ensure!(prefix.starts_with('/'), "prefix must start with '/': {prefix:?}");
    let tables = open_tables(config)?;
    let removed = tables
        .store()
        .delete_prefix_batched(prefix, config.retention.deletion_batch_size)?;
    println!("removed {removed} keys under {prefix}");
    Ok(())
}
