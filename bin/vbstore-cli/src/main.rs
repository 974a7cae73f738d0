//! vbstore CLI - Admin Command Line Interface
//!
//! Opens a store over the redb database in the data directory, warms it up,
//! runs one command and shuts the store down after persisting the queue.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vbstore_common::{EngineConfig, Status, VBucketId, VBucketState};
use vbstore_engine::{EpStore, Item, MutationLog, Requester, StatsSnapshot, VBucketStats, Waiter};

const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(10);
const FLUSH_STALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "vbstore-cli")]
#[command(about = "vbstore Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "VBSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory, overriding the config file
    #[arg(short, long, env = "VBSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Run without a mutation log (warmup scans the whole store)
    #[arg(long)]
    no_mutation_log: bool,

    /// Log level
    #[arg(long, default_value = "warn", env = "VBSTORE_LOG_LEVEL")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a value
    Set {
        #[arg(short, long, default_value_t = 0)]
        vbucket: VBucketId,
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        flags: u32,
        /// Absolute expiry time in seconds since the epoch, 0 for none
        #[arg(long, default_value_t = 0)]
        exptime: u32,
    },
    /// Read a value, fetching it from disk if it was ejected
    Get {
        #[arg(short, long, default_value_t = 0)]
        vbucket: VBucketId,
        key: String,
    },
    /// Delete a key
    Delete {
        #[arg(short, long, default_value_t = 0)]
        vbucket: VBucketId,
        key: String,
    },
    /// Eject a value from memory
    Evict {
        #[arg(short, long, default_value_t = 0)]
        vbucket: VBucketId,
        key: String,
        /// Eject even if the entry is dirty or the vbucket is not active
        #[arg(long)]
        force: bool,
    },
    /// Create a vbucket or change its state
    SetState {
        vbucket: VBucketId,
        /// active, replica, pending or dead
        state: VBucketState,
    },
    /// Delete a dead vbucket and its data on disk
    DeleteVbucket { vbucket: VBucketId },
    /// Persist everything queued
    Flush,
    /// Print engine and vbucket statistics as JSON
    Stats,
    /// Print the records of the mutation log
    DumpLog,
}

#[derive(Serialize)]
struct StatsReport {
    engine: StatsSnapshot,
    vbuckets: Vec<VBucketStats>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let config = load_config(&args)?;
    if matches!(args.command, Commands::DumpLog) {
        return dump_log(&config);
    }

    info!(data_dir = %config.data_dir.display(), "Opening store");
    let store = EpStore::open(config)?;
    store.initialize()?;
    let result = run(&store, args.command).await;
    store.shutdown(false);
    result
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config: EngineConfig = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir.clone_from(dir);
    }
    config.klog.path = if args.no_mutation_log {
        None
    } else {
        config
            .klog
            .path
            .take()
            .or_else(|| Some(config.data_dir.join("mutation.log")))
    };
    // One-shot commands need the warmed-up key set.
    config.warmup.enabled = true;
    config.warmup.wait_for_warmup = true;
    config.validate()?;
    Ok(config)
}

fn check(status: Status) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        bail!("operation failed: {status}")
    }
}

async fn run(store: &Arc<EpStore>, command: Commands) -> Result<()> {
    match command {
        Commands::Set {
            vbucket,
            key,
            value,
            flags,
            exptime,
        } => {
            let item = Item::new(key, vbucket, value)
                .with_flags(flags)
                .with_exptime(exptime);
            let res = store.set(&item, None);
            check(res.status)?;
            println!("stored cas={}", res.cas);
        }
        Commands::Get { vbucket, key } => {
            let gv = store.get_or_wait(&key, vbucket).await;
            check(gv.status)?;
            let item = gv.item.context("read returned no item")?;
            info!(cas = item.cas, flags = item.flags, exptime = item.exptime, "Read");
            let value = item.value.unwrap_or_default();
            println!("{}", String::from_utf8_lossy(&value));
        }
        Commands::Delete { vbucket, key } => {
            let res = store.delete_item(&key, 0, vbucket, None, false, None);
            check(res.status)?;
            println!("deleted");
        }
        Commands::Evict {
            vbucket,
            key,
            force,
        } => {
            let (status, message) = store.evict_key(&key, vbucket, force);
            println!("{message}");
            check(status)?;
        }
        Commands::SetState { vbucket, state } => {
            check(store.set_vbucket_state(vbucket, state))?;
            println!("vbucket {vbucket} is {state}");
        }
        Commands::DeleteVbucket { vbucket } => {
            let (waiter, rx) = Waiter::new();
            let requester: Requester = waiter;
            match store.delete_vbucket(vbucket, Some(requester)) {
                Status::WouldBlock => check(rx.await?)?,
                status => check(status)?,
            }
            println!("vbucket {vbucket} deleted");
        }
        Commands::Flush => {
            let flushed = drain_queue(store, FLUSH_STALL_TIMEOUT).await?;
            println!("flushed {flushed} mutations");
        }
        Commands::Stats => {
            let report = StatsReport {
                engine: store.stats().snapshot(),
                vbuckets: store.vbucket_stats(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::DumpLog => dump_log(store.config())?,
    }
    Ok(())
}

/// Tracks whether the disk queue is still shrinking
struct FlushProgress {
    remaining: usize,
    last_progress: Instant,
}

impl FlushProgress {
    fn new(queued: usize, now: Instant) -> Self {
        Self {
            remaining: queued,
            last_progress: now,
        }
    }

    /// Record the current queue size; true once it has not shrunk for `timeout`
    fn stalled(&mut self, queued: usize, now: Instant, timeout: Duration) -> bool {
        if queued < self.remaining {
            self.remaining = queued;
            self.last_progress = now;
            return false;
        }
        now.duration_since(self.last_progress) >= timeout
    }
}

/// Wake the flusher until the disk queue is empty
///
/// Returns the number of mutations persisted, or fails with the remaining
/// queue size once the queue stops shrinking.
async fn drain_queue(store: &EpStore, stall_timeout: Duration) -> Result<usize> {
    let queued = store.stats().disk_queue_size();
    let mut progress = FlushProgress::new(queued, Instant::now());
    while store.wake_up_flusher() {
        tokio::time::sleep(FLUSH_POLL_INTERVAL).await;
        let remaining = store.stats().disk_queue_size();
        if progress.stalled(remaining, Instant::now(), stall_timeout) {
            bail!(
                "flush made no progress for {}s, {remaining} mutations still queued",
                stall_timeout.as_secs()
            );
        }
    }
    Ok(queued.saturating_sub(store.stats().disk_queue_size()))
}

/// Print the records of the mutation log without creating or modifying it
fn dump_log(config: &EngineConfig) -> Result<()> {
    let Some(path) = config.klog.path.as_ref() else {
        bail!("no mutation log configured");
    };
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("mutation log {} does not exist", path.display())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("reading mutation log {}", path.display()));
        }
    };
    if size == 0 {
        info!(path = %path.display(), "Mutation log is empty");
        return Ok(());
    }
    let log = MutationLog::new(&config.klog);
    let mut records = 0usize;
    for record in log.iter()? {
        let record = record?;
        println!(
            "{:<8} vb={:<5} row={:<10} {}",
            record.kind.name(),
            record.vbucket,
            record.row_id,
            record.key
        );
        records += 1;
    }
    info!(records, size, "Mutation log dumped");
    Ok(())
}
