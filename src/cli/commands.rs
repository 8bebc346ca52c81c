//! CLI command definitions for jobforge.
//!
//! The binary is an operator tool: it prepares the database, runs the lease
//! reaper and reports on the queue. Producers and workers use the library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::allocator::{BatchAllocator, BatchAppend, SequentialAllocator};
use crate::analytics::RateEstimator;
use crate::config::EngineConfig;
use crate::id::Id64;
use crate::queue::{JobFilter, JobQueue, LeaseReaper, QueueStats};
use crate::store::{CounterStore, FsObjectStore, JobStore, ObjectStore, PgStore, RedisCounterStore};

/// Job lifecycle and identifier allocation engine.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Operate the jobforge job queue and path allocators")]
#[command(version)]
#[command(
    long_about = "jobforge moves jobs through pending, in-progress, completed and failed partitions \
and allocates collision-free IDs and storage paths.\n\nStorage is configured through JOBFORGE_* \
environment variables. Without JOBFORGE_DATABASE_URL every command runs against an empty \
in-memory store.\n\nExample usage:\n  jobforge migrate\n  jobforge reap --once\n  jobforge stats --dataset variants"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create the partition and counter tables in PostgreSQL.
    Migrate,

    /// Return jobs with expired leases to pending, or fail them.
    Reap(ReapArgs),

    /// Print job counts per partition.
    Stats(StatsArgs),

    /// Print the throughput rate of a dataset in jobs per second.
    Rate(RateArgs),

    /// Append JSON records to the batch files of a dataset.
    Batch(BatchArgs),

    /// Generate a new ID64, or decode a formatted one.
    Id(IdArgs),
}

/// Arguments for `jobforge reap`.
#[derive(Parser, Debug)]
pub struct ReapArgs {
    /// Run a single pass and exit.
    #[arg(long)]
    pub once: bool,

    /// Seconds between passes; overrides JOBFORGE_REAP_INTERVAL_SECS.
    #[arg(long)]
    pub interval: Option<u64>,
}

/// Arguments for `jobforge stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Only count jobs of this task type.
    #[arg(short = 't', long)]
    pub task_type: Option<String>,

    /// Only count jobs of this dataset.
    #[arg(short = 'd', long)]
    pub dataset: Option<String>,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `jobforge rate`.
#[derive(Parser, Debug)]
pub struct RateArgs {
    /// Dataset to measure.
    pub dataset: String,

    /// Number of most recent completed jobs to sample.
    #[arg(short = 'n', long)]
    pub sample_size: Option<usize>,
}

/// Arguments for `jobforge batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// Bucket under the object store root.
    pub bucket: String,

    /// Dataset whose batch files receive the records.
    pub dataset: String,

    /// File holding a JSON array of records, or one record per line.
    #[arg(short = 'f', long)]
    pub file: PathBuf,
}

/// Arguments for `jobforge id`.
#[derive(Parser, Debug)]
pub struct IdArgs {
    /// Formatted ID64 to decode. A new ID is generated when omitted.
    pub id: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;

    match cli.command {
        Commands::Migrate => run_migrate_command(&config).await?,
        Commands::Reap(args) => run_reap_command(&config, args).await?,
        Commands::Stats(args) => run_stats_command(&config, args).await?,
        Commands::Rate(args) => run_rate_command(&config, args).await?,
        Commands::Batch(args) => run_batch_command(&config, args).await?,
        Commands::Id(args) => run_id_command(args)?,
    }
    Ok(())
}

// ============================================================================
// Backend wiring
// ============================================================================

/// Stores selected by the configuration.
struct Backends {
    jobs: Arc<dyn JobStore>,
    counters: Arc<dyn CounterStore>,
}

/// Connects the Postgres job store, with counters in Redis when configured.
async fn connect_backends(config: &EngineConfig) -> anyhow::Result<Backends> {
    let url = config.require_database_url()?;
    let pg = Arc::new(PgStore::connect(url).await?);
    info!("Connected to PostgreSQL");

    let counters: Arc<dyn CounterStore> = match connect_redis(config).await? {
        Some(redis) => redis,
        None => pg.clone(),
    };
    Ok(Backends { jobs: pg, counters })
}

/// Connects counters alone, preferring Redis over Postgres.
async fn connect_counters(config: &EngineConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    config.require_persistent_counters()?;
    if let Some(redis) = connect_redis(config).await? {
        return Ok(redis);
    }
    let url = config.require_database_url()?;
    let pg = PgStore::connect(url).await?;
    info!("Counters stored in PostgreSQL");
    Ok(Arc::new(pg))
}

async fn connect_redis(config: &EngineConfig) -> anyhow::Result<Option<Arc<dyn CounterStore>>> {
    let Some(url) = config.redis_url.as_deref() else {
        return Ok(None);
    };
    let redis = RedisCounterStore::connect(url, &config.redis_prefix).await?;
    info!(prefix = %config.redis_prefix, "Counters stored in Redis");
    Ok(Some(Arc::new(redis)))
}

fn build_queue(config: &EngineConfig, backends: &Backends) -> anyhow::Result<JobQueue> {
    let paths = SequentialAllocator::new(backends.counters.clone(), config.folder_capacity)?;
    Ok(JobQueue::new(backends.jobs.clone(), Arc::new(paths))
        .with_priority_dataset(Some(config.priority_dataset.clone()))
        .with_lease(config.lease_duration())
        .with_max_attempts(config.max_attempts))
}

// ============================================================================
// Command implementations
// ============================================================================

async fn run_migrate_command(config: &EngineConfig) -> anyhow::Result<()> {
    let url = config.require_database_url()?;
    let store = PgStore::connect(url).await?;
    let applied = store.run_migrations().await?;
    info!(applied = applied, "Migrations complete");
    println!("Applied {} migration(s)", applied);
    Ok(())
}

async fn run_reap_command(config: &EngineConfig, args: ReapArgs) -> anyhow::Result<()> {
    let backends = connect_backends(config).await?;
    let queue = Arc::new(build_queue(config, &backends)?);

    let interval = args
        .interval
        .map(std::time::Duration::from_secs)
        .unwrap_or(config.reap_interval);
    if interval.is_zero() {
        anyhow::bail!("--interval must be greater than 0");
    }
    let reaper = LeaseReaper::new(queue, interval);

    if args.once {
        let summary = reaper.run_once().await?;
        println!(
            "Requeued {} job(s), failed {} job(s)",
            summary.requeued, summary.failed
        );
        return Ok(());
    }

    let handle = reaper.spawn();
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, stopping reaper");
    reaper.shutdown();

    let totals = handle.await?;
    println!(
        "Requeued {} job(s), failed {} job(s)",
        totals.requeued, totals.failed
    );
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct StatsOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset: Option<String>,
    stats: QueueStats,
    total: u64,
}

async fn run_stats_command(config: &EngineConfig, args: StatsArgs) -> anyhow::Result<()> {
    let backends = connect_backends(config).await?;
    let queue = build_queue(config, &backends)?;

    let filter = stats_filter(&args);
    let stats = queue.stats(&filter).await?;

    if args.json {
        let output = StatsOutput {
            task_type: filter.task_type,
            dataset: filter.dataset,
            stats,
            total: stats.total(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("pending:     {}", stats.pending);
        println!("in_progress: {}", stats.in_progress);
        println!("completed:   {}", stats.completed);
        println!("failed:      {}", stats.failed);
        println!("total:       {}", stats.total());
    }
    Ok(())
}

fn stats_filter(args: &StatsArgs) -> JobFilter {
    let mut filter = JobFilter::new();
    if let Some(task_type) = &args.task_type {
        filter = filter.with_task_type(task_type.as_str());
    }
    if let Some(dataset) = &args.dataset {
        filter = filter.with_dataset(dataset.as_str());
    }
    filter
}

async fn run_rate_command(config: &EngineConfig, args: RateArgs) -> anyhow::Result<()> {
    let backends = connect_backends(config).await?;
    let estimator = RateEstimator::new(backends.jobs, config.rate_cache_ttl);

    let sample_size = args.sample_size.unwrap_or(config.rate_sample_size);
    let rate = estimator.rate_per_second(&args.dataset, sample_size).await?;
    println!("{:.6}", rate);
    Ok(())
}

async fn run_batch_command(config: &EngineConfig, args: BatchArgs) -> anyhow::Result<()> {
    // Counters that die with the process would restart at batch 0 next run.
    config.require_persistent_counters()?;
    let records = read_records(&args.file)?;
    let counters = connect_counters(config).await?;
    let objects = Arc::new(FsObjectStore::new(&config.object_root));

    let append = append_records(config, counters, objects, &args, records).await?;
    for write in &append.writes {
        println!(
            "{}/{}: {} record(s){}",
            args.bucket,
            write.key,
            write.records,
            if write.complete { ", complete" } else { "" }
        );
    }
    Ok(())
}

async fn append_records(
    config: &EngineConfig,
    counters: Arc<dyn CounterStore>,
    objects: Arc<dyn ObjectStore>,
    args: &BatchArgs,
    records: Vec<Value>,
) -> anyhow::Result<BatchAppend> {
    let batches = BatchAllocator::new(counters, objects, config.batch_capacity)?;
    let append = batches
        .append_batch(&args.bucket, &args.dataset, records)
        .await?;
    info!(
        bucket = %args.bucket,
        dataset = %args.dataset,
        files = append.writes.len(),
        "Batch append complete"
    );
    Ok(append)
}

/// Reads a JSON array, or newline-delimited JSON when the file is not an array.
fn read_records(path: &Path) -> anyhow::Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_records(&content).with_context(|| format!("Invalid records in {}", path.display()))
}

fn parse_records(content: &str) -> anyhow::Result<Vec<Value>> {
    if let Ok(Value::Array(records)) = serde_json::from_str::<Value>(content) {
        return Ok(records);
    }
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(anyhow::Error::from))
        .collect()
}

fn run_id_command(args: IdArgs) -> anyhow::Result<()> {
    match args.id {
        Some(formatted) => {
            let id = Id64::from_formatted_string(&formatted)?;
            println!("value:     {}", u64::from(id));
            println!("timestamp: {}", id.timestamp().to_rfc3339());
        }
        None => println!("{}", Id64::generate()),
    }
    Ok(())
}
