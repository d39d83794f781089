use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

use ratewarden::config::WardenConfig;
use ratewarden::store::{CounterStore, InMemoryCounterStore, RedisCounterStore};
use ratewarden::{Admission, FailurePolicy, RateLimitConfig, RateLimitError, RateLimiter};

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Distributed rate limiter")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Counter store backend
    #[arg(long, value_enum, default_value_t = StoreKind::Redis, global = true)]
    store: StoreKind,

    /// Override the configured store failure policy (open or closed)
    #[arg(long, global = true)]
    failure_policy: Option<FailurePolicy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreKind {
    Redis,
    Memory,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run rate limit checks for one key and print a summary
    Check(CheckArgs),
    /// Drive checks across many keys and report throughput
    Bench(BenchArgs),
    /// Delete the shared counter for a key
    Reset {
        #[arg(long)]
        key: String,
    },
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Key to check
    #[arg(long)]
    key: String,

    /// Calls per local reservation (defaults to the configured limit)
    #[arg(long)]
    bucket_size: Option<u64>,

    /// Calls allowed per time slice (defaults to the configured limit)
    #[arg(long)]
    rate: Option<u64>,

    /// Window length in seconds (defaults to the configured limit)
    #[arg(long)]
    time_slice: Option<u64>,

    /// Number of checks to run
    #[arg(long, default_value_t = 1)]
    calls: u64,
}

#[derive(Debug, Args)]
struct BenchArgs {
    /// Total number of checks
    #[arg(long, default_value_t = 100_000)]
    calls: u64,

    /// Size of the random key space
    #[arg(long, default_value_t = 16)]
    keys: usize,

    /// Concurrent workers
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    #[arg(long, default_value_t = 100)]
    bucket_size: u64,

    #[arg(long, default_value_t = 1_000_000)]
    rate: u64,

    #[arg(long, default_value_t = 1)]
    time_slice: u64,
}

/// Outcome counts for a batch of checks.
#[derive(Debug, Default, Serialize)]
struct Tally {
    admitted: u64,
    fast_path: u64,
    authoritative: u64,
    failed_open: u64,
    rejected: u64,
    elapsed_ms: u64,
}

impl Tally {
    /// Record one check. Rejections are counted; any other error aborts.
    fn record(&mut self, outcome: ratewarden::Result<Admission>) -> ratewarden::Result<()> {
        match outcome {
            Ok(admission) => {
                self.admitted += 1;
                match admission {
                    Admission::FastPath => self.fast_path += 1,
                    Admission::Authoritative { .. } => self.authoritative += 1,
                    Admission::FailedOpen => self.failed_open += 1,
                }
            }
            Err(RateLimitError::RateExceeded { .. }) => self.rejected += 1,
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn merge(&mut self, other: Tally) {
        self.admitted += other.admitted;
        self.fast_path += other.fast_path;
        self.authoritative += other.authoritative;
        self.failed_open += other.failed_open;
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Serialize)]
struct BenchReport {
    #[serde(flatten)]
    tally: Tally,
    keys: usize,
    concurrency: usize,
    checks_per_sec: f64,
    fast_path_ratio: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => WardenConfig::from_file(path)?,
        None => WardenConfig::from_env()?,
    };
    if let Some(policy) = cli.failure_policy {
        config.limiter.failure_policy = policy;
    }

    let span = info_span!("ratewarden", instance_id = %config.instance_id);
    run(cli, config).instrument(span).await
}

async fn run(cli: Cli, config: WardenConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratewarden");

    let store: Arc<dyn CounterStore> = match cli.store {
        StoreKind::Redis => Arc::new(RedisCounterStore::connect(&config.store).await?),
        StoreKind::Memory => Arc::new(InMemoryCounterStore::new()),
    };
    let limiter = Arc::new(RateLimiter::with_policy(
        store,
        config.limiter.failure_policy,
    ));
    info!(policy = %limiter.policy(), "Rate limiter initialized");

    match cli.command {
        Command::Check(args) => {
            let limit = resolve_limit(&config, &args);
            let tally = check(&limiter, &limit, args.calls).await?;
            println!("{}", serde_json::to_string_pretty(&tally)?);
        }
        Command::Bench(args) => {
            let report = bench(limiter, &args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Reset { key } => {
            limiter.reset(&key).await?;
            info!(key = %key, "Counter reset");
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Start from the configured limit for the key and apply command-line overrides.
fn resolve_limit(config: &WardenConfig, args: &CheckArgs) -> RateLimitConfig {
    let mut limit = config
        .limit_table()
        .get(&args.key)
        .cloned()
        .unwrap_or_else(|| RateLimitConfig {
            key: args.key.clone(),
            ..RateLimitConfig::default()
        });

    if let Some(bucket_size) = args.bucket_size {
        limit.bucket_size = bucket_size;
    }
    if let Some(rate) = args.rate {
        limit.rate = rate;
    }
    if let Some(time_slice) = args.time_slice {
        limit.time_slice = time_slice;
    }
    limit
}

async fn check(limiter: &RateLimiter, limit: &RateLimitConfig, calls: u64) -> anyhow::Result<Tally> {
    let start = Instant::now();
    let mut tally = Tally::default();

    for _ in 0..calls {
        tally.record(limiter.check_limit(limit).await)?;
    }

    tally.elapsed_ms = start.elapsed().as_millis() as u64;
    Ok(tally)
}

/// Split `calls` across `concurrency` workers. The first `calls % concurrency`
/// workers take one extra check so none are dropped.
fn worker_shares(calls: u64, concurrency: usize) -> Vec<u64> {
    let workers = concurrency.max(1) as u64;
    let base = calls / workers;
    let extra = calls % workers;
    (0..workers).map(|i| base + u64::from(i < extra)).collect()
}

async fn bench(limiter: Arc<RateLimiter>, args: &BenchArgs) -> anyhow::Result<BenchReport> {
    let keys = args.keys.max(1);
    let concurrency = args.concurrency.max(1);
    let shares = worker_shares(args.calls, concurrency);

    info!(calls = args.calls, keys, concurrency, "Starting benchmark");

    let limits: Arc<Vec<RateLimitConfig>> = Arc::new(
        (0..keys)
            .map(|i| {
                RateLimitConfig::new(
                    format!("bench-{}", i),
                    args.bucket_size,
                    args.rate,
                    args.time_slice,
                )
            })
            .collect(),
    );

    let start = Instant::now();
    let workers: Vec<_> = shares
        .into_iter()
        .map(|calls| {
            let limiter = limiter.clone();
            let limits = limits.clone();
            tokio::spawn(async move {
                let mut tally = Tally::default();
                for _ in 0..calls {
                    let index = rand::thread_rng().gen_range(0..limits.len());
                    tally.record(limiter.check_limit(&limits[index]).await)?;
                }
                Ok::<_, RateLimitError>(tally)
            })
        })
        .collect();

    let mut total = Tally::default();
    for result in futures::future::join_all(workers).await {
        total.merge(result??);
    }
    let elapsed = start.elapsed().max(Duration::from_micros(1));
    total.elapsed_ms = elapsed.as_millis() as u64;

    let checks = (total.admitted + total.rejected) as f64;
    Ok(BenchReport {
        checks_per_sec: checks / elapsed.as_secs_f64(),
        fast_path_ratio: if total.admitted == 0 {
            0.0
        } else {
            total.fast_path as f64 / total.admitted as f64
        },
        tally: total,
        keys,
        concurrency,
    })
}
