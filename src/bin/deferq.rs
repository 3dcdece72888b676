//! deferq CLI: run the demo workloads against in-process collaborators.

use clap::{Parser, Subcommand};
use deferq::config::Config;
use deferq::demo;
use deferq::progress::track_progress;
use deferq::services::Services;
use deferq::services::memory::{MemoryLocks, MemoryQueue, MemoryStore};
use deferq::telemetry::{TelemetryConfig, init_telemetry};
use deferq::worker::{PoolConfig, Worker, WorkerPool};
use deferq::{Runner, Value, WorkloadRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "deferq", about = "Deferred-result job fan-out over a work queue")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Run name (defaults to a fresh UUID)
    #[arg(long, global = true)]
    name: Option<String>,
    /// Worker loops (overrides config)
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute the seeded Fibonacci number of n by recursive fan-out
    Fib {
        n: i64,
    },
    /// Take naps in parallel and report the total time slept
    Sleepy {
        /// Number of naps
        #[arg(long, default_value_t = 10)]
        naps: i64,
        /// Length of a long nap in milliseconds
        #[arg(long, default_value_t = 200)]
        nap_ms: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "deferq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let name = cli.name.unwrap_or_else(|| Uuid::new_v4().to_string());
    let (workload, method, args) = match cli.command {
        Command::Fib { n } => (
            demo::fibonacci(config.sleep_time)?,
            "fibonacci",
            vec![Value::Int(n)],
        ),
        Command::Sleepy { naps, nap_ms } => (
            demo::sleepy(config.sleep_time)?,
            "run",
            vec![Value::Int(naps), Value::Int(nap_ms)],
        ),
    };

    let queue = Arc::new(MemoryQueue::new("local"));
    let services = Services::new(
        queue.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLocks::new()),
    );

    let mut registry = WorkloadRegistry::new();
    let workload = registry.register(workload)?;
    let worker =
        Worker::new(Arc::new(registry), services.clone()).lock_timeout(config.lock_timeout);

    let mut pool = WorkerPool::new(
        queue,
        worker,
        PoolConfig {
            workers: config.workers,
            ..PoolConfig::default()
        },
    );
    pool.start();

    let runner = Runner::builder(name, workload, services)
        .lock_timeout(config.lock_timeout)
        .build();
    let job = runner.enqueue(method, args).await?;
    info!(runner = %runner.namespace(), job = %job, "run started");

    let progress = track_progress(&runner, Duration::from_millis(250)).await?;
    pool.shutdown().await;

    let errors = runner.error_count().await?;
    let missing = runner.missing_result_count().await?;
    match runner.result().await? {
        Some(value) => println!("result: {value}"),
        None => println!("result: none"),
    }
    println!(
        "{} jobs, {errors} errors, {missing} missing results",
        progress.total
    );
    Ok(())
}
