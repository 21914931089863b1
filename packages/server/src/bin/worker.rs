// Worker process: claims runs from the shared queue and executes them.
//
// Any number of workers may run against the same database; leases and the
// reaper keep at most one of them driving each run.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use runtime_core::kernel::RuntimeKernel;
use runtime_core::runtime::{AgentRegistry, EchoAgent, WorkerConfig, WorkerLoop};
use runtime_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "worker", about = "Agent runtime worker process")]
struct Args {
    /// Stable worker identity; generated when omitted
    #[arg(long)]
    worker_id: Option<String>,

    /// Max in-flight runs (defaults to the configured worker_concurrency)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Only claim runs for these agent keys (repeatable); empty means all
    #[arg(long = "agent-key")]
    agent_keys: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runtime_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let mut registry = AgentRegistry::new();
    registry.register("echo", Arc::new(EchoAgent));

    let kernel = RuntimeKernel::postgres(pool, config.runtime.clone(), Arc::new(registry));

    let mut worker_config = match args.worker_id {
        Some(worker_id) => WorkerConfig::with_worker_id(worker_id),
        None => WorkerConfig::default(),
    };
    worker_config.concurrency = args
        .concurrency
        .unwrap_or(kernel.settings.worker_concurrency);
    worker_config.agent_keys = args.agent_keys;

    let worker = WorkerLoop::from_kernel(&kernel, worker_config);
    worker.run_until_shutdown().await
}
