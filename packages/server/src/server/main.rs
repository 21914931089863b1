// Main entry point for the agent runtime API server

use std::sync::Arc;

use anyhow::{Context, Result};
use runtime_core::kernel::RuntimeKernel;
use runtime_core::runtime::{AgentRegistry, EchoAgent, WorkerConfig, WorkerLoop};
use runtime_core::server::build_app;
use runtime_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runtime_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Agent Runtime API");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Agent callbacks are registered once at startup.
    let mut registry = AgentRegistry::new();
    registry.register("echo", Arc::new(EchoAgent));

    let kernel = RuntimeKernel::postgres(pool, config.runtime.clone(), Arc::new(registry));

    // Optionally run a worker inside the API process (small deployments).
    if std::env::var("AGENT_RUNTIME_EMBED_WORKER").as_deref() == Ok("true") {
        let worker_config = WorkerConfig {
            concurrency: kernel.settings.worker_concurrency,
            ..Default::default()
        };
        tracing::info!(worker_id = %worker_config.worker_id, "starting embedded worker");
        let worker = WorkerLoop::from_kernel(&kernel, worker_config);
        tokio::spawn(worker.run(CancellationToken::new()));
    }

    // Build application
    let app = build_app(kernel, None);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
