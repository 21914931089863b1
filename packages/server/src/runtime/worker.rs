//! Worker loop: a long-lived service that claims runs and drives them.
//!
//! The loop keeps a bounded set of in-flight runs, claims up to its spare
//! capacity each poll, and periodically reaps expired leases. Every worker
//! runs the reaper; the reap statement is atomic, so concurrent reapers
//! degrade to no-ops. On shutdown it stops claiming and drains in-flight
//! runs for a bounded grace period; anything left keeps its lease until a
//! surviving worker reaps it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::kernel::RuntimeKernel;

use super::queue::RunQueue;
use super::runner::Runner;

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity stamped into leases.
    pub worker_id: String,
    /// Max in-flight runs.
    pub concurrency: usize,
    /// Only claim runs for these agent keys; empty means all.
    pub agent_keys: Vec<String>,
    /// How often to look for claimable runs.
    pub poll_interval: Duration,
    /// How often to reap expired leases.
    pub reap_interval: Duration,
    /// How long to wait for in-flight runs on shutdown.
    pub graceful_shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 10,
            agent_keys: Vec::new(),
            poll_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(5),
            graceful_shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Long-running service that polls the queue and dispatches runs.
pub struct WorkerLoop {
    runner: Arc<Runner>,
    queue: Arc<dyn RunQueue>,
    config: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(runner: Arc<Runner>, queue: Arc<dyn RunQueue>, config: WorkerConfig) -> Self {
        Self {
            runner,
            queue,
            config,
        }
    }

    /// Wire a worker against a kernel's queue/bus/checkpoints/registry.
    pub fn from_kernel(kernel: &Arc<RuntimeKernel>, config: WorkerConfig) -> Self {
        let runner = Arc::new(Runner::new(
            config.worker_id.clone(),
            kernel.queue.clone(),
            kernel.bus.clone(),
            kernel.checkpoints.clone(),
            kernel.registry.clone(),
            kernel.settings.clone(),
        ));
        Self::new(runner, kernel.queue.clone(), config)
    }

    /// Run until the shutdown token fires, then drain.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "worker starting"
        );

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut reap = tokio::time::interval(self.config.reap_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = reap.tick() => {
                    if let Err(e) = self.queue.reap_expired().await {
                        error!(error = %e, "failed to reap expired leases");
                    }
                }

                _ = poll.tick() => {
                    let capacity = self.config.concurrency.saturating_sub(in_flight.len());
                    if capacity == 0 {
                        continue;
                    }

                    let claimed = match self
                        .queue
                        .claim(&self.config.worker_id, &self.config.agent_keys, capacity as i64)
                        .await
                    {
                        Ok(runs) => runs,
                        Err(e) => {
                            error!(error = %e, "failed to claim runs");
                            continue;
                        }
                    };

                    if !claimed.is_empty() {
                        debug!(count = claimed.len(), "claimed runs");
                    }

                    for run in claimed {
                        let runner = self.runner.clone();
                        in_flight.spawn(async move {
                            runner.run_once(run).await;
                        });
                    }
                }

                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    // run_once never errors; a join error here is a panic in
                    // the run task, which is a bug worth logging loudly.
                    if let Err(e) = result {
                        error!(error = %e, "run task panicked");
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(
                count = in_flight.len(),
                "waiting for in-flight runs to finish"
            );
            let drain = async {
                while in_flight.join_next().await.is_some() {}
            };
            if tokio::time::timeout(self.config.graceful_shutdown_timeout, drain)
                .await
                .is_err()
            {
                warn!("graceful shutdown timed out; abandoning remaining runs to the reaper");
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Run until a Ctrl+C signal is received.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            signal_token.cancel();
        });

        self.run(shutdown).await
    }
}
