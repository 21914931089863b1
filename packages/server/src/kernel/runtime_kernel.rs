use std::sync::Arc;

use sqlx::PgPool;

use crate::config::RuntimeSettings;
use crate::kernel::stream_hub::StreamHub;
use crate::runtime::bus::{EventBus, PostgresEventBus};
use crate::runtime::checkpoint::{CheckpointStore, PostgresCheckpointStore};
use crate::runtime::memory::{InMemoryCheckpointStore, InMemoryEventBus, InMemoryRunQueue};
use crate::runtime::queue::{PostgresRunQueue, RunQueue};
use crate::runtime::registry::AgentRegistry;

/// Holds the engine's shared infrastructure.
///
/// Built once at startup; the API layer, the worker loop, and the runner all
/// receive the same instance.
pub struct RuntimeKernel {
    pub db_pool: Option<PgPool>,
    pub stream_hub: StreamHub,
    pub settings: RuntimeSettings,
    pub queue: Arc<dyn RunQueue>,
    pub bus: Arc<dyn EventBus>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub registry: Arc<AgentRegistry>,
}

impl RuntimeKernel {
    /// Production wiring: every store backed by Postgres, live events fanned
    /// out through the in-process stream hub.
    pub fn postgres(
        db_pool: PgPool,
        settings: RuntimeSettings,
        registry: Arc<AgentRegistry>,
    ) -> Arc<Self> {
        let stream_hub = StreamHub::new();
        let queue: Arc<dyn RunQueue> = Arc::new(PostgresRunQueue::new(
            db_pool.clone(),
            settings.lease_ttl,
        ));
        let bus: Arc<dyn EventBus> = Arc::new(PostgresEventBus::new(
            db_pool.clone(),
            stream_hub.clone(),
            settings.persist_token_deltas,
        ));
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(PostgresCheckpointStore::new(db_pool.clone()));

        Arc::new(Self {
            db_pool: Some(db_pool),
            stream_hub,
            settings,
            queue,
            bus,
            checkpoints,
            registry,
        })
    }

    /// Fully in-memory wiring for single-process deployments and tests.
    pub fn in_memory(settings: RuntimeSettings, registry: Arc<AgentRegistry>) -> Arc<Self> {
        let stream_hub = StreamHub::new();
        let queue: Arc<dyn RunQueue> = Arc::new(InMemoryRunQueue::new(settings.lease_ttl));
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new(
            stream_hub.clone(),
            settings.persist_token_deltas,
        ));
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

        Arc::new(Self {
            db_pool: None,
            stream_hub,
            settings,
            queue,
            bus,
            checkpoints,
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    use crate::runtime::registry::EchoAgent;
    use crate::runtime::run::{Message, Run, RunStatus};
    use crate::runtime::worker::{WorkerConfig, WorkerLoop};

    #[tokio::test]
    async fn in_memory_kernel_executes_a_run_end_to_end() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", Arc::new(EchoAgent));
        let kernel = RuntimeKernel::in_memory(RuntimeSettings::default(), Arc::new(registry));

        let run = kernel
            .queue
            .submit(
                Run::builder()
                    .agent_key("echo")
                    .input(Run::input_from(
                        &[Message::user("ping")],
                        &serde_json::json!({}),
                    ))
                    .build(),
            )
            .await
            .unwrap()
            .into_run();

        // Subscribe before the worker picks the run up; the stream must see
        // the full history through the terminal event.
        let mut stream = kernel.bus.subscribe(run.id, 0).await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = WorkerLoop::from_kernel(
            &kernel,
            WorkerConfig {
                worker_id: "kernel-test-worker".to_string(),
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        let mut types = Vec::new();
        while let Some(event) = stream.next().await {
            types.push(event.event_type.clone());
        }
        assert_eq!(
            types,
            vec!["run.started", "assistant.message", "run.succeeded"]
        );

        let finished = kernel.queue.get(run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(
            finished.output.unwrap()["final_output"]["text"],
            "ping"
        );

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
