//! Runner: drives one claimed run end-to-end.
//!
//! # Per-run procedure
//!
//! ```text
//! run_once(claimed)
//!     ├─► resolve agent by key (missing → FAILED, non-retriable)
//!     ├─► build RunContext, emit run.started
//!     ├─► spawn heartbeat task (extend_lease + run.heartbeat + cancel refresh)
//!     ├─► drive Agent::run(ctx) under the wall-clock deadline
//!     └─► classify the exit:
//!           success   → run.succeeded, release SUCCEEDED
//!           cancelled → run.cancelled, release CANCELLED
//!           deadline  → run.timed_out, release TIMED_OUT
//!           lease lost→ abandon silently; the reaper re-queues
//!           error     → on_error classification, requeue with backoff
//!                       or run.failed + release FAILED
//! ```
//!
//! No error escapes `run_once`; the worker loop treats a panic here as a bug.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RuntimeSettings;

use super::bus::EventBus;
use super::checkpoint::CheckpointStore;
use super::context::RunContext;
use super::error::{ErrorInfo, ErrorKind};
use super::event::{EventType, RunEvent};
use super::queue::{backoff_delay, RunOutcome, RunQueue};
use super::registry::{AgentRegistry, RunResult};
use super::run::Run;

enum AttemptExit {
    Success(RunResult),
    Cancelled,
    TimedOut,
    LeaseLost,
    Error(anyhow::Error),
}

/// Executes claimed runs on behalf of one worker.
pub struct Runner {
    worker_id: String,
    queue: Arc<dyn RunQueue>,
    bus: Arc<dyn EventBus>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<AgentRegistry>,
    settings: RuntimeSettings,
}

impl Runner {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<dyn RunQueue>,
        bus: Arc<dyn EventBus>,
        checkpoints: Arc<dyn CheckpointStore>,
        registry: Arc<AgentRegistry>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            bus,
            checkpoints,
            registry,
            settings,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute a single claimed run. Never returns an error; every outcome
    /// is recorded against the run itself.
    pub async fn run_once(&self, run: Run) {
        let run_id = run.id;
        info!(
            run_id = %run_id,
            agent_key = %run.agent_key,
            attempt = run.attempt,
            "starting run"
        );

        let agent = match self.registry.get(&run.agent_key) {
            Some(agent) => agent,
            None => {
                let error = ErrorInfo::new(
                    ErrorKind::AgentNotFound,
                    format!("no agent registered for key '{}'", run.agent_key),
                );
                self.fail_without_context(run_id, error).await;
                return;
            }
        };

        let ctx = match self.build_context(&run).await {
            Ok(ctx) => Arc::new(ctx),
            Err(BuildContextError::BadInput(error)) => {
                self.fail_without_context(run_id, error).await;
                return;
            }
            Err(BuildContextError::Infrastructure(e)) => {
                error!(run_id = %run_id, error = %e, "failed to build run context");
                self.retry_or_fail(&run, None, ErrorInfo::infrastructure(&e))
                    .await;
                return;
            }
        };

        if let Err(e) = ctx
            .emit(
                EventType::RunStarted.as_str(),
                serde_json::json!({
                    "agent_key": run.agent_key,
                    "attempt": run.attempt,
                }),
            )
            .await
        {
            error!(run_id = %run_id, error = %e, "failed to emit run.started");
            self.retry_or_fail(&run, Some(&ctx), ErrorInfo::infrastructure(&e))
                .await;
            return;
        }

        // Heartbeat task: renews the lease and refreshes the cancel flag. If
        // the lease cannot be renewed the attempt must be abandoned.
        let heartbeat_stop = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let heartbeat = {
            let queue = self.queue.clone();
            let worker_id = self.worker_id.clone();
            let ctx = ctx.clone();
            let stop = heartbeat_stop.clone();
            let lost = lease_lost.clone();
            let lease_ttl = self.settings.lease_ttl;
            let heartbeat_interval = self.settings.heartbeat_interval;

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(heartbeat_interval);
                interval.tick().await; // Skip first immediate tick

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            match queue.extend_lease(run_id, &worker_id, lease_ttl).await {
                                Ok(true) => {
                                    if let Err(e) = ctx
                                        .emit(EventType::RunHeartbeat.as_str(), serde_json::json!({}))
                                        .await
                                    {
                                        warn!(run_id = %run_id, error = %e, "heartbeat emit failed");
                                    }
                                    ctx.check_cancelled().await;
                                }
                                Ok(false) => {
                                    warn!(run_id = %run_id, worker_id = %worker_id, "lost lease");
                                    lost.cancel();
                                    break;
                                }
                                Err(e) => {
                                    warn!(run_id = %run_id, error = %e, "lease extension errored");
                                }
                            }
                        }
                    }
                }
            })
        };

        let exit = tokio::select! {
            _ = lease_lost.cancelled() => AttemptExit::LeaseLost,
            result = tokio::time::timeout(self.settings.run_timeout, agent.run(ctx.as_ref())) => {
                match result {
                    Err(_) => AttemptExit::TimedOut,
                    Ok(Ok(run_result)) => {
                        if ctx.cancelled() {
                            AttemptExit::Cancelled
                        } else {
                            AttemptExit::Success(run_result)
                        }
                    }
                    // Terminal is CANCELLED regardless of how the callback
                    // exited once cancellation was observed.
                    Ok(Err(e)) => {
                        if ctx.cancelled() {
                            AttemptExit::Cancelled
                        } else {
                            AttemptExit::Error(e)
                        }
                    }
                }
            }
        };

        // Guaranteed on all exit paths.
        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        match exit {
            AttemptExit::Success(run_result) => self.handle_success(&run, &ctx, run_result).await,
            AttemptExit::Cancelled => self.handle_cancellation(&run, &ctx).await,
            AttemptExit::TimedOut => self.handle_timeout(&run, &ctx).await,
            AttemptExit::LeaseLost => {
                // Another owner may already be driving this run; emit nothing.
                warn!(run_id = %run_id, "abandoning run after lease loss");
            }
            AttemptExit::Error(e) => {
                warn!(run_id = %run_id, error = %e, "run attempt failed");
                let classified = agent
                    .on_error(&ctx, &e)
                    .await
                    .unwrap_or_else(|| ErrorInfo::from_callback_error(&e));
                self.retry_or_fail(&run, Some(&ctx), classified).await;
            }
        }
    }

    async fn build_context(&self, run: &Run) -> Result<RunContext, BuildContextError> {
        let messages = run.input_messages().map_err(|e| {
            BuildContextError::BadInput(
                ErrorInfo::new(ErrorKind::ValidationError, e.to_string()).with_retriable(false),
            )
        })?;
        let params = run.input_params();
        let next_seq = self
            .bus
            .next_seq(run.id)
            .await
            .map_err(BuildContextError::Infrastructure)?;

        Ok(RunContext::new(
            run.id,
            run.conversation_id,
            run.attempt,
            messages,
            params,
            next_seq,
            self.queue.clone(),
            self.bus.clone(),
            self.checkpoints.clone(),
        ))
    }

    async fn handle_success(&self, run: &Run, ctx: &RunContext, result: RunResult) {
        info!(run_id = %run.id, attempt = run.attempt, "run succeeded");

        if let Err(e) = ctx
            .emit(
                EventType::RunSucceeded.as_str(),
                serde_json::json!({
                    "output": result.final_output,
                    "usage": result.usage,
                }),
            )
            .await
        {
            error!(run_id = %run.id, error = %e, "failed to emit run.succeeded");
            self.retry_or_fail(run, Some(ctx), ErrorInfo::infrastructure(&e))
                .await;
            return;
        }

        let released = self
            .queue
            .release(
                run.id,
                &self.worker_id,
                RunOutcome::Succeeded {
                    output: result.to_output_json(),
                },
            )
            .await;
        match released {
            Ok(true) => {}
            Ok(false) => warn!(run_id = %run.id, "lease gone before release; result dropped"),
            Err(e) => error!(run_id = %run.id, error = %e, "failed to release run"),
        }
    }

    async fn handle_timeout(&self, run: &Run, ctx: &RunContext) {
        let timeout_seconds = self.settings.run_timeout.as_secs_f64();
        warn!(run_id = %run.id, timeout_seconds, "run timed out");

        if let Err(e) = ctx
            .emit(
                EventType::RunTimedOut.as_str(),
                serde_json::json!({"timeout_seconds": timeout_seconds}),
            )
            .await
        {
            error!(run_id = %run.id, error = %e, "failed to emit run.timed_out");
        }

        let error = ErrorInfo::timeout(self.settings.run_timeout.as_secs());
        if let Err(e) = self
            .queue
            .release(run.id, &self.worker_id, RunOutcome::TimedOut { error })
            .await
        {
            error!(run_id = %run.id, error = %e, "failed to release timed-out run");
        }
    }

    async fn handle_cancellation(&self, run: &Run, ctx: &RunContext) {
        info!(run_id = %run.id, "run cancelled");

        if let Err(e) = ctx
            .emit(EventType::RunCancelled.as_str(), serde_json::json!({}))
            .await
        {
            error!(run_id = %run.id, error = %e, "failed to emit run.cancelled");
        }

        if let Err(e) = self
            .queue
            .release(run.id, &self.worker_id, RunOutcome::Cancelled)
            .await
        {
            error!(run_id = %run.id, error = %e, "failed to release cancelled run");
        }
    }

    /// Requeue with backoff when the error is retriable and attempts remain;
    /// otherwise emit `run.failed` and release as FAILED.
    async fn retry_or_fail(&self, run: &Run, ctx: Option<&RunContext>, error: ErrorInfo) {
        if error.retriable {
            let delay = backoff_delay(
                self.settings.retry_backoff_base,
                run.attempt,
                self.settings.retry_backoff_max,
            );
            match self
                .queue
                .requeue_for_retry(run.id, &self.worker_id, &error, delay)
                .await
            {
                Ok(true) => {
                    info!(
                        run_id = %run.id,
                        attempt = run.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "run requeued for retry"
                    );
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "failed to requeue run");
                }
            }
        }

        let payload = serde_json::json!({"error": error.to_json()});
        let emitted = match ctx {
            Some(ctx) => ctx.emit(EventType::RunFailed.as_str(), payload).await.map(|_| ()),
            None => self.emit_raw(run.id, EventType::RunFailed, payload).await,
        };
        if let Err(e) = emitted {
            error!(run_id = %run.id, error = %e, "failed to emit run.failed");
        }

        if let Err(e) = self
            .queue
            .release(run.id, &self.worker_id, RunOutcome::Failed { error })
            .await
        {
            error!(run_id = %run.id, error = %e, "failed to release failed run");
        }
    }

    /// Terminal failure for runs that never got a context (unknown agent,
    /// malformed input).
    async fn fail_without_context(&self, run_id: Uuid, error: ErrorInfo) {
        warn!(run_id = %run_id, kind = ?error.kind, message = %error.message, "failing run");

        if let Err(e) = self
            .emit_raw(
                run_id,
                EventType::RunFailed,
                serde_json::json!({"error": error.to_json()}),
            )
            .await
        {
            error!(run_id = %run_id, error = %e, "failed to emit run.failed");
        }

        if let Err(e) = self
            .queue
            .release(run_id, &self.worker_id, RunOutcome::Failed { error })
            .await
        {
            error!(run_id = %run_id, error = %e, "failed to release run");
        }
    }

    /// One-off emit outside any context: allocates the next seq directly.
    async fn emit_raw(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        let seq = self.bus.next_seq(run_id).await?;
        self.bus
            .publish(RunEvent::new(run_id, seq, event_type.as_str(), payload))
            .await
    }
}

enum BuildContextError {
    BadInput(ErrorInfo),
    Infrastructure(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::kernel::stream_hub::StreamHub;
    use crate::runtime::memory::{InMemoryCheckpointStore, InMemoryEventBus, InMemoryRunQueue};
    use crate::runtime::registry::{Agent, EchoAgent};
    use crate::runtime::run::{Message, Run, RunStatus};

    struct Harness {
        queue: Arc<InMemoryRunQueue>,
        bus: Arc<InMemoryEventBus>,
        checkpoints: Arc<InMemoryCheckpointStore>,
        registry: AgentRegistry,
        settings: RuntimeSettings,
    }

    impl Harness {
        fn new() -> Self {
            let settings = RuntimeSettings {
                lease_ttl: Duration::from_secs(5),
                heartbeat_interval: Duration::from_millis(20),
                run_timeout: Duration::from_secs(30),
                ..Default::default()
            };
            Self {
                queue: Arc::new(InMemoryRunQueue::new(settings.lease_ttl)),
                bus: Arc::new(InMemoryEventBus::new(StreamHub::new(), false)),
                checkpoints: Arc::new(InMemoryCheckpointStore::new()),
                registry: AgentRegistry::new(),
                settings,
            }
        }

        fn runner(self) -> (Runner, Arc<InMemoryRunQueue>, Arc<InMemoryEventBus>) {
            let queue = self.queue.clone();
            let bus = self.bus.clone();
            let runner = Runner::new(
                "worker-1",
                self.queue,
                self.bus,
                self.checkpoints,
                Arc::new(self.registry),
                self.settings,
            );
            (runner, queue, bus)
        }
    }

    fn echo_run() -> Run {
        Run::builder()
            .agent_key("echo")
            .input(Run::input_from(
                &[Message::user("hi")],
                &serde_json::json!({}),
            ))
            .build()
    }

    async fn submit_and_claim(queue: &InMemoryRunQueue, run: Run) -> Run {
        queue.submit(run).await.unwrap().into_run();
        queue
            .claim("worker-1", &[], 1)
            .await
            .unwrap()
            .pop()
            .expect("run should be claimable")
    }

    #[tokio::test]
    async fn happy_path_produces_three_ordered_events() {
        let mut harness = Harness::new();
        harness.registry.register("echo", Arc::new(EchoAgent));
        let (runner, queue, bus) = harness.runner();

        let claimed = submit_and_claim(&queue, echo_run()).await;
        let run_id = claimed.id;
        runner.run_once(claimed).await;

        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.attempt, 1);
        assert_eq!(run.output.as_ref().unwrap()["final_output"]["text"], "hi");
        assert!(!run.is_leased());

        let events = bus.get_events(run_id, 0, None).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["run.started", "assistant.message", "run.succeeded"]
        );
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    struct FlakyAgent {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        async fn run(&self, _ctx: &RunContext) -> anyhow::Result<RunResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("transient upstream failure"))
            } else {
                Ok(RunResult::from_output(serde_json::json!({"ok": true})))
            }
        }
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let mut harness = Harness::new();
        harness.registry.register(
            "flaky",
            Arc::new(FlakyAgent {
                calls: AtomicU32::new(0),
            }),
        );
        let (runner, queue, bus) = harness.runner();

        let claimed = submit_and_claim(&queue, Run::builder().agent_key("flaky").build()).await;
        let run_id = claimed.id;

        // Attempt 1 fails and is requeued with backoff.
        runner.run_once(claimed).await;
        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.attempt, 2);

        // Attempt 2 succeeds.
        queue.clear_backoff(run_id);
        let reclaimed = queue.claim("worker-1", &[], 1).await.unwrap().pop().unwrap();
        runner.run_once(reclaimed).await;

        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.attempt, 2);

        // Two run.started events with non-overlapping seq ranges; exactly one
        // terminal event, and it is last.
        let events = bus.get_events(run_id, 0, None).await.unwrap();
        let started: Vec<i64> = events
            .iter()
            .filter(|e| e.event_type == "run.started")
            .map(|e| e.seq)
            .collect();
        assert_eq!(started.len(), 2);
        assert!(started[0] < started[1]);

        let terminals: Vec<&RunEvent> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].event_type, "run.succeeded");
        assert_eq!(terminals[0].seq, events.last().unwrap().seq);
    }

    struct AlwaysFailsAgent;

    #[async_trait]
    impl Agent for AlwaysFailsAgent {
        async fn run(&self, _ctx: &RunContext) -> anyhow::Result<RunResult> {
            Err(anyhow!("permanent grief"))
        }
    }

    #[tokio::test]
    async fn exhausted_retries_fail_without_requeue() {
        let mut harness = Harness::new();
        harness.registry.register("fails", Arc::new(AlwaysFailsAgent));
        let (runner, queue, bus) = harness.runner();

        let mut run = Run::builder().agent_key("fails").build();
        run.max_attempts = 1;
        let claimed = submit_and_claim(&queue, run).await;
        let run_id = claimed.id;

        runner.run_once(claimed).await;

        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.attempt, 1);
        assert_eq!(run.error_info().unwrap().kind, ErrorKind::CallbackError);

        let events = bus.get_events(run_id, 0, None).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "run.failed");
    }

    struct NonRetriableAgent;

    #[async_trait]
    impl Agent for NonRetriableAgent {
        async fn run(&self, _ctx: &RunContext) -> anyhow::Result<RunResult> {
            Err(anyhow!("bad request upstream"))
        }

        async fn on_error(&self, _ctx: &RunContext, error: &anyhow::Error) -> Option<ErrorInfo> {
            Some(ErrorInfo::new(ErrorKind::CallbackError, error.to_string()).with_retriable(false))
        }
    }

    #[tokio::test]
    async fn on_error_classification_can_veto_retry() {
        let mut harness = Harness::new();
        harness
            .registry
            .register("nonretriable", Arc::new(NonRetriableAgent));
        let (runner, queue, _bus) = harness.runner();

        let claimed =
            submit_and_claim(&queue, Run::builder().agent_key("nonretriable").build()).await;
        let run_id = claimed.id;

        runner.run_once(claimed).await;

        let run = queue.get(run_id).await.unwrap().unwrap();
        // Attempts remained, but the classifier said no.
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.attempt, 1);
    }

    struct SleepyAgent;

    #[async_trait]
    impl Agent for SleepyAgent {
        async fn run(&self, _ctx: &RunContext) -> anyhow::Result<RunResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(RunResult::default())
        }
    }

    #[tokio::test]
    async fn deadline_expiry_times_out_without_retry() {
        let mut harness = Harness::new();
        harness.settings.run_timeout = Duration::from_millis(100);
        harness.registry.register("sleepy", Arc::new(SleepyAgent));
        let (runner, queue, bus) = harness.runner();

        let claimed = submit_and_claim(&queue, Run::builder().agent_key("sleepy").build()).await;
        let run_id = claimed.id;

        runner.run_once(claimed).await;

        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::TimedOut);
        assert_eq!(run.error_info().unwrap().kind, ErrorKind::Timeout);

        let events = bus.get_events(run_id, 0, None).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "run.timed_out");
    }

    struct CooperativeAgent;

    #[async_trait]
    impl Agent for CooperativeAgent {
        async fn run(&self, ctx: &RunContext) -> anyhow::Result<RunResult> {
            while !ctx.check_cancelled().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(RunResult::default())
        }
    }

    #[tokio::test]
    async fn cancellation_is_observed_cooperatively() {
        let mut harness = Harness::new();
        harness
            .registry
            .register("cooperative", Arc::new(CooperativeAgent));
        let (runner, queue, bus) = harness.runner();

        let claimed =
            submit_and_claim(&queue, Run::builder().agent_key("cooperative").build()).await;
        let run_id = claimed.id;

        // Cancel while RUNNING: cooperative observation on the next check.
        queue.cancel(run_id).await.unwrap();
        runner.run_once(claimed).await;

        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.finished_at.is_some());

        let events = bus.get_events(run_id, 0, None).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, "run.cancelled");
    }

    #[tokio::test]
    async fn unknown_agent_key_fails_terminally() {
        let harness = Harness::new();
        let (runner, queue, bus) = harness.runner();

        let claimed = submit_and_claim(&queue, Run::builder().agent_key("ghost").build()).await;
        let run_id = claimed.id;

        runner.run_once(claimed).await;

        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_info().unwrap().kind, ErrorKind::AgentNotFound);
        assert!(!run.error_info().unwrap().retriable);

        let events = bus.get_events(run_id, 0, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run.failed");
    }

    #[tokio::test]
    async fn lease_loss_abandons_the_attempt_silently() {
        let mut harness = Harness::new();
        harness.settings.heartbeat_interval = Duration::from_millis(20);
        harness.registry.register("sleepy", Arc::new(SleepyAgent));
        let (runner, queue, bus) = harness.runner();

        let claimed = submit_and_claim(&queue, Run::builder().agent_key("sleepy").build()).await;
        let run_id = claimed.id;

        let handle = {
            let runner = Arc::new(runner);
            let runner_task = runner.clone();
            tokio::spawn(async move { runner_task.run_once(claimed).await })
        };

        // Let run.started land, then steal the lease the way a reaper would.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.force_expire_lease(run_id);
        assert_eq!(queue.reap_expired().await.unwrap(), 1);

        handle.await.unwrap();

        // The old owner emitted nothing after losing the lease; the run is
        // queued for the next attempt.
        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.attempt, 2);

        let events = bus.get_events(run_id, 0, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run.started");
    }

    struct CheckpointingAgent;

    #[async_trait]
    impl Agent for CheckpointingAgent {
        async fn run(&self, ctx: &RunContext) -> anyhow::Result<RunResult> {
            // Resume from the previous attempt's snapshot when present.
            let start = ctx
                .get_state()
                .await?
                .and_then(|s| s.get("progress").and_then(|p| p.as_i64()))
                .unwrap_or(0);

            if start == 0 {
                ctx.checkpoint(serde_json::json!({"progress": 1})).await?;
                return Err(anyhow!("interrupted after checkpoint"));
            }

            Ok(RunResult::from_output(serde_json::json!({"resumed_from": start})))
        }
    }

    #[tokio::test]
    async fn resumed_attempt_reads_checkpoint_and_continues_seq() {
        let mut harness = Harness::new();
        harness
            .registry
            .register("checkpointing", Arc::new(CheckpointingAgent));
        let (runner, queue, bus) = harness.runner();

        let claimed =
            submit_and_claim(&queue, Run::builder().agent_key("checkpointing").build()).await;
        let run_id = claimed.id;

        runner.run_once(claimed).await;
        queue.clear_backoff(run_id);
        let reclaimed = queue.claim("worker-1", &[], 1).await.unwrap().pop().unwrap();
        runner.run_once(reclaimed).await;

        let run = queue.get(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.output.unwrap()["final_output"]["resumed_from"], 1);

        // The whole log is one contiguous seq range across both attempts.
        let events = bus.get_events(run_id, 0, None).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..events.len() as i64).collect::<Vec<i64>>());
    }
}
