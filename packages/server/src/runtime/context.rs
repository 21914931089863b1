//! Run context: the per-execution handle handed to agent callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;
use uuid::Uuid;

use super::bus::EventBus;
use super::checkpoint::CheckpointStore;
use super::event::EventType;
use super::queue::RunQueue;
use super::run::Message;

/// How often `check_cancelled` is allowed to hit the run store.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Per-execution handle exposed to the agent callback.
///
/// Constructed once per attempt by the runner. Event emission is the per-run
/// serialization point: the seq counter and the publish happen under one
/// async mutex, so events from the callback and the heartbeat task interleave
/// without gaps or collisions.
pub struct RunContext {
    run_id: Uuid,
    conversation_id: Option<Uuid>,
    attempt: i32,
    input_messages: Vec<Message>,
    params: serde_json::Value,

    queue: Arc<dyn RunQueue>,
    bus: Arc<dyn EventBus>,
    checkpoints: Arc<dyn CheckpointStore>,

    // Next seq to allocate; seeded from the event store so resumed attempts
    // continue the sequence without collision.
    seq: AsyncMutex<i64>,
    state: AsyncMutex<Option<serde_json::Value>>,

    cancelled: AtomicBool,
    last_cancel_check: Mutex<Option<Instant>>,
    cancel_check_interval: Duration,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: Uuid,
        conversation_id: Option<Uuid>,
        attempt: i32,
        input_messages: Vec<Message>,
        params: serde_json::Value,
        next_seq: i64,
        queue: Arc<dyn RunQueue>,
        bus: Arc<dyn EventBus>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            run_id,
            conversation_id,
            attempt,
            input_messages,
            params,
            queue,
            bus,
            checkpoints,
            seq: AsyncMutex::new(next_seq),
            state: AsyncMutex::new(None),
            cancelled: AtomicBool::new(false),
            last_cancel_check: Mutex::new(None),
            cancel_check_interval: CANCEL_CHECK_INTERVAL,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_cancel_check_interval(mut self, interval: Duration) -> Self {
        self.cancel_check_interval = interval;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.conversation_id
    }

    pub fn attempt(&self) -> i32 {
        self.attempt
    }

    pub fn input_messages(&self) -> &[Message] {
        &self.input_messages
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Emit an event under the next sequence number.
    ///
    /// A rejected publish is a fatal infrastructure error for the attempt;
    /// the seq counter is only advanced once the publish lands.
    pub async fn emit(&self, event_type: &str, payload: serde_json::Value) -> Result<i64> {
        let mut seq = self.seq.lock().await;
        let event = super::event::RunEvent::new(self.run_id, *seq, event_type, payload);
        self.bus.publish(event).await?;
        let allocated = *seq;
        *seq += 1;
        Ok(allocated)
    }

    /// Persist a state snapshot and announce it on the event log.
    pub async fn checkpoint(&self, state: serde_json::Value) -> Result<()> {
        let seq = self.checkpoints.save(self.run_id, &state).await?;
        *self.state.lock().await = Some(state);
        self.emit(
            EventType::StateCheckpoint.as_str(),
            serde_json::json!({"seq": seq}),
        )
        .await?;
        Ok(())
    }

    /// The last checkpointed state, lazily loaded on first call.
    pub async fn get_state(&self) -> Result<Option<serde_json::Value>> {
        let mut cached = self.state.lock().await;
        if cached.is_none() {
            *cached = self.checkpoints.latest(self.run_id).await?;
        }
        Ok(cached.clone())
    }

    /// Cheap, non-blocking read of the cached cancellation flag.
    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Refresh the cancellation flag from the run store, rate-limited.
    ///
    /// Long-running callback work should call this between subtasks;
    /// cooperative cancellation is the only model.
    pub async fn check_cancelled(&self) -> bool {
        let due = {
            let mut last = self.last_cancel_check.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            match *last {
                Some(at) if now.duration_since(at) < self.cancel_check_interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };

        if due {
            match self.queue.is_cancelled(self.run_id).await {
                Ok(cancelled) => {
                    if cancelled {
                        self.cancelled.store(true, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    warn!(run_id = %self.run_id, error = %e, "cancellation check failed");
                }
            }
        }

        self.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::stream_hub::StreamHub;
    use crate::runtime::memory::{InMemoryCheckpointStore, InMemoryEventBus, InMemoryRunQueue};
    use crate::runtime::queue::SubmitResult;
    use crate::runtime::run::Run;

    struct Fixture {
        queue: Arc<InMemoryRunQueue>,
        bus: Arc<InMemoryEventBus>,
        checkpoints: Arc<InMemoryCheckpointStore>,
        run: Run,
    }

    async fn fixture() -> Fixture {
        let queue = Arc::new(InMemoryRunQueue::new(Duration::from_secs(30)));
        let bus = Arc::new(InMemoryEventBus::new(StreamHub::new(), false));
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());

        let run = match queue
            .submit(Run::builder().agent_key("echo").build())
            .await
            .unwrap()
        {
            SubmitResult::Created(run) => run,
            SubmitResult::Duplicate(run) => run,
        };

        Fixture {
            queue,
            bus,
            checkpoints,
            run,
        }
    }

    fn context(f: &Fixture, next_seq: i64) -> RunContext {
        RunContext::new(
            f.run.id,
            None,
            f.run.attempt,
            vec![],
            serde_json::json!({}),
            next_seq,
            f.queue.clone(),
            f.bus.clone(),
            f.checkpoints.clone(),
        )
    }

    #[tokio::test]
    async fn emit_allocates_contiguous_seqs() {
        let f = fixture().await;
        let ctx = context(&f, 0);

        assert_eq!(ctx.emit("run.started", serde_json::json!({})).await.unwrap(), 0);
        assert_eq!(
            ctx.emit("assistant.message", serde_json::json!({}))
                .await
                .unwrap(),
            1
        );

        let events = f.bus.get_events(f.run.id, 0, None).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn seq_counter_resumes_where_the_log_left_off() {
        let f = fixture().await;
        let ctx = context(&f, 0);
        ctx.emit("run.started", serde_json::json!({})).await.unwrap();

        // Second attempt seeds from the store.
        let next = f.bus.next_seq(f.run.id).await.unwrap();
        let resumed = context(&f, next);
        assert_eq!(
            resumed
                .emit("run.started", serde_json::json!({}))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn checkpoint_saves_state_and_emits_event() {
        let f = fixture().await;
        let ctx = context(&f, 0);

        ctx.checkpoint(serde_json::json!({"step": 3})).await.unwrap();

        let latest = f.checkpoints.latest(f.run.id).await.unwrap().unwrap();
        assert_eq!(latest["step"], 3);

        let events = f.bus.get_events(f.run.id, 0, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "state.checkpoint");
        assert_eq!(events[0].payload["seq"], 0);
    }

    #[tokio::test]
    async fn get_state_loads_latest_checkpoint_lazily() {
        let f = fixture().await;
        f.checkpoints
            .save(f.run.id, &serde_json::json!({"resume": true}))
            .await
            .unwrap();

        let ctx = context(&f, 0);
        let state = ctx.get_state().await.unwrap().unwrap();
        assert_eq!(state["resume"], true);
    }

    #[tokio::test]
    async fn check_cancelled_observes_the_store() {
        let f = fixture().await;
        f.queue.claim("worker-1", &[], 1).await.unwrap();
        let ctx = context(&f, 0).with_cancel_check_interval(Duration::from_millis(0));

        assert!(!ctx.check_cancelled().await);

        f.queue.cancel(f.run.id).await.unwrap();
        assert!(ctx.check_cancelled().await);
        // Flag stays set.
        assert!(ctx.cancelled());
    }

    #[tokio::test]
    async fn check_cancelled_is_rate_limited() {
        let f = fixture().await;
        f.queue.claim("worker-1", &[], 1).await.unwrap();
        let ctx = context(&f, 0);

        assert!(!ctx.check_cancelled().await);
        f.queue.cancel(f.run.id).await.unwrap();
        // Inside the rate-limit window the cached flag is returned.
        assert!(!ctx.check_cancelled().await);
    }
}
