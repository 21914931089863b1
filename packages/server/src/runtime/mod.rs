//! The run execution core.
//!
//! # Architecture
//!
//! ```text
//! API submit ─► RunQueue (queued row)
//!                  │
//! WorkerLoop ──► claim (SKIP LOCKED, lease stamped)
//!                  │
//!              Runner::run_once
//!                  ├─► RunContext (emit / checkpoint / cancellation)
//!                  ├─► heartbeat task (extend_lease, run.heartbeat)
//!                  ├─► Agent::run(ctx) under the wall-clock deadline
//!                  └─► release / requeue_for_retry
//!                  │
//!              EventBus ─► event store + StreamHub ─► SSE subscribers
//! ```
//!
//! Every mutation of a run row is a single atomic statement; cross-worker
//! safety reduces to the queue's claim/extend/release/requeue/reap SQL.

pub mod bus;
pub mod checkpoint;
pub mod context;
pub mod conversation;
pub mod error;
pub mod event;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod run;
pub mod runner;
pub mod worker;

pub use bus::{EventBus, EventStream, PostgresEventBus};
pub use checkpoint::{CheckpointStore, PostgresCheckpointStore, RunCheckpoint};
pub use context::RunContext;
pub use conversation::Conversation;
pub use error::{ErrorInfo, ErrorKind};
pub use event::{EventType, RunEvent};
pub use memory::{InMemoryCheckpointStore, InMemoryEventBus, InMemoryRunQueue};
pub use queue::{
    backoff_delay, CancelOutcome, PostgresRunQueue, RunFilter, RunOutcome, RunQueue, SubmitResult,
};
pub use registry::{Agent, AgentRegistry, EchoAgent, RunResult};
pub use run::{Message, Run, RunStatus};
pub use runner::Runner;
pub use worker::{WorkerConfig, WorkerLoop};
