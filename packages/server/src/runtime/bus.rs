//! Event bus: durable append plus live delivery to subscribers.
//!
//! Publishes persist to the event store and fan out through the in-process
//! [`StreamHub`]. A subscription opens its live channel *before* running the
//! replay query, then bridges both through an mpsc channel with a sliding
//! `next` lower bound, so no event between the replay upper bound and the
//! first live delivery can be lost. The terminal event closes the stream.
//!
//! High-volume `token.delta` events are persisted only when the engine is
//! configured to do so; otherwise they ride the hub alone and are not
//! replayable after reconnect.

use std::pin::Pin;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::Stream;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::kernel::stream_hub::StreamHub;

use super::event::{EventType, RunEvent};

/// A finite stream of events for one run, closed by the terminal event or by
/// the subscriber dropping it.
pub type EventStream = Pin<Box<dyn Stream<Item = RunEvent> + Send>>;

/// Trait for event bus implementations.
///
/// Publishes for one run are serialized by the runner that holds its lease,
/// so the bus does not allocate sequence numbers itself; it rejects
/// collisions instead.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// One more than the highest persisted seq for the run, or 0.
    async fn next_seq(&self, run_id: Uuid) -> Result<i64>;

    /// Durably append and fan out. A `(run_id, seq)` collision is an error.
    async fn publish(&self, event: RunEvent) -> Result<()>;

    /// Replay persisted events, inclusive range.
    async fn get_events(
        &self,
        run_id: Uuid,
        from_seq: i64,
        to_seq: Option<i64>,
    ) -> Result<Vec<RunEvent>>;

    /// All historical events with `seq >= from_seq`, then live events until
    /// the run's terminal event.
    async fn subscribe(&self, run_id: Uuid, from_seq: i64) -> Result<EventStream>;

    /// Release resources.
    async fn close(&self);
}

/// PostgreSQL-backed event bus with StreamHub fan-out.
pub struct PostgresEventBus {
    pool: PgPool,
    hub: StreamHub,
    persist_token_deltas: bool,
}

impl PostgresEventBus {
    pub fn new(pool: PgPool, hub: StreamHub, persist_token_deltas: bool) -> Self {
        Self {
            pool,
            hub,
            persist_token_deltas,
        }
    }

    fn should_persist(&self, event: &RunEvent) -> bool {
        self.persist_token_deltas || event.event_type != EventType::TokenDelta.as_str()
    }

    async fn fetch_from(pool: &PgPool, run_id: Uuid, from_seq: i64) -> Result<Vec<RunEvent>> {
        let events = sqlx::query_as::<_, RunEvent>(
            r#"
            SELECT id, run_id, seq, event_type, payload, timestamp
            FROM agent_run_events
            WHERE run_id = $1 AND seq >= $2
            ORDER BY seq
            "#,
        )
        .bind(run_id)
        .bind(from_seq)
        .fetch_all(pool)
        .await?;

        Ok(events)
    }

    /// Whether a terminal event at `seq < before` already exists for the run.
    async fn terminal_before(pool: &PgPool, run_id: Uuid, before: i64) -> Result<bool> {
        let seq = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT seq
            FROM agent_run_events
            WHERE run_id = $1
              AND event_type IN ('run.succeeded', 'run.failed', 'run.cancelled', 'run.timed_out')
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(pool)
        .await?;

        Ok(seq.map(|s| s < before).unwrap_or(false))
    }
}

#[async_trait]
impl EventBus for PostgresEventBus {
    async fn next_seq(&self, run_id: Uuid) -> Result<i64> {
        let next = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(seq) + 1, 0) FROM agent_run_events WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(next)
    }

    async fn publish(&self, event: RunEvent) -> Result<()> {
        if self.should_persist(&event) {
            let result = sqlx::query(
                r#"
                INSERT INTO agent_run_events (id, run_id, seq, event_type, payload, timestamp)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(event.id)
            .bind(event.run_id)
            .bind(event.seq)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.timestamp)
            .execute(&self.pool)
            .await;

            if let Err(e) = result {
                let duplicate = e
                    .as_database_error()
                    .map(|db| db.is_unique_violation())
                    .unwrap_or(false);
                if duplicate {
                    return Err(anyhow!(
                        "duplicate event seq {} for run {}",
                        event.seq,
                        event.run_id
                    ));
                }
                return Err(e).context("failed to persist event");
            }
        }

        self.hub.publish(event.run_id, event.envelope()).await;

        Ok(())
    }

    async fn get_events(
        &self,
        run_id: Uuid,
        from_seq: i64,
        to_seq: Option<i64>,
    ) -> Result<Vec<RunEvent>> {
        let events = sqlx::query_as::<_, RunEvent>(
            r#"
            SELECT id, run_id, seq, event_type, payload, timestamp
            FROM agent_run_events
            WHERE run_id = $1
              AND seq >= $2
              AND ($3::bigint IS NULL OR seq <= $3)
            ORDER BY seq
            "#,
        )
        .bind(run_id)
        .bind(from_seq)
        .bind(to_seq)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    async fn subscribe(&self, run_id: Uuid, from_seq: i64) -> Result<EventStream> {
        // Live channel first: anything published between the replay query and
        // the first live recv shows up in both and is deduplicated below.
        let mut live = self.hub.subscribe(run_id).await;
        let replay = Self::fetch_from(&self.pool, run_id, from_seq).await?;

        let (tx, rx) = mpsc::channel::<RunEvent>(64);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let mut next = from_seq;

            for event in replay {
                next = event.seq + 1;
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }

            // A subscriber attaching after the run finished but past the
            // terminal seq would otherwise wait forever.
            match Self::terminal_before(&pool, run_id, next).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "terminal probe failed");
                }
            }

            loop {
                match live.recv().await {
                    Ok(value) => {
                        let event = match RunEvent::from_envelope(&value) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(run_id = %run_id, error = %e, "dropping malformed envelope");
                                continue;
                            }
                        };
                        // Already delivered during replay.
                        if event.seq < next {
                            continue;
                        }
                        next = event.seq + 1;
                        let terminal = event.is_terminal();
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        if terminal {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(run_id = %run_id, missed, "subscriber lagged; re-reading store");
                        let refetched = match Self::fetch_from(&pool, run_id, next).await {
                            Ok(events) => events,
                            Err(e) => {
                                warn!(run_id = %run_id, error = %e, "lag recovery failed");
                                continue;
                            }
                        };
                        for event in refetched {
                            next = event.seq + 1;
                            let terminal = event.is_terminal();
                            if tx.send(event).await.is_err() {
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn close(&self) {
        self.hub.cleanup().await;
    }
}
