//! Checkpoint store: latest-wins snapshots of opaque agent state.
//!
//! Physically an append sequence keyed by `(run_id, seq)`; readers take the
//! highest seq. The checkpoint sequence is independent of the event log's.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// One persisted state snapshot.
#[derive(FromRow, Debug, Clone)]
pub struct RunCheckpoint {
    pub id: Uuid,
    pub run_id: Uuid,
    pub seq: i64,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Storage for resumable agent state.
///
/// Only the worker holding a run's lease writes checkpoints, so `save` does
/// not need cross-writer coordination beyond the unique `(run_id, seq)` index.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a snapshot under the next checkpoint seq; returns that seq.
    async fn save(&self, run_id: Uuid, state: &serde_json::Value) -> Result<i64>;

    /// The highest-seq state for the run, or none.
    async fn latest(&self, run_id: Uuid) -> Result<Option<serde_json::Value>>;
}

/// PostgreSQL-backed checkpoint store.
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn save(&self, run_id: Uuid, state: &serde_json::Value) -> Result<i64> {
        let seq = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO agent_checkpoints (id, run_id, seq, state, created_at)
            SELECT $1, $2, COALESCE(MAX(seq) + 1, 0), $3, NOW()
            FROM agent_checkpoints
            WHERE run_id = $2
            RETURNING seq
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(state)
        .fetch_one(&self.pool)
        .await?;

        Ok(seq)
    }

    async fn latest(&self, run_id: Uuid) -> Result<Option<serde_json::Value>> {
        let checkpoint = sqlx::query_as::<_, RunCheckpoint>(
            r#"
            SELECT id, run_id, seq, state, created_at
            FROM agent_checkpoints
            WHERE run_id = $1
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(checkpoint.map(|c| c.state))
    }
}
