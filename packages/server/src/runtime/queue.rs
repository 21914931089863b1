//! Run queue: leased claiming over the run store.
//!
//! The queue is a view over `agent_runs`. All cross-worker safety reduces to
//! the atomicity of the statements here: claim, extend, release, requeue, and
//! reap each execute as one `FOR UPDATE SKIP LOCKED` CTE-update or a single
//! guarded UPDATE, so no two workers can ever drive the same run at once.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::error::{ErrorInfo, ErrorKind};
use super::run::{Run, RunStatus};

/// Result of a submit that handles idempotency.
#[derive(Debug, Clone)]
pub enum SubmitResult {
    /// A new run row was created.
    Created(Run),
    /// The idempotency key matched an existing run; nothing was created.
    Duplicate(Run),
}

impl SubmitResult {
    pub fn run(&self) -> &Run {
        match self {
            SubmitResult::Created(run) | SubmitResult::Duplicate(run) => run,
        }
    }

    pub fn into_run(self) -> Run {
        match self {
            SubmitResult::Created(run) | SubmitResult::Duplicate(run) => run,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, SubmitResult::Created(_))
    }
}

/// Terminal disposition of a finished attempt.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Succeeded { output: serde_json::Value },
    Failed { error: ErrorInfo },
    Cancelled,
    TimedOut { error: ErrorInfo },
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Succeeded { .. } => RunStatus::Succeeded,
            RunOutcome::Failed { .. } => RunStatus::Failed,
            RunOutcome::Cancelled => RunStatus::Cancelled,
            RunOutcome::TimedOut { .. } => RunStatus::TimedOut,
        }
    }

    pub fn output(&self) -> Option<serde_json::Value> {
        match self {
            RunOutcome::Succeeded { output } => Some(output.clone()),
            _ => None,
        }
    }

    pub fn error_json(&self) -> Option<serde_json::Value> {
        match self {
            RunOutcome::Failed { error } | RunOutcome::TimedOut { error } => Some(error.to_json()),
            _ => None,
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// No run with that id.
    NotFound,
    /// The run already reached a terminal status.
    AlreadyTerminal,
    /// The run is RUNNING; the leasing worker will observe cooperatively.
    Requested,
    /// The run was still QUEUED and went straight to CANCELLED.
    ShortCircuited(Run),
}

/// Read filter for the list endpoint.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub agent_key: Option<String>,
    pub status: Option<RunStatus>,
    pub conversation_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// Trait for run queue operations.
///
/// Implementations must make every mutation atomic per run row; callers rely
/// on claim idempotence (a run goes to exactly one concurrent claimer) and on
/// lease checks in extend/release/requeue.
#[async_trait]
pub trait RunQueue: Send + Sync {
    /// Create a QUEUED run. If the run carries an idempotency key that
    /// already exists, returns the existing run unchanged.
    async fn submit(&self, run: Run) -> Result<SubmitResult>;

    /// Atomically claim up to `batch` claimable runs for `worker_id`.
    ///
    /// A run is claimable when QUEUED, past its backoff deadline, and not
    /// cancel-requested. Claimed runs come back RUNNING with a fresh lease;
    /// `started_at` is stamped on first claim only. `agent_keys` empty means
    /// no filter.
    async fn claim(&self, worker_id: &str, agent_keys: &[String], batch: i64) -> Result<Vec<Run>>;

    /// Renew the lease if `worker_id` still holds it. False means the lease
    /// was lost and the caller must abandon the run.
    async fn extend_lease(&self, run_id: Uuid, worker_id: &str, ttl: Duration) -> Result<bool>;

    /// Terminal transition. No-op (returns false) if the lease is no longer
    /// held by `worker_id`.
    async fn release(&self, run_id: Uuid, worker_id: &str, outcome: RunOutcome) -> Result<bool>;

    /// Put a RUNNING run back in the queue for another attempt, deferred by
    /// `delay`. Returns false when retries are exhausted or the lease is
    /// gone; the caller then releases with FAILED.
    async fn requeue_for_retry(
        &self,
        run_id: Uuid,
        worker_id: &str,
        error: &ErrorInfo,
        delay: Duration,
    ) -> Result<bool>;

    /// Whether cancellation has been requested for the run.
    async fn is_cancelled(&self, run_id: Uuid) -> Result<bool>;

    /// Recover RUNNING runs whose lease expired: re-queue with an incremented
    /// attempt, or fail with `LeaseLost` when attempts are exhausted. Returns
    /// the number of runs reaped. Safe to call from every worker.
    async fn reap_expired(&self) -> Result<u64>;

    /// Record a cancellation request; short-circuits QUEUED runs directly to
    /// CANCELLED.
    async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome>;

    /// Fetch a run by id.
    async fn get(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// Recent runs matching the filter, newest first.
    async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>>;
}

/// PostgreSQL-backed run queue.
pub struct PostgresRunQueue {
    pool: PgPool,
    lease_ttl: Duration,
}

impl PostgresRunQueue {
    pub fn new(pool: PgPool, lease_ttl: Duration) -> Self {
        Self { pool, lease_ttl }
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(
            r#"
            SELECT id, conversation_id, agent_key, status, input, output, error,
                   attempt, max_attempts, lease_owner, lease_expires_at,
                   idempotency_key, cancel_requested_at, available_at, metadata,
                   created_at, started_at, finished_at, updated_at
            FROM agent_runs
            WHERE idempotency_key = $1
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }
}

#[async_trait]
impl RunQueue for PostgresRunQueue {
    async fn submit(&self, run: Run) -> Result<SubmitResult> {
        // Cheap pre-check; the partial unique index is the real guarantee.
        if let Some(key) = &run.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                return Ok(SubmitResult::Duplicate(existing));
            }
        }

        let inserted = sqlx::query_as::<_, Run>(
            r#"
            INSERT INTO agent_runs (
                id, conversation_id, agent_key, status, input, output, error,
                attempt, max_attempts, lease_owner, lease_expires_at,
                idempotency_key, cancel_requested_at, available_at, metadata,
                created_at, started_at, finished_at, updated_at
            )
            VALUES (
                $1, $2, $3, 'queued', $4, NULL, NULL,
                1, $5, '', NULL,
                $6, NULL, $7, $8,
                NOW(), NULL, NULL, NOW()
            )
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING id, conversation_id, agent_key, status, input, output, error,
                      attempt, max_attempts, lease_owner, lease_expires_at,
                      idempotency_key, cancel_requested_at, available_at, metadata,
                      created_at, started_at, finished_at, updated_at
            "#,
        )
        .bind(run.id)
        .bind(run.conversation_id)
        .bind(&run.agent_key)
        .bind(&run.input)
        .bind(run.max_attempts)
        .bind(&run.idempotency_key)
        .bind(run.available_at)
        .bind(&run.metadata)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(created) => Ok(SubmitResult::Created(created)),
            None => {
                // Lost the idempotency race to a concurrent submit.
                let key = run
                    .idempotency_key
                    .as_deref()
                    .expect("conflict without idempotency key");
                let existing = self
                    .find_by_idempotency_key(key)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("idempotency conflict but no existing run"))?;
                Ok(SubmitResult::Duplicate(existing))
            }
        }
    }

    async fn claim(&self, worker_id: &str, agent_keys: &[String], batch: i64) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            r#"
            WITH next_runs AS (
                SELECT id
                FROM agent_runs
                WHERE status = 'queued'
                  AND (available_at IS NULL OR available_at <= NOW())
                  AND cancel_requested_at IS NULL
                  AND (cardinality($1::varchar[]) = 0 OR agent_key = ANY($1))
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE agent_runs
            SET status = 'running',
                lease_owner = $3,
                lease_expires_at = NOW() + ($4 || ' milliseconds')::INTERVAL,
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_runs)
            RETURNING id, conversation_id, agent_key, status, input, output, error,
                      attempt, max_attempts, lease_owner, lease_expires_at,
                      idempotency_key, cancel_requested_at, available_at, metadata,
                      created_at, started_at, finished_at, updated_at
            "#,
        )
        .bind(agent_keys)
        .bind(batch)
        .bind(worker_id)
        .bind((self.lease_ttl.as_millis() as i64).to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    async fn extend_lease(&self, run_id: Uuid, worker_id: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agent_runs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running' AND lease_owner = $3
            "#,
        )
        .bind((ttl.as_millis() as i64).to_string())
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, run_id: Uuid, worker_id: &str, outcome: RunOutcome) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agent_runs
            SET status = $1,
                output = $2,
                error = $3,
                finished_at = NOW(),
                lease_owner = '',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $4 AND status = 'running' AND lease_owner = $5
            "#,
        )
        .bind(outcome.status())
        .bind(outcome.output())
        .bind(outcome.error_json())
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn requeue_for_retry(
        &self,
        run_id: Uuid,
        worker_id: &str,
        error: &ErrorInfo,
        delay: Duration,
    ) -> Result<bool> {
        let error_json = error.to_json();
        let history_entry = serde_json::json!([{
            "error": error_json,
            "at": Utc::now().to_rfc3339(),
        }]);

        let result = sqlx::query(
            r#"
            UPDATE agent_runs
            SET status = 'queued',
                attempt = attempt + 1,
                error = $1,
                available_at = NOW() + ($2 || ' milliseconds')::INTERVAL,
                lease_owner = '',
                lease_expires_at = NULL,
                metadata = jsonb_set(
                    metadata,
                    '{attempt_history}',
                    COALESCE(metadata -> 'attempt_history', '[]'::jsonb) || $3::jsonb
                ),
                updated_at = NOW()
            WHERE id = $4
              AND status = 'running'
              AND lease_owner = $5
              AND attempt < max_attempts
            "#,
        )
        .bind(&error_json)
        .bind((delay.as_millis() as i64).to_string())
        .bind(&history_entry)
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_cancelled(&self, run_id: Uuid) -> Result<bool> {
        let cancelled = sqlx::query_scalar::<_, bool>(
            "SELECT cancel_requested_at IS NOT NULL FROM agent_runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cancelled.unwrap_or(false))
    }

    async fn reap_expired(&self) -> Result<u64> {
        let lease_lost = ErrorInfo::new(ErrorKind::LeaseLost, "lease expired with no attempts remaining");

        let result = sqlx::query(
            r#"
            WITH expired AS (
                SELECT id
                FROM agent_runs
                WHERE status = 'running' AND lease_expires_at < NOW()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE agent_runs
            SET status = CASE WHEN attempt < max_attempts
                              THEN 'queued'::run_status
                              ELSE 'failed'::run_status END,
                attempt = CASE WHEN attempt < max_attempts
                               THEN attempt + 1
                               ELSE attempt END,
                error = CASE WHEN attempt < max_attempts
                             THEN error
                             ELSE $1::jsonb END,
                finished_at = CASE WHEN attempt < max_attempts
                                   THEN finished_at
                                   ELSE NOW() END,
                available_at = CASE WHEN attempt < max_attempts
                                    THEN NOW()
                                    ELSE available_at END,
                lease_owner = '',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM expired)
            "#,
        )
        .bind(lease_lost.to_json())
        .execute(&self.pool)
        .await?;

        let reaped = result.rows_affected();
        if reaped > 0 {
            info!(count = reaped, "reaped runs with expired leases");
        }

        Ok(reaped)
    }

    async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome> {
        // Stamp the request on any non-terminal run.
        let status = sqlx::query_scalar::<_, RunStatus>(
            r#"
            UPDATE agent_runs
            SET cancel_requested_at = COALESCE(cancel_requested_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING status
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let status = match status {
            Some(status) => status,
            None => {
                return Ok(match self.get(run_id).await? {
                    Some(_) => CancelOutcome::AlreadyTerminal,
                    None => CancelOutcome::NotFound,
                });
            }
        };

        if status != RunStatus::Queued {
            return Ok(CancelOutcome::Requested);
        }

        // Still queued: short-circuit straight to CANCELLED. If a worker wins
        // the race and claims first, fall back to cooperative cancellation.
        let cancelled = sqlx::query_as::<_, Run>(
            r#"
            UPDATE agent_runs
            SET status = 'cancelled',
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            RETURNING id, conversation_id, agent_key, status, input, output, error,
                      attempt, max_attempts, lease_owner, lease_expires_at,
                      idempotency_key, cancel_requested_at, available_at, metadata,
                      created_at, started_at, finished_at, updated_at
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match cancelled {
            Some(run) => CancelOutcome::ShortCircuited(run),
            None => CancelOutcome::Requested,
        })
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>(
            r#"
            SELECT id, conversation_id, agent_key, status, input, output, error,
                   attempt, max_attempts, lease_owner, lease_expires_at,
                   idempotency_key, cancel_requested_at, available_at, metadata,
                   created_at, started_at, finished_at, updated_at
            FROM agent_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            r#"
            SELECT id, conversation_id, agent_key, status, input, output, error,
                   attempt, max_attempts, lease_owner, lease_expires_at,
                   idempotency_key, cancel_requested_at, available_at, metadata,
                   created_at, started_at, finished_at, updated_at
            FROM agent_runs
            WHERE ($1::varchar IS NULL OR agent_key = $1)
              AND ($2::run_status IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR conversation_id = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(&filter.agent_key)
        .bind(filter.status)
        .bind(filter.conversation_id)
        .bind(filter.limit.unwrap_or(50))
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }
}

/// Exponential retry backoff: `min(base^attempt, max)`, keyed to the attempt
/// that just failed.
pub fn backoff_delay(base: f64, attempt: i32, max: Duration) -> Duration {
    let exp = base.powi(attempt.max(0));
    let capped = exp.min(max.as_secs_f64());
    Duration::from_secs_f64(capped.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_result_helpers() {
        let run = Run::builder().agent_key("echo").build();
        let created = SubmitResult::Created(run.clone());
        assert!(created.is_created());

        let duplicate = SubmitResult::Duplicate(run);
        assert!(!duplicate.is_created());
    }

    #[test]
    fn outcome_maps_to_terminal_status() {
        assert_eq!(
            RunOutcome::Succeeded {
                output: serde_json::json!({})
            }
            .status(),
            RunStatus::Succeeded
        );
        assert_eq!(RunOutcome::Cancelled.status(), RunStatus::Cancelled);
        assert_eq!(
            RunOutcome::TimedOut {
                error: ErrorInfo::timeout(5)
            }
            .status(),
            RunStatus::TimedOut
        );
    }

    #[test]
    fn only_success_carries_output() {
        let outcome = RunOutcome::Succeeded {
            output: serde_json::json!({"text": "hi"}),
        };
        assert!(outcome.output().is_some());
        assert!(outcome.error_json().is_none());

        let failed = RunOutcome::Failed {
            error: ErrorInfo::new(ErrorKind::CallbackError, "boom"),
        };
        assert!(failed.output().is_none());
        assert!(failed.error_json().is_some());
    }

    #[test]
    fn backoff_grows_exponentially_with_attempt() {
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(2.0, 1, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(2.0, 2, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(2.0, 3, max), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped() {
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(2.0, 30, max), max);
    }
}
