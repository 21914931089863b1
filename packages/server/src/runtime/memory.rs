//! In-memory queue, bus, and checkpoint store.
//!
//! Used by the execution test suite and by single-process deployments that
//! don't need durability. The implementations honor the same contracts as
//! the Postgres backends: atomic claims, lease checks, attempt accounting,
//! duplicate-seq rejection, and subscribe-with-replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use crate::kernel::stream_hub::StreamHub;

use super::bus::{EventBus, EventStream};
use super::checkpoint::CheckpointStore;
use super::error::{ErrorInfo, ErrorKind};
use super::event::{EventType, RunEvent};
use super::queue::{CancelOutcome, RunFilter, RunOutcome, RunQueue, SubmitResult};
use super::run::{Run, RunStatus};

/// In-memory run queue.
pub struct InMemoryRunQueue {
    runs: Mutex<HashMap<Uuid, Run>>,
    lease_ttl: Duration,
}

impl InMemoryRunQueue {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            lease_ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Run>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test hook: expire a run's lease so the reaper can recover it.
    pub fn force_expire_lease(&self, run_id: Uuid) {
        let mut runs = self.lock();
        if let Some(run) = runs.get_mut(&run_id) {
            run.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    /// Test hook: drop a run's retry backoff so it is claimable immediately.
    pub fn clear_backoff(&self, run_id: Uuid) {
        let mut runs = self.lock();
        if let Some(run) = runs.get_mut(&run_id) {
            run.available_at = None;
        }
    }

    fn lease_deadline(&self, ttl: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64)
    }

    fn push_attempt_history(run: &mut Run, error_json: &serde_json::Value) {
        let entry = serde_json::json!({
            "error": error_json,
            "at": Utc::now().to_rfc3339(),
        });
        let history = run
            .metadata
            .as_object_mut()
            .map(|m| m.entry("attempt_history").or_insert_with(|| serde_json::json!([])));
        if let Some(serde_json::Value::Array(items)) = history {
            items.push(entry);
        }
    }
}

#[async_trait]
impl RunQueue for InMemoryRunQueue {
    async fn submit(&self, run: Run) -> Result<SubmitResult> {
        let mut runs = self.lock();

        if let Some(key) = &run.idempotency_key {
            let existing = runs
                .values()
                .find(|r| r.idempotency_key.as_deref() == Some(key.as_str()))
                .cloned();
            if let Some(existing) = existing {
                return Ok(SubmitResult::Duplicate(existing));
            }
        }

        let mut run = run;
        run.status = RunStatus::Queued;
        runs.insert(run.id, run.clone());
        Ok(SubmitResult::Created(run))
    }

    async fn claim(&self, worker_id: &str, agent_keys: &[String], batch: i64) -> Result<Vec<Run>> {
        let now = Utc::now();
        let mut runs = self.lock();

        let mut eligible: Vec<Uuid> = runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Queued
                    && r.cancel_requested_at.is_none()
                    && r.available_at.map(|at| at <= now).unwrap_or(true)
                    && (agent_keys.is_empty() || agent_keys.contains(&r.agent_key))
            })
            .map(|r| (r.created_at, r.id))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        eligible.truncate(batch.max(0) as usize);

        let deadline = self.lease_deadline(self.lease_ttl);
        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let run = runs.get_mut(&id).expect("eligible run disappeared");
            run.status = RunStatus::Running;
            run.lease_owner = worker_id.to_string();
            run.lease_expires_at = Some(deadline);
            run.started_at.get_or_insert(now);
            run.updated_at = now;
            claimed.push(run.clone());
        }

        Ok(claimed)
    }

    async fn extend_lease(&self, run_id: Uuid, worker_id: &str, ttl: Duration) -> Result<bool> {
        let deadline = self.lease_deadline(ttl);
        let mut runs = self.lock();
        match runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running && run.lease_owner == worker_id => {
                run.lease_expires_at = Some(deadline);
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, run_id: Uuid, worker_id: &str, outcome: RunOutcome) -> Result<bool> {
        let mut runs = self.lock();
        match runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running && run.lease_owner == worker_id => {
                run.status = outcome.status();
                run.output = outcome.output();
                run.error = outcome.error_json();
                run.finished_at = Some(Utc::now());
                run.lease_owner = String::new();
                run.lease_expires_at = None;
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_for_retry(
        &self,
        run_id: Uuid,
        worker_id: &str,
        error: &ErrorInfo,
        delay: Duration,
    ) -> Result<bool> {
        let mut runs = self.lock();
        match runs.get_mut(&run_id) {
            Some(run)
                if run.status == RunStatus::Running
                    && run.lease_owner == worker_id
                    && run.attempt < run.max_attempts =>
            {
                let error_json = error.to_json();
                Self::push_attempt_history(run, &error_json);
                run.status = RunStatus::Queued;
                run.attempt += 1;
                run.error = Some(error_json);
                run.available_at =
                    Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
                run.lease_owner = String::new();
                run.lease_expires_at = None;
                run.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_cancelled(&self, run_id: Uuid) -> Result<bool> {
        let runs = self.lock();
        Ok(runs
            .get(&run_id)
            .map(|r| r.cancel_requested_at.is_some())
            .unwrap_or(false))
    }

    async fn reap_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut runs = self.lock();
        let mut reaped = 0;

        for run in runs.values_mut() {
            let expired = run.status == RunStatus::Running
                && run.lease_expires_at.map(|at| at < now).unwrap_or(false);
            if !expired {
                continue;
            }

            if run.attempt < run.max_attempts {
                run.status = RunStatus::Queued;
                run.attempt += 1;
                run.available_at = Some(now);
            } else {
                run.status = RunStatus::Failed;
                run.error = Some(
                    ErrorInfo::new(ErrorKind::LeaseLost, "lease expired with no attempts remaining")
                        .to_json(),
                );
                run.finished_at = Some(now);
            }
            run.lease_owner = String::new();
            run.lease_expires_at = None;
            run.updated_at = now;
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome> {
        let mut runs = self.lock();
        let run = match runs.get_mut(&run_id) {
            Some(run) => run,
            None => return Ok(CancelOutcome::NotFound),
        };

        if run.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        run.cancel_requested_at.get_or_insert(Utc::now());
        run.updated_at = Utc::now();

        if run.status == RunStatus::Queued {
            run.status = RunStatus::Cancelled;
            run.finished_at = Some(Utc::now());
            return Ok(CancelOutcome::ShortCircuited(run.clone()));
        }

        Ok(CancelOutcome::Requested)
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.lock().get(&run_id).cloned())
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let runs = self.lock();
        let mut matching: Vec<Run> = runs
            .values()
            .filter(|r| {
                filter
                    .agent_key
                    .as_deref()
                    .map(|key| r.agent_key == key)
                    .unwrap_or(true)
                    && filter.status.map(|s| r.status == s).unwrap_or(true)
                    && filter
                        .conversation_id
                        .map(|c| r.conversation_id == Some(c))
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(filter.limit.unwrap_or(50).max(0) as usize);
        Ok(matching)
    }
}

/// In-memory event bus with StreamHub fan-out.
pub struct InMemoryEventBus {
    events: Arc<Mutex<HashMap<Uuid, Vec<RunEvent>>>>,
    hub: StreamHub,
    persist_token_deltas: bool,
}

impl InMemoryEventBus {
    pub fn new(hub: StreamHub, persist_token_deltas: bool) -> Self {
        Self {
            events: Arc::new(Mutex::new(HashMap::new())),
            hub,
            persist_token_deltas,
        }
    }

    fn lock(
        events: &Mutex<HashMap<Uuid, Vec<RunEvent>>>,
    ) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<RunEvent>>> {
        events.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stored_from(
        events: &Mutex<HashMap<Uuid, Vec<RunEvent>>>,
        run_id: Uuid,
        from_seq: i64,
    ) -> Vec<RunEvent> {
        let events = Self::lock(events);
        let mut matching: Vec<RunEvent> = events
            .get(&run_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.seq >= from_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by_key(|e| e.seq);
        matching
    }

    fn terminal_before(
        events: &Mutex<HashMap<Uuid, Vec<RunEvent>>>,
        run_id: Uuid,
        before: i64,
    ) -> bool {
        let events = Self::lock(events);
        events
            .get(&run_id)
            .map(|log| log.iter().any(|e| e.is_terminal() && e.seq < before))
            .unwrap_or(false)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn next_seq(&self, run_id: Uuid) -> Result<i64> {
        let events = Self::lock(&self.events);
        Ok(events
            .get(&run_id)
            .and_then(|log| log.iter().map(|e| e.seq).max())
            .map(|max| max + 1)
            .unwrap_or(0))
    }

    async fn publish(&self, event: RunEvent) -> Result<()> {
        let persist =
            self.persist_token_deltas || event.event_type != EventType::TokenDelta.as_str();

        if persist {
            let mut events = Self::lock(&self.events);
            let log = events.entry(event.run_id).or_default();
            if log.iter().any(|e| e.seq == event.seq) {
                return Err(anyhow!(
                    "duplicate event seq {} for run {}",
                    event.seq,
                    event.run_id
                ));
            }
            log.push(event.clone());
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
        let mut events = Self::stored_from(&self.events, run_id, from_seq);
        if let Some(to_seq) = to_seq {
            events.retain(|e| e.seq <= to_seq);
        }
        Ok(events)
    }

    async fn subscribe(&self, run_id: Uuid, from_seq: i64) -> Result<EventStream> {
        // Live channel first, then replay: the overlap is deduplicated by seq.
        let mut live = self.hub.subscribe(run_id).await;
        let replay = Self::stored_from(&self.events, run_id, from_seq);
        let events = Arc::clone(&self.events);

        let (tx, rx) = mpsc::channel::<RunEvent>(64);

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

            if Self::terminal_before(&events, run_id, next) {
                return;
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
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let refetched = Self::stored_from(&events, run_id, next);
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

/// In-memory checkpoint store.
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<Uuid, Vec<(i64, serde_json::Value)>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, run_id: Uuid, state: &serde_json::Value) -> Result<i64> {
        let mut checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        let log = checkpoints.entry(run_id).or_default();
        let seq = log.iter().map(|(s, _)| *s).max().map(|s| s + 1).unwrap_or(0);
        log.push((seq, state.clone()));
        Ok(seq)
    }

    async fn latest(&self, run_id: Uuid) -> Result<Option<serde_json::Value>> {
        let checkpoints = self.checkpoints.lock().unwrap_or_else(|e| e.into_inner());
        Ok(checkpoints.get(&run_id).and_then(|log| {
            log.iter()
                .max_by_key(|(seq, _)| *seq)
                .map(|(_, state)| state.clone())
        }))
    }
}
