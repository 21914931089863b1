//! Run endpoints: submit, retrieve, list, cancel.

use async_trait::async_trait;
use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::ApiError;
use crate::common::sql::Record;
use crate::runtime::conversation::Conversation;
use crate::runtime::event::{EventType, RunEvent};
use crate::runtime::queue::{CancelOutcome, RunFilter};
use crate::runtime::run::{Message, Run, RunStatus};
use crate::server::app::AppState;

/// Request body for `POST /api/runs`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRunRequest {
    pub agent_key: String,
    pub conversation_id: Option<Uuid>,
    pub messages: Vec<Message>,
    pub params: Option<serde_json::Value>,
    pub max_attempts: Option<i32>,
    pub idempotency_key: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Why a submit gate refused a request.
#[derive(Debug, Clone)]
pub enum SubmitRefusal {
    /// The caller may not create this run (HTTP 403).
    Forbidden(String),
    /// The caller is over quota (HTTP 429).
    QuotaExceeded,
}

/// Optional authorization/quota hook consulted before a run is created.
#[async_trait]
pub trait SubmitGate: Send + Sync {
    async fn check(&self, request: &SubmitRunRequest) -> Result<(), SubmitRefusal>;
}

fn validate(request: &SubmitRunRequest) -> Result<(), ApiError> {
    if request.agent_key.trim().is_empty() {
        return Err(ApiError::Validation("agent_key must not be empty".into()));
    }
    if request.agent_key.len() > 100 {
        return Err(ApiError::Validation(
            "agent_key must be at most 100 characters".into(),
        ));
    }
    if request.messages.is_empty() {
        return Err(ApiError::Validation("messages must not be empty".into()));
    }
    for message in &request.messages {
        if !Message::VALID_ROLES.contains(&message.role.as_str()) {
            return Err(ApiError::Validation(format!(
                "invalid message role '{}'",
                message.role
            )));
        }
    }
    if let Some(max_attempts) = request.max_attempts {
        if !(1..=10).contains(&max_attempts) {
            return Err(ApiError::Validation(
                "max_attempts must be between 1 and 10".into(),
            ));
        }
    }
    if let Some(key) = &request.idempotency_key {
        if key.is_empty() || key.len() > 255 {
            return Err(ApiError::Validation(
                "idempotency_key must be 1..=255 characters".into(),
            ));
        }
    }
    Ok(())
}

/// POST /api/runs
///
/// 201 on create, 200 on an idempotency-key hit.
pub async fn submit_run_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<SubmitRunRequest>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    validate(&request)?;

    if let Some(gate) = &state.submit_gate {
        gate.check(&request).await.map_err(|refusal| match refusal {
            SubmitRefusal::Forbidden(reason) => ApiError::Forbidden(reason),
            SubmitRefusal::QuotaExceeded => ApiError::QuotaExceeded,
        })?;
    }

    if let Some(conversation_id) = request.conversation_id {
        if let Some(pool) = &state.kernel.db_pool {
            Conversation::find_by_id(conversation_id, pool)
                .await?
                .ok_or(ApiError::NotFound("conversation"))?;
        }
    }

    let params = request.params.unwrap_or_else(|| serde_json::json!({}));
    let mut run = Run::builder()
        .agent_key(request.agent_key)
        .input(Run::input_from(&request.messages, &params))
        .max_attempts(
            request
                .max_attempts
                .unwrap_or(state.kernel.settings.default_max_attempts),
        )
        .metadata(request.metadata.unwrap_or_else(|| serde_json::json!({})))
        .build();
    run.conversation_id = request.conversation_id;
    run.idempotency_key = request.idempotency_key;

    let result = state.kernel.queue.submit(run).await?;
    let status = if result.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(result.into_run())))
}

#[derive(Debug, Deserialize)]
pub struct GetRunQuery {
    /// `detail=events` embeds the run's event log.
    pub detail: Option<String>,
}

/// Run record with optionally embedded events.
#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: Run,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<RunEvent>>,
}

/// GET /api/runs/{id}
pub async fn get_run_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GetRunQuery>,
) -> Result<Json<RunDetailResponse>, ApiError> {
    let run = state
        .kernel
        .queue
        .get(id)
        .await?
        .ok_or(ApiError::NotFound("run"))?;

    let events = if query.detail.as_deref() == Some("events") {
        Some(state.kernel.bus.get_events(id, 0, None).await?)
    } else {
        None
    };

    Ok(Json(RunDetailResponse { run, events }))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub agent_key: Option<String>,
    pub status: Option<RunStatus>,
    pub conversation_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// GET /api/runs
pub async fn list_runs_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let filter = RunFilter {
        agent_key: query.agent_key,
        status: query.status,
        conversation_id: query.conversation_id,
        limit: query.limit.map(|l| l.clamp(1, 200)),
    };
    let runs = state.kernel.queue.list(&filter).await?;
    Ok(Json(runs))
}

/// POST /api/runs/{id}/cancel
///
/// Queued runs short-circuit straight to CANCELLED; running runs are
/// cancelled cooperatively by the leasing worker.
pub async fn cancel_run_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.kernel.queue.cancel(id).await? {
        CancelOutcome::NotFound => Err(ApiError::NotFound("run")),
        CancelOutcome::AlreadyTerminal => Err(ApiError::AlreadyTerminal),
        CancelOutcome::ShortCircuited(run) => {
            // The run never reached a worker, so the terminal event is ours
            // to emit.
            let seq = state.kernel.bus.next_seq(run.id).await?;
            state
                .kernel
                .bus
                .publish(RunEvent::new(
                    run.id,
                    seq,
                    EventType::RunCancelled.as_str(),
                    serde_json::json!({}),
                ))
                .await?;
            Ok(Json(serde_json::json!({"status": "cancellation_requested"})))
        }
        CancelOutcome::Requested => {
            Ok(Json(serde_json::json!({"status": "cancellation_requested"})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(messages: Vec<Message>) -> SubmitRunRequest {
        SubmitRunRequest {
            agent_key: "echo".to_string(),
            conversation_id: None,
            messages,
            params: None,
            max_attempts: None,
            idempotency_key: None,
            metadata: None,
        }
    }

    #[test]
    fn validate_accepts_a_minimal_request() {
        assert!(validate(&request(vec![Message::user("hi")])).is_ok());
    }

    #[test]
    fn validate_rejects_empty_agent_key() {
        let mut req = request(vec![Message::user("hi")]);
        req.agent_key = "  ".to_string();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn validate_rejects_empty_messages() {
        assert!(validate(&request(vec![])).is_err());
    }

    #[test]
    fn validate_rejects_unknown_role() {
        let req = request(vec![Message::new("robot", serde_json::json!("hi"))]);
        assert!(validate(&req).is_err());
    }

    #[test]
    fn validate_bounds_max_attempts() {
        let mut req = request(vec![Message::user("hi")]);
        req.max_attempts = Some(0);
        assert!(validate(&req).is_err());
        req.max_attempts = Some(11);
        assert!(validate(&req).is_err());
        req.max_attempts = Some(10);
        assert!(validate(&req).is_ok());
    }

    #[test]
    fn validate_bounds_idempotency_key_length() {
        let mut req = request(vec![Message::user("hi")]);
        req.idempotency_key = Some("x".repeat(256));
        assert!(validate(&req).is_err());
        req.idempotency_key = Some("x".repeat(255));
        assert!(validate(&req).is_ok());
    }
}
