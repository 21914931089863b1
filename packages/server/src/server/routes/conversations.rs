//! Conversation endpoints: a thin grouping resource over runs.

use anyhow::anyhow;
use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::ApiError;
use crate::common::sql::Record;
use crate::runtime::conversation::Conversation;
use crate::runtime::queue::RunFilter;
use crate::runtime::run::Run;
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub agent_key: String,
    pub title: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// POST /api/conversations
pub async fn create_conversation_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    if request.agent_key.trim().is_empty() {
        return Err(ApiError::Validation("agent_key must not be empty".into()));
    }

    let pool = state
        .kernel
        .db_pool
        .as_ref()
        .ok_or_else(|| ApiError::Internal(anyhow!("conversations require the database backend")))?;

    let conversation = Conversation::builder()
        .agent_key(request.agent_key)
        .title(request.title.unwrap_or_default())
        .metadata(request.metadata.unwrap_or_else(|| serde_json::json!({})))
        .build();

    let inserted = conversation.insert(pool).await?;
    Ok((StatusCode::CREATED, Json(inserted)))
}

/// Conversation with its recent runs embedded.
#[derive(Debug, Serialize)]
pub struct ConversationDetailResponse {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub runs: Vec<Run>,
}

/// GET /api/conversations/{id}
pub async fn get_conversation_handler(
    Extension(state): Extension<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationDetailResponse>, ApiError> {
    let pool = state
        .kernel
        .db_pool
        .as_ref()
        .ok_or_else(|| ApiError::Internal(anyhow!("conversations require the database backend")))?;

    let conversation = Conversation::find_by_id(id, pool)
        .await?
        .ok_or(ApiError::NotFound("conversation"))?;

    let runs = state
        .kernel
        .queue
        .list(&RunFilter {
            conversation_id: Some(id),
            ..Default::default()
        })
        .await?;

    Ok(Json(ConversationDetailResponse { conversation, runs }))
}
