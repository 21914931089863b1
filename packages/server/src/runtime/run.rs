//! Run model: one agent execution from submission to terminal status.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::error::ErrorInfo;

/// Lifecycle states of a run.
///
/// Terminal states are absorbing; the queue only ever mutates a terminal row
/// cosmetically (metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }
}

/// One conversation message in a run's input or output.
///
/// `content` is either a plain string or provider-structured content; the
/// engine never interprets it. Unknown fields ride along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    pub const VALID_ROLES: [&'static str; 4] = ["user", "assistant", "system", "tool"];

    pub fn new(role: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            role: role.into(),
            content,
            extra: serde_json::Map::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", serde_json::Value::String(content.into()))
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", serde_json::Value::String(content.into()))
    }
}

/// A single agent execution, possibly spanning multiple attempts.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Run {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    #[builder(default, setter(strip_option))]
    pub conversation_id: Option<Uuid>,
    pub agent_key: String,

    #[builder(default)]
    pub status: RunStatus,

    // {"messages": [...], "params": {...}}
    #[builder(default = serde_json::json!({"messages": [], "params": {}}))]
    pub input: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub output: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<serde_json::Value>,

    #[builder(default = 1)]
    pub attempt: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,

    // Lease management. Empty owner means unleased.
    #[builder(default)]
    pub lease_owner: String,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub cancel_requested_at: Option<DateTime<Utc>>,

    // Retry backoff deadline; not claimable before this instant.
    #[builder(default, setter(strip_option))]
    pub available_at: Option<DateTime<Utc>>,

    #[builder(default = serde_json::json!({}))]
    pub metadata: serde_json::Value,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Build the canonical input object from messages and params.
    pub fn input_from(messages: &[Message], params: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "messages": messages,
            "params": params,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_leased(&self) -> bool {
        !self.lease_owner.is_empty()
    }

    /// The ordered message history from the input envelope.
    pub fn input_messages(&self) -> Result<Vec<Message>> {
        let messages = self
            .input
            .get("messages")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Array(vec![]));
        serde_json::from_value(messages).map_err(|e| anyhow!("run {} has malformed messages: {}", self.id, e))
    }

    /// The opaque parameter mapping from the input envelope.
    pub fn input_params(&self) -> serde_json::Value {
        self.input
            .get("params")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }

    /// The most recent attempt's error, if the row carries one.
    pub fn error_info(&self) -> Option<ErrorInfo> {
        self.error
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::ErrorKind;

    fn sample_run() -> Run {
        Run::builder().agent_key("echo").build()
    }

    #[test]
    fn new_run_starts_queued_on_attempt_one() {
        let run = sample_run();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.attempt, 1);
        assert_eq!(run.max_attempts, 3);
    }

    #[test]
    fn new_run_is_unleased() {
        let run = sample_run();
        assert!(!run.is_leased());
        assert!(run.lease_expires_at.is_none());
    }

    #[test]
    fn queued_and_running_are_not_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn all_four_terminal_statuses_are_terminal() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::TimedOut.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_value(RunStatus::TimedOut).unwrap();
        assert_eq!(json, "timed_out");
    }

    #[test]
    fn input_envelope_roundtrips() {
        let messages = vec![Message::user("hi")];
        let params = serde_json::json!({"temperature": 0.2});
        let run = Run::builder()
            .agent_key("echo")
            .input(Run::input_from(&messages, &params))
            .build();

        let parsed = run.input_messages().unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].role, "user");
        assert_eq!(parsed[0].content, "hi");
        assert_eq!(run.input_params()["temperature"], 0.2);
    }

    #[test]
    fn message_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "role": "tool",
            "content": {"result": 42},
            "tool_call_id": "call_1"
        });
        let message: Message = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.extra["tool_call_id"], "call_1");
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
    }

    #[test]
    fn error_info_parses_from_row_json() {
        let run = Run::builder()
            .agent_key("echo")
            .error(ErrorInfo::new(ErrorKind::Timeout, "too slow").to_json())
            .build();
        let info = run.error_info().unwrap();
        assert_eq!(info.kind, ErrorKind::Timeout);
        assert!(!info.retriable);
    }
}
