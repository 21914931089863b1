//! Error classification for run outcomes.

use serde::{Deserialize, Serialize};

/// Classifies why a run attempt failed and whether it is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The submitted agent_key has no registered callback.
    AgentNotFound,
    /// Bad input rejected at the boundary.
    ValidationError,
    /// Cooperative cancellation observed mid-run.
    Cancelled,
    /// The worker's lease expired and the attempt was abandoned.
    LeaseLost,
    /// The run exceeded its wall-clock deadline.
    Timeout,
    /// The agent callback raised; transient by default.
    CallbackError,
    /// Event bus or storage failure underneath a healthy callback.
    InfrastructureError,
}

impl ErrorKind {
    /// Whether this kind is retriable unless the classifier says otherwise.
    pub fn default_retriable(&self) -> bool {
        matches!(self, ErrorKind::CallbackError | ErrorKind::InfrastructureError)
    }
}

/// The persisted error object: `{kind, message, stack, retriable, details}`.
///
/// Stored as JSONB on the run row and carried in `run.failed` payloads. Only
/// the most recent attempt's error lives on the row; prior attempts are kept
/// under `metadata.attempt_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            retriable: kind.default_retriable(),
            details: None,
        }
    }

    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Default classification for an unhandled callback error.
    pub fn from_callback_error(error: &anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::CallbackError,
            message: error.to_string(),
            stack: Some(format!("{:?}", error)),
            retriable: true,
            details: None,
        }
    }

    /// Classification for failures of the engine itself (bus publish, DB).
    pub fn infrastructure(error: &anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InfrastructureError,
            message: error.to_string(),
            stack: Some(format!("{:?}", error)),
            retriable: true,
            details: None,
        }
    }

    pub fn lease_lost(worker_id: &str) -> Self {
        Self::new(
            ErrorKind::LeaseLost,
            format!("lease expired while held by {}", worker_id),
        )
    }

    pub fn timeout(timeout_secs: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Run exceeded {}s timeout", timeout_secs),
        )
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "kind": "infrastructure_error",
                "message": "error serialization failed",
                "retriable": false,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_errors_are_retriable_by_default() {
        assert!(ErrorKind::CallbackError.default_retriable());
        assert!(ErrorKind::InfrastructureError.default_retriable());
    }

    #[test]
    fn terminal_kinds_are_not_retriable() {
        assert!(!ErrorKind::AgentNotFound.default_retriable());
        assert!(!ErrorKind::Timeout.default_retriable());
        assert!(!ErrorKind::LeaseLost.default_retriable());
        assert!(!ErrorKind::Cancelled.default_retriable());
    }

    #[test]
    fn error_info_serializes_with_snake_case_kind() {
        let info = ErrorInfo::new(ErrorKind::AgentNotFound, "no such agent");
        let json = info.to_json();
        assert_eq!(json["kind"], "agent_not_found");
        assert_eq!(json["retriable"], false);
    }

    #[test]
    fn error_info_roundtrips() {
        let info = ErrorInfo::from_callback_error(&anyhow::anyhow!("llm unavailable"))
            .with_details(serde_json::json!({"status": 503}));
        let parsed: ErrorInfo = serde_json::from_value(info.to_json()).unwrap();
        assert_eq!(parsed.kind, ErrorKind::CallbackError);
        assert!(parsed.retriable);
        assert_eq!(parsed.details.unwrap()["status"], 503);
    }
}
