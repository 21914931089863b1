//! Run events: the append-only, strictly ordered log behind streaming.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Canonical event types emitted by the engine and by agent callbacks.
///
/// Callbacks may emit additional custom types; the four terminal types are
/// reserved for the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RunStarted,
    RunHeartbeat,
    StateCheckpoint,
    AssistantMessage,
    ToolCall,
    ToolResult,
    TokenDelta,
    RunSucceeded,
    RunFailed,
    RunCancelled,
    RunTimedOut,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "run.started",
            EventType::RunHeartbeat => "run.heartbeat",
            EventType::StateCheckpoint => "state.checkpoint",
            EventType::AssistantMessage => "assistant.message",
            EventType::ToolCall => "tool.call",
            EventType::ToolResult => "tool.result",
            EventType::TokenDelta => "token.delta",
            EventType::RunSucceeded => "run.succeeded",
            EventType::RunFailed => "run.failed",
            EventType::RunCancelled => "run.cancelled",
            EventType::RunTimedOut => "run.timed_out",
        }
    }

    /// True for the four event types that close a run's stream.
    pub fn is_terminal_type(event_type: &str) -> bool {
        matches!(
            event_type,
            "run.succeeded" | "run.failed" | "run.cancelled" | "run.timed_out"
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a run's event log.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(
        run_id: Uuid,
        seq: i64,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            seq,
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        EventType::is_terminal_type(&self.event_type)
    }

    /// The wire envelope streamed to clients: `{run_id, seq, type, payload, ts}`.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "seq": self.seq,
            "type": self.event_type,
            "payload": self.payload,
            "ts": self.timestamp.to_rfc3339(),
        })
    }

    /// Rebuild an event from its wire envelope.
    pub fn from_envelope(value: &serde_json::Value) -> Result<Self> {
        let run_id = value
            .get("run_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("envelope missing run_id"))?;
        let seq = value
            .get("seq")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("envelope missing seq"))?;
        let event_type = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("envelope missing type"))?;
        let ts = value
            .get("ts")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("envelope missing ts"))?;

        Ok(Self {
            id: Uuid::new_v4(),
            run_id: Uuid::parse_str(run_id)?,
            seq,
            event_type: event_type.to_string(),
            payload: value.get("payload").cloned().unwrap_or_default(),
            timestamp: DateTime::parse_from_rfc3339(ts)?.with_timezone(&Utc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_types_are_exactly_the_four() {
        assert!(EventType::is_terminal_type("run.succeeded"));
        assert!(EventType::is_terminal_type("run.failed"));
        assert!(EventType::is_terminal_type("run.cancelled"));
        assert!(EventType::is_terminal_type("run.timed_out"));

        assert!(!EventType::is_terminal_type("run.started"));
        assert!(!EventType::is_terminal_type("run.heartbeat"));
        assert!(!EventType::is_terminal_type("state.checkpoint"));
        assert!(!EventType::is_terminal_type("token.delta"));
    }

    #[test]
    fn envelope_uses_wire_field_names() {
        let run_id = Uuid::new_v4();
        let event = RunEvent::new(
            run_id,
            3,
            EventType::AssistantMessage.as_str(),
            serde_json::json!({"content": "hello"}),
        );

        let envelope = event.envelope();
        assert_eq!(envelope["run_id"], run_id.to_string());
        assert_eq!(envelope["seq"], 3);
        assert_eq!(envelope["type"], "assistant.message");
        assert_eq!(envelope["payload"]["content"], "hello");
        assert!(envelope["ts"].is_string());
    }

    #[test]
    fn envelope_roundtrips() {
        let event = RunEvent::new(
            Uuid::new_v4(),
            7,
            EventType::RunSucceeded.as_str(),
            serde_json::json!({"output": {"text": "done"}}),
        );

        let rebuilt = RunEvent::from_envelope(&event.envelope()).unwrap();
        assert_eq!(rebuilt.run_id, event.run_id);
        assert_eq!(rebuilt.seq, event.seq);
        assert_eq!(rebuilt.event_type, event.event_type);
        assert_eq!(rebuilt.payload, event.payload);
        assert!(rebuilt.is_terminal());
    }

    #[test]
    fn from_envelope_rejects_malformed_values() {
        assert!(RunEvent::from_envelope(&serde_json::json!({"seq": 0})).is_err());
        assert!(RunEvent::from_envelope(&serde_json::json!({
            "run_id": "not-a-uuid",
            "seq": 0,
            "type": "run.started",
            "ts": "2025-01-01T00:00:00Z"
        }))
        .is_err());
    }
}
