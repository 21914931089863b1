//! Agent registry: the "what to run" indirection.
//!
//! An agent is a registered callback that consumes a [`RunContext`] and
//! produces a [`RunResult`]. The registry maps `agent_key` strings to
//! callbacks; it is populated once at startup and passed explicitly through
//! the kernel, so there is no global mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::RunContext;
use super::error::ErrorInfo;
use super::event::EventType;
use super::run::Message;

/// The value an agent produces on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    pub final_output: serde_json::Value,
    pub final_messages: Vec<Message>,
    pub usage: serde_json::Value,
    pub artifacts: serde_json::Value,
}

impl RunResult {
    pub fn from_output(final_output: serde_json::Value) -> Self {
        Self {
            final_output,
            final_messages: Vec::new(),
            usage: serde_json::json!({}),
            artifacts: serde_json::json!({}),
        }
    }

    /// The persisted output envelope.
    pub fn to_output_json(&self) -> serde_json::Value {
        serde_json::json!({
            "final_output": self.final_output,
            "final_messages": self.final_messages,
            "usage": self.usage,
            "artifacts": self.artifacts,
        })
    }
}

/// A registered agent callback.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Drive one attempt of a run. Long-running work should call
    /// `ctx.check_cancelled()` between subtasks.
    async fn run(&self, ctx: &RunContext) -> Result<RunResult>;

    /// Classify an error from `run`. Returning `None` falls back to the
    /// default classification (retriable callback error).
    async fn on_error(&self, _ctx: &RunContext, _error: &anyhow::Error) -> Option<ErrorInfo> {
        None
    }
}

/// Registry that maps agent keys to callbacks.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
        }
    }

    /// Register an agent under a key. Later registrations replace earlier
    /// ones; startup wiring decides the final set.
    pub fn register(&mut self, agent_key: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(agent_key.into(), agent);
    }

    pub fn get(&self, agent_key: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(agent_key).cloned()
    }

    pub fn is_registered(&self, agent_key: &str) -> bool {
        self.agents.contains_key(agent_key)
    }

    pub fn registered_keys(&self) -> Vec<&str> {
        self.agents.keys().map(|k| k.as_str()).collect()
    }
}

/// Builtin smoke-test agent: echoes the last user message back.
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn run(&self, ctx: &RunContext) -> Result<RunResult> {
        let text = ctx
            .input_messages()
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_else(|| serde_json::Value::String(String::new()));

        ctx.emit(
            EventType::AssistantMessage.as_str(),
            serde_json::json!({"content": text}),
        )
        .await?;

        Ok(RunResult::from_output(serde_json::json!({"text": text})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAgent;

    #[async_trait]
    impl Agent for NoopAgent {
        async fn run(&self, _ctx: &RunContext) -> Result<RunResult> {
            Ok(RunResult::default())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = AgentRegistry::new();
        registry.register("noop", Arc::new(NoopAgent));

        assert!(registry.is_registered("noop"));
        assert!(registry.get("noop").is_some());
        assert!(!registry.is_registered("missing"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn registered_keys_lists_all() {
        let mut registry = AgentRegistry::new();
        registry.register("a", Arc::new(NoopAgent));
        registry.register("b", Arc::new(NoopAgent));

        let mut keys = registry.registered_keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn run_result_output_envelope_has_all_sections() {
        let result = RunResult::from_output(serde_json::json!({"text": "hi"}));
        let json = result.to_output_json();
        assert_eq!(json["final_output"]["text"], "hi");
        assert!(json["final_messages"].as_array().unwrap().is_empty());
        assert!(json["usage"].is_object());
        assert!(json["artifacts"].is_object());
    }
}
