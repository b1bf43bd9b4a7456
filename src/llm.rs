//! Contracts consumed from the rest of the system: LLM clients, agents
//! and prompt rendering. The core never talks to a model directly.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value as Json;

use crate::{Error, Result};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a prompt and return the raw response text.
    async fn send_prompt(&self, prompt: &str, kind: &str) -> Result<String>;

    fn max_token_length(&self) -> usize;
}

pub trait Agent: Send + Sync {
    fn agent_type(&self) -> &str;

    fn client(&self) -> Option<Arc<dyn LlmClient>>;

    /// Optional capability flags (`"focal"`, `"actions"`, ...).
    fn has_capability(&self, _name: &str) -> bool {
        false
    }
}

/// Agent instances by type name.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<dyn Agent>) {
        self.agents.write().insert(agent.agent_type().to_string(), agent);
    }

    pub fn get(&self, agent_type: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .read()
            .get(agent_type)
            .cloned()
            .ok_or_else(|| Error::Registry(format!("Agent '{agent_type}' not found")))
    }

    pub fn types(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }
}

/// Renders a named prompt template with variables.
pub trait PromptRenderer: Send + Sync {
    fn render(&self, template: &str, vars: &Json) -> Result<String>;
}

/// Plain-text renderer: template name, free variables, then the callback list.
///
/// Used when the embedding application does not supply its own templates.
pub struct InstructionRenderer;

impl PromptRenderer for InstructionRenderer {
    fn render(&self, template: &str, vars: &Json) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(out, "<|SECTION:{template}|>");
        if let Some(obj) = vars.as_object() {
            for (key, value) in obj.iter().filter(|(k, _)| k.as_str() != "callbacks") {
                match value {
                    Json::String(s) => { let _ = writeln!(out, "{key}: {s}"); }
                    other => { let _ = writeln!(out, "{key}: {other}"); }
                }
            }
        }
        if let Some(callbacks) = vars.get("callbacks").and_then(Json::as_array) {
            let _ = writeln!(out, "\nAvailable functions:");
            for cb in callbacks {
                if let Some(text) = cb.get("usage").and_then(Json::as_str) {
                    let _ = writeln!(out, "{text}");
                }
            }
            let max_calls = vars.get("max_calls").and_then(Json::as_u64).unwrap_or(1);
            let _ = writeln!(
                out,
                "\nRespond with a JSON list of at most {max_calls} calls: [{{\"name\": ..., \"arguments\": {{...}}}}]"
            );
        }
        let _ = write!(out, "<|CLOSE_SECTION|>");
        Ok(out)
    }
}
