//! `focal/*` and `agents/*` nodes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::focal::{Call, Callback, Focal};
use crate::model::{PropertyField, PropertyType, Socket, Value};
use crate::node::{Node, NodeContext, NodeKind, NodeStyle};
use crate::{Error, Result};

// ============================================================================
// Focal
// ============================================================================

/// Sends a prompt to the agent's client and dispatches the returned calls
/// to the connected callbacks.
struct FocalKind;

#[async_trait]
impl NodeKind for FocalKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let title = ctx.node.title.as_str();
        let state = ctx.get_input_value("state");

        let template = ctx.require_value("template")?;
        let template = template
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::input(title, "template", "template name is required"))?
            .to_string();

        let callbacks: Vec<Arc<Callback>> = match ctx.require_input("callbacks")? {
            Value::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Callback(cb) => Ok(cb),
                    other => Err(Error::input(
                        title,
                        "callbacks",
                        format!("expected focal/callback, got {}", other.type_name()),
                    )),
                })
                .collect::<Result<_>>()?,
            Value::Callback(cb) => vec![cb],
            other => {
                return Err(Error::input(title, "callbacks", format!("expected a list, got {}", other.type_name())));
            }
        };

        let agent = match ctx.require_value("agent")? {
            Value::Agent(agent) => agent,
            other => return Err(Error::input(title, "agent", format!("expected an agent, got {}", other.type_name()))),
        };
        let client = agent
            .client()
            .ok_or_else(|| Error::input(title, "agent", format!("agent '{}' has no client", agent.agent_type())))?;

        let max_calls = ctx.require_number_input("max_calls", &["int"])?.as_int().unwrap_or(1).max(0) as usize;
        let retries = ctx.get_property("retries").as_int().unwrap_or(0).max(0) as usize;

        let mut focal = Focal::new(client, Arc::clone(&ctx.runtime().renderer), callbacks)
            .max_calls(max_calls)
            .retries(retries);
        if let Value::Map(vars) = ctx.get_input_value("template_vars") {
            for (key, value) in vars {
                focal = focal.context(&key, value.to_json());
            }
        }

        let response = focal.request(ctx.state, &template).await?;
        let calls = focal.into_calls();
        info!(node = %title, template = %template, calls = calls.len(), "focal request finished");

        ctx.state.push_calls(calls.iter().cloned());
        ctx.set_output_values([
            ("state", state),
            ("calls", Value::List(calls.into_iter().map(|c| Value::Call(Arc::new(c))).collect())),
            ("response", Value::String(response)),
        ]);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![
            PropertyField::new("template", PropertyType::Str, "").describe("Prompt template"),
            PropertyField::new("max_calls", PropertyType::Int, 1)
                .describe("Maximum number of calls to make")
                .range(0.0, 100.0, 1.0),
            PropertyField::new("retries", PropertyType::Int, 0)
                .describe("Number of retries when no call could be made")
                .range(0.0, 10.0, 1.0),
        ]
    }
}

pub fn focal() -> Node {
    Node::new("focal/Focal", "Focal", FocalKind)
        .input("state", "any")
        .input("template", "str")
        .input("callbacks", "list")
        .input("agent", "agent")
        .input_socket(Socket::new("template_vars").typed("dict").optional())
        .input_socket(Socket::new("max_calls").typed("int").optional())
        .output("state", "any")
        .output("calls", "list")
        .output("response", "str")
        .styled(NodeStyle::colors("#2e3a57", "#2c2f39", "F06A9"))
}

/// Exposes a function graph to the model under `name`.
struct CallbackKind;

#[async_trait]
impl NodeKind for CallbackKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let function = match ctx.require_input("fn")? {
            Value::Function(function) => function,
            other => {
                return Err(Error::input(&ctx.node.title, "fn", format!("expected a function, got {}", other.type_name())));
            }
        };
        let name = ctx.get_property("name");
        let name = name.as_str().filter(|s| !s.is_empty()).unwrap_or_else(|| function.name());

        let mut callback = Callback::new(name, function.clone())
            .multiple(ctx.get_property("allow_multiple_calls").is_truthy());
        callback.arguments = function.arguments();
        debug!(node = %ctx.node.title, callback = %callback.usage(), "callback built");
        ctx.set_output("callback", Value::Callback(Arc::new(callback)));
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![
            PropertyField::new("name", PropertyType::Str, "my_function").describe("Function name shown to the model"),
            PropertyField::new("allow_multiple_calls", PropertyType::Bool, false)
                .describe("Whether the model may call this more than once per request"),
        ]
    }
}

pub fn callback() -> Node {
    Node::new("focal/Callback", "AI Function Callback", CallbackKind)
        .input("fn", "function")
        .output("callback", "focal/callback")
}

/// Unpacks one call from a list, picked by name (first call when unnamed).
struct ProcessCallKind;

#[async_trait]
impl NodeKind for ProcessCallKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let calls: Vec<Arc<Call>> = match ctx.require_input("calls")? {
            Value::List(items) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Call(call) => Some(call),
                    _ => None,
                })
                .collect(),
            Value::Call(call) => vec![call],
            other => {
                return Err(Error::input(&ctx.node.title, "calls", format!("expected a list, got {}", other.type_name())));
            }
        };
        let name = ctx.get_property("name");
        let wanted = name.as_str().filter(|s| !s.is_empty());

        let Some(call) = calls.into_iter().find(|c| wanted.is_none_or(|w| c.name == w)) else {
            ctx.deactivate_outputs();
            return Ok(());
        };
        ctx.set_output_values([
            ("name", Value::from(call.name.as_str())),
            ("arguments", Value::Map(call.arguments.clone())),
            ("result", call.result.clone()),
            ("uid", Value::from(call.uid.as_str())),
            ("called", Value::Bool(call.called)),
        ]);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("name", PropertyType::Str, "").describe("Name of the call to pick")]
    }
}

pub fn process_call() -> Node {
    Node::new("focal/ProcessCall", "Process Call", ProcessCallKind)
        .input("calls", "list")
        .output("name", "str")
        .output("arguments", "dict")
        .output("result", "any")
        .output("uid", "str")
        .output("called", "bool")
}

// ============================================================================
// Agents
// ============================================================================

struct GetAgentKind;

#[async_trait]
impl NodeKind for GetAgentKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let name = ctx.get_property("agent_name");
        let name = name
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::input(&ctx.node.title, "agent_name", "agent name is required"))?;
        let agent = ctx.runtime().agents.get(name)?;
        ctx.set_output("agent", Value::Agent(agent));
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("agent_name", PropertyType::Str, "").describe("Agent type")]
    }
}

pub fn get_agent() -> Node {
    Node::new("agents/GetAgent", "Get Agent", GetAgentKind).output("agent", "agent")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::run;
    use crate::graph::Graph;
    use crate::model::PropertyMap;
    use crate::registry::global;
    use crate::state::{GraphState, Runtime};

    #[tokio::test]
    async fn test_process_call_picks_by_name() {
        let mut a = Call::new("add", PropertyMap::new());
        a.called = true;
        let b = Call::new("remove", PropertyMap::from([("name".to_string(), Value::from("X"))]));
        let calls = Value::List(vec![Value::Call(Arc::new(a)), Value::Call(Arc::new(b))]);

        let mut graph = Graph::new("g");
        let process = graph.add_node(global().create("focal/ProcessCall").unwrap());
        graph.set_node_property(&process, "calls", calls).unwrap();
        graph.set_node_property(&process, "name", Value::from("remove")).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        assert_eq!(inner.output(&process, "name"), Value::from("remove"));
        assert_eq!(inner.output(&process, "called"), Value::Bool(false));
        assert_eq!(inner.output(&process, "arguments").as_map().unwrap().get("name"), Some(&Value::from("X")));
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let mut graph = Graph::new("g");
        let get = graph.add_node(global().create("agents/GetAgent").unwrap());
        graph.set_node_property(&get, "agent_name", Value::from("narrator")).unwrap();
        let root = GraphState::root(Runtime::default());
        let err = run(&Arc::new(graph), &root).await.unwrap_err();
        assert!(matches!(err, Error::Registry(_)));
    }
}
