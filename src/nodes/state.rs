//! `state/*` nodes: named variables in one of the run scopes.
//!
//! | Scope | Lives in |
//! |-------|----------|
//! | `local` | run data of the executing graph |
//! | `parent` | run data of the state that spawned it |
//! | `shared` | the [`SharedState`] dict |
//! | `scene loop` | the map stored under `scene_loop` in the shared dict |

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::model::{PropertyField, PropertyMap, PropertyType, Socket, Value};
use crate::node::{Node, NodeContext, NodeKind, NodeStyle, NodeVerbosity};
use crate::state::{GraphState, ParentData, SharedState};
use crate::{Error, Result};

/// Shared-dict key of the scene loop scope.
pub const SCENE_LOOP_KEY: &str = "scene_loop";

const SCOPES: [&str; 4] = ["local", "parent", "shared", "scene loop"];

enum Container<'a> {
    Local(&'a GraphState),
    Parent(ParentData<'a>),
    Shared(&'a SharedState),
    SceneLoop(&'a SharedState),
}

impl<'a> Container<'a> {
    fn resolve(ctx: &NodeContext<'a>, scope: &str) -> Result<Self> {
        let state = ctx.state;
        match scope {
            "local" => Ok(Container::Local(state)),
            "parent" => state
                .parent_data()
                .map(Container::Parent)
                .ok_or_else(|| Error::input(&ctx.node.title, "scope", "no parent state to use")),
            "shared" => Ok(Container::Shared(state.shared())),
            "scene loop" => Ok(Container::SceneLoop(state.shared())),
            other => Err(Error::input(&ctx.node.title, "scope", format!("Unknown scope: {other}"))),
        }
    }

    fn scene_loop(shared: &SharedState) -> Option<PropertyMap> {
        match shared.get(SCENE_LOOP_KEY) {
            Some(Value::Map(map)) => Some(map),
            _ => {
                warn!("not inside a scene loop, using an empty scope");
                None
            }
        }
    }

    fn get(&self, name: &str) -> Option<Value> {
        match self {
            Container::Local(state) => state.data(name),
            Container::Parent(parent) => parent.get(name),
            Container::Shared(shared) => shared.get(name),
            Container::SceneLoop(shared) => Self::scene_loop(shared).and_then(|mut m| m.remove(name)),
        }
    }

    fn set(&self, name: &str, value: Value) {
        match self {
            Container::Local(state) => state.set_data(name, value),
            Container::Parent(parent) => parent.set(name, value),
            Container::Shared(shared) => shared.set(name, value),
            Container::SceneLoop(shared) => {
                if let Some(mut map) = Self::scene_loop(shared) {
                    map.insert(name.to_string(), value);
                    shared.set(SCENE_LOOP_KEY, Value::Map(map));
                }
            }
        }
    }

    fn remove(&self, name: &str) -> Option<Value> {
        match self {
            Container::Local(state) => state.take_data(name),
            Container::Parent(parent) => parent.remove(name),
            Container::Shared(shared) => shared.remove(name),
            Container::SceneLoop(shared) => {
                let mut map = Self::scene_loop(shared)?;
                let value = map.remove(name);
                shared.set(SCENE_LOOP_KEY, Value::Map(map));
                value
            }
        }
    }

    fn contains(&self, name: &str) -> bool {
        match self {
            Container::Local(state) => state.has_data(name),
            Container::Parent(parent) => parent.contains(name),
            Container::Shared(shared) => shared.contains(name),
            Container::SceneLoop(shared) => Self::scene_loop(shared).is_some_and(|m| m.contains_key(name)),
        }
    }
}

/// Variable name, scope name and the container they address.
fn target<'a>(ctx: &NodeContext<'a>) -> Result<(String, String, Container<'a>)> {
    let name = match ctx.get_input_value("name") {
        Value::String(name) if !name.is_empty() => name,
        _ => return Err(Error::input(&ctx.node.title, "name", "variable name is required")),
    };
    let scope = ctx.get_property("scope").as_str().unwrap_or("local").to_string();
    let container = Container::resolve(ctx, &scope)?;
    Ok((name, scope, container))
}

fn scope_fields() -> Vec<PropertyField> {
    vec![
        PropertyField::new("scope", PropertyType::Str, "local")
            .describe("Which scope to manipulate")
            .choices(SCOPES.into_iter().map(Value::from).collect()),
        PropertyField::new("name", PropertyType::Str, "").describe("The name of the variable to manipulate"),
    ]
}

fn state_node(registry: &str, title: &str, kind: impl NodeKind) -> Node {
    Node::new(registry, title, kind)
        .input_socket(Socket::new("name").typed("str").optional())
        .output("name", "str")
        .output("value", "any")
        .output("scope", "str")
}

// ============================================================================
// Set / Get / Unset / Has
// ============================================================================

struct SetStateKind;

#[async_trait]
impl NodeKind for SetStateKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let (name, scope, container) = target(ctx)?;
        let value = ctx.require_input("value")?;
        if ctx.state.verbosity >= NodeVerbosity::Verbose {
            debug!(name = %name, value = %value, scope = %scope, "setting state variable");
        }
        container.set(&name, value.clone());
        ctx.set_output_values([("name", Value::from(name)), ("value", value), ("scope", Value::from(scope))]);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        scope_fields()
    }
}

pub fn set_state() -> Node {
    state_node("state/SetState", "Set State", SetStateKind)
        .input("value", "any")
        .styled(NodeStyle::colors("#2e4657", "#2c3339", "F01DA"))
}

/// Reads a variable, falling back to `default` (or `None`) when unset.
struct GetStateKind;

#[async_trait]
impl NodeKind for GetStateKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let (name, scope, container) = target(ctx)?;
        let value = container.get(&name).unwrap_or_else(|| match ctx.get_input_value("default") {
            Value::Unresolved => Value::Null,
            default => default,
        });
        ctx.set_output_values([("name", Value::from(name)), ("value", value), ("scope", Value::from(scope))]);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        scope_fields()
    }
}

pub fn get_state() -> Node {
    state_node("state/GetState", "Get State", GetStateKind)
        .input_socket(Socket::new("default").optional())
        .styled(NodeStyle::colors("#44552f", "#2c3339", "F0552"))
}

struct UnsetStateKind;

#[async_trait]
impl NodeKind for UnsetStateKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let (name, scope, container) = target(ctx)?;
        let value = container.remove(&name).unwrap_or(Value::Null);
        ctx.set_output_values([("name", Value::from(name)), ("value", value), ("scope", Value::from(scope))]);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        scope_fields()
    }
}

pub fn unset_state() -> Node {
    state_node("state/UnsetState", "Unset State", UnsetStateKind)
        .styled(NodeStyle::colors("#7f2e2e", "#2c3339", "F0683"))
}

struct HasStateKind;

#[async_trait]
impl NodeKind for HasStateKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let (name, scope, container) = target(ctx)?;
        let exists = container.contains(&name);
        ctx.set_output_values([
            ("name", Value::from(name)),
            ("scope", Value::from(scope)),
            ("exists", Value::Bool(exists)),
        ]);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        scope_fields()
    }
}

pub fn has_state() -> Node {
    Node::new("state/HasState", "Has State", HasStateKind)
        .input_socket(Socket::new("name").typed("str").optional())
        .output("name", "str")
        .output("scope", "str")
        .output("exists", "bool")
}

// ============================================================================
// Counter
// ============================================================================

/// Adds `increment` to a numeric variable (starting from 0) and outputs the
/// new value. A truthy `reset` sets it back to 0 instead.
struct CounterStateKind;

#[async_trait]
impl NodeKind for CounterStateKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let (name, scope, container) = target(ctx)?;
        let value = if ctx.get_input_value("reset").is_truthy() {
            Value::Int(0)
        } else {
            let current = container.get(&name).unwrap_or(Value::Int(0));
            let increment = ctx.get_property("increment");
            match (&current, &increment) {
                (Value::Int(a), Value::Int(b)) => Value::Int(a + b),
                _ => match (current.as_float(), increment.as_float()) {
                    (Some(a), Some(b)) => Value::Float(a + b),
                    _ => {
                        return Err(Error::input(
                            &ctx.node.title,
                            "name",
                            format!("cannot increment {} by {}", current.type_name(), increment.type_name()),
                        ));
                    }
                },
            }
        };
        container.set(&name, value.clone());
        ctx.set_output_values([
            ("state", ctx.get_input_value("state")),
            ("value", value),
            ("name", Value::from(name)),
            ("scope", Value::from(scope)),
        ]);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        let mut fields = scope_fields();
        fields.push(PropertyField::new("increment", PropertyType::Int, 1).describe("The amount to increment the value by"));
        fields.push(PropertyField::new("reset", PropertyType::Bool, false).describe("If true, the value will be reset to 0"));
        fields
    }
}

pub fn counter_state() -> Node {
    Node::new("state/CounterState", "State Counter", CounterStateKind)
        .input_socket(Socket::new("state").optional())
        .input_socket(Socket::new("name").typed("str").optional())
        .input_socket(Socket::new("reset").typed("bool").optional())
        .output("state", "any")
        .output("name", "str")
        .output("value", "any")
        .output("scope", "str")
        .styled(NodeStyle::colors("#2e4657", "#2c3339", "F0199"))
}
