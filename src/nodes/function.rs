//! `core/functions/*` nodes: declaring, looking up and calling function graphs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::execution::wait_for_breakpoint;
use crate::function::{FunctionWrapper, ARGS_KEY, ARGUMENT, RESULT_KEY, RETURN};
use crate::model::{PropertyField, PropertyMap, PropertyType, Socket, Value};
use crate::node::{Node, NodeContext, NodeKind, NodeStyle};
use crate::{Error, Result};

fn function_input(ctx: &NodeContext<'_>, name: &str) -> Result<Arc<FunctionWrapper>> {
    match ctx.require_input(name)? {
        Value::Function(function) => Ok(function),
        other => Err(Error::input(
            &ctx.node.title,
            name,
            format!("expected a function, got {}", other.type_name()),
        )),
    }
}

// ============================================================================
// Declaration
// ============================================================================

/// Reads a keyword argument of the call currently running the graph.
struct ArgumentKind;

#[async_trait]
impl NodeKind for ArgumentKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let name = ctx.get_property("name");
        let name = name.as_str().unwrap_or_default();
        let value = ctx
            .state
            .data(ARGS_KEY)
            .and_then(|args| args.as_map().and_then(|m| m.get(name)).cloned());
        match value {
            Some(value) => ctx.set_output("value", value),
            None => {
                debug!(node = %ctx.node.title, argument = name, "argument not passed");
                ctx.set_deactivated("value", true);
            }
        }
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![
            PropertyField::new("name", PropertyType::Str, "").describe("Argument Name"),
            PropertyField::new("typ", PropertyType::Str, "str")
                .describe("Argument Type")
                .choices(["str", "int", "float", "bool", "any"].into_iter().map(Value::from).collect()),
        ]
    }
}

pub fn argument() -> Node {
    Node::new(ARGUMENT, "Argument", ArgumentKind)
        .output("value", "any")
        .styled(NodeStyle::colors("#2e4657", "#2c3339", "F0AE7"))
}

struct ReturnKind;

#[async_trait]
impl NodeKind for ReturnKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let value = ctx.get_input_value("value");
        ctx.state.set_data(RESULT_KEY, value.clone());
        ctx.set_output("value", value);
        Ok(())
    }
}

pub fn return_node() -> Node {
    Node::new(RETURN, "Return", ReturnKind)
        .input("value", "any")
        .output("value", "any")
        .styled(NodeStyle::colors("#2e4657", "#2c3339", "F0A60"))
}

/// Names a function graph so `GetFunction` can find it. Never scheduled.
struct DefineFunctionKind;

#[async_trait]
impl NodeKind for DefineFunctionKind {
    async fn run(&self, _ctx: &NodeContext<'_>) -> Result<()> {
        Ok(())
    }

    fn isolated(&self) -> bool {
        true
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("name", PropertyType::Str, "").describe("Function Name")]
    }
}

pub fn define_function() -> Node {
    Node::new("core/functions/DefineFunction", "Define Function", DefineFunctionKind)
        .input("nodes", "function")
        .styled(NodeStyle::colors("#573a2e", "#392f2c", "F0295"))
}

struct GetFunctionKind;

#[async_trait]
impl NodeKind for GetFunctionKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let wanted = ctx.get_property("name");
        let wanted = wanted
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::input(&ctx.node.title, "name", "function name is required"))?;

        let define = ctx
            .graph
            .nodes_by_registry("core/functions/DefineFunction")
            .find(|n| n.get_property("name").as_str() == Some(wanted))
            .ok_or_else(|| Error::input(&ctx.node.title, "name", format!("function '{wanted}' is not defined")))?;
        let source = ctx
            .graph
            .source_of(&crate::model::SocketRef::new(&define.id, "nodes"))
            .and_then(|src| ctx.graph.node(&src.node))
            .ok_or_else(|| Error::Graph(format!("function '{wanted}' has no graph connected")))?;
        let graph = source
            .subgraph()
            .ok_or_else(|| Error::Graph(format!("'{}' is not a function graph", source.title)))?;

        let wrapper = FunctionWrapper::new(Arc::clone(graph), source.properties.clone());
        ctx.set_output("fn", Value::Function(Arc::new(wrapper)));
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("name", PropertyType::Str, "").describe("Function Name")]
    }
}

pub fn get_function() -> Node {
    Node::new("core/functions/GetFunction", "Get Function", GetFunctionKind).output("fn", "function")
}

// ============================================================================
// Calls
// ============================================================================

struct CallFunctionKind;

#[async_trait]
impl NodeKind for CallFunctionKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let function = function_input(ctx, "fn")?;
        let args = match ctx.get_input_value("args") {
            Value::Map(args) => args,
            Value::Unresolved | Value::Null => PropertyMap::new(),
            other => {
                return Err(Error::input(
                    &ctx.node.title,
                    "args",
                    format!("expected a dict, got {}", other.type_name()),
                ));
            }
        };
        let result = function.call(ctx.state, args).await?;
        ctx.set_output("result", result);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("args", PropertyType::Dict, Value::Map(PropertyMap::new())).describe("Arguments")]
    }
}

pub fn call_function() -> Node {
    Node::new("core/functions/CallFunction", "Call Function", CallFunctionKind)
        .input("fn", "function")
        .input_socket(Socket::new("args").typed("dict").optional())
        .output("result", "any")
}

/// Calls a function once per item, passing the item as `argument_name`.
struct CallForEachKind;

#[async_trait]
impl NodeKind for CallForEachKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let function = function_input(ctx, "fn")?;
        let items = match ctx.require_input("items")? {
            Value::List(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(Error::input(
                    &ctx.node.title,
                    "items",
                    format!("expected a list, got {}", other.type_name()),
                ));
            }
        };
        let argument = match ctx.get_property("argument_name") {
            Value::String(name) if !name.trim().is_empty() => name,
            _ => return Err(Error::input(&ctx.node.title, "argument_name", "argument name is required")),
        };

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let args = PropertyMap::from([(argument.clone(), item)]);
            results.push(function.call(ctx.state, args).await?);
        }
        if results.is_empty() {
            warn!(node = %ctx.node.title, "no items to call the function with");
        }
        ctx.set_output("state", ctx.get_input_value("state"));
        ctx.set_output("results", Value::List(results));
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("argument_name", PropertyType::Str, "item").describe("Argument Name")]
    }
}

pub fn call_for_each() -> Node {
    Node::new("core/functions/CallForEach", "Call For Each", CallForEachKind)
        .input_socket(Socket::new("state").optional())
        .input("fn", "function")
        .input("items", "list")
        .output("state", "any")
        .output("results", "list")
}

// ============================================================================
// Debugging
// ============================================================================

/// Pauses the graph until the breakpoint is released, then passes `state` on.
struct BreakpointKind;

#[async_trait]
impl NodeKind for BreakpointKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let state = ctx.get_input_value("state");
        if ctx.get_property("active").is_truthy() {
            wait_for_breakpoint(ctx).await?;
        }
        ctx.set_output("state", state);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("active", PropertyType::Bool, true).describe("Active")]
    }
}

pub fn breakpoint() -> Node {
    Node::new("core/functions/Breakpoint", "Breakpoint", BreakpointKind)
        .input("state", "any")
        .output("state", "any")
        .styled(NodeStyle::colors("#461515", "#2c0a0a", "F03C3"))
}
