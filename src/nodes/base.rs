//! `core/*` nodes: module plumbing, routing and loop/error control.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::execution::{dispatch_event, run};
use crate::graph::{INPUT, MODULE_PROPERTY, OUTPUT, STAGE};
use crate::model::{ErrorInfo, PropertyField, PropertyMap, PropertyType, Socket, Value};
use crate::node::{Node, NodeContext, NodeKind, NodeStyle, NodeVerbosity};
use crate::registry;
use crate::signals;
use crate::state::{GraphState, SharedState};
use crate::{Error, Flow, Result};

/// Source of `input` is connected and currently active.
pub(crate) fn source_active(ctx: &NodeContext<'_>, input: &str) -> bool {
    ctx.source(input).is_some_and(|src| {
        !ctx.state.socket_deactivated(src) && !ctx.state.socket_value(src).is_unresolved()
    })
}

// ============================================================================
// Module plumbing
// ============================================================================

struct InputKind;

#[async_trait]
impl NodeKind for InputKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        // seeded by the module run; nothing seeded means nothing flows
        if ctx.get_output("value").is_unresolved() {
            ctx.set_deactivated("value", true);
        }
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![
            PropertyField::new("input_type", PropertyType::Str, "any").describe("Input Type"),
            PropertyField::new("input_name", PropertyType::Str, "state").describe("Input Name"),
            PropertyField::new("input_optional", PropertyType::Bool, false).describe("Input Optional"),
            PropertyField::new("input_group", PropertyType::Str, "").describe("Input Group"),
            PropertyField::new("num", PropertyType::Int, 0).describe("Number"),
        ]
    }
}

pub fn input() -> Node {
    Node::new(INPUT, "Input Socket", InputKind)
        .output("value", "any")
        .styled(NodeStyle::colors("#312e57", "#2d2c39", "F02FA"))
}

struct OutputKind;

#[async_trait]
impl NodeKind for OutputKind {
    async fn run(&self, _ctx: &NodeContext<'_>) -> Result<()> {
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![
            PropertyField::new("output_type", PropertyType::Str, "any").describe("Output Type"),
            PropertyField::new("output_name", PropertyType::Str, "state").describe("Output Name"),
            PropertyField::new("num", PropertyType::Int, 0).describe("Number"),
        ]
    }
}

pub fn output() -> Node {
    Node::new(OUTPUT, "Output Socket", OutputKind)
        .input_socket(Socket::new("value").optional())
        .styled(NodeStyle::colors("#30572e", "#2d392c", "F0207"))
}

struct ModulePropertyKind;

#[async_trait]
impl NodeKind for ModulePropertyKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let name = ctx.get_property("property_name");
        let name = name
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::input(&ctx.node.title, "property_name", "property name is required"))?;
        let raw = ctx
            .state
            .module_property(name)
            .filter(|v| !v.is_unresolved())
            .unwrap_or_else(|| ctx.get_property("default"));

        let declared = ctx.get_property("property_type");
        let kind: PropertyType = declared
            .as_str()
            .and_then(|t| serde_json::from_value(json!(t)).ok())
            .unwrap_or(PropertyType::Any);
        let value = kind.coerce(&raw).ok_or_else(|| {
            Error::input(&ctx.node.title, name, format!("{raw} is not a valid {}", declared.as_str().unwrap_or("value")))
        })?;
        ctx.set_output("value", value);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![
            PropertyField::new("property_name", PropertyType::Str, "").describe("Property Name"),
            PropertyField::new("property_type", PropertyType::Str, "str").describe("Property Type"),
            PropertyField::new("default", PropertyType::Any, Value::Null).describe("Default Value"),
            PropertyField::new("num", PropertyType::Int, 0),
        ]
    }
}

pub fn module_property() -> Node {
    Node::new(MODULE_PROPERTY, "Module Property", ModulePropertyKind).output("value", "any")
}

// ============================================================================
// Routing
// ============================================================================

struct RouteKind;

#[async_trait]
impl NodeKind for RouteKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        ctx.set_output("value", ctx.get_input_value("value"));
        Ok(())
    }
}

/// Runs a registered module by name in a state of its own.
///
/// The module gets a fresh shared dict (creative mode carried over) so it
/// cannot disturb the caller's keys. Exactly one of `done`, `failed` and
/// `cancelled` is set.
struct RunModuleKind;

#[async_trait]
impl NodeKind for RunModuleKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let module = ctx.require_input("module")?;
        let Some(name) = module.as_str().filter(|s| !s.is_empty()) else {
            return Err(Error::input(&ctx.node.title, "module", "module registry name is required"));
        };
        if ctx.graph.registry == name {
            return Err(Error::input(
                &ctx.node.title,
                "module",
                format!("Infinite loop detected. Running module from within itself: {name}"),
            ));
        }
        let graph = Arc::new(registry::global().create_graph(name)?);

        let shared = SharedState::new();
        shared.set_creative_mode(ctx.shared().creative_mode());
        let isolated = GraphState::with_shared(Arc::clone(ctx.state.runtime()), Arc::new(shared))
            .with_verbosity(ctx.state.verbosity);
        if ctx.state.verbosity >= NodeVerbosity::Verbose {
            debug!(node = %ctx.node.title, module = name, "running module");
        }

        match run(&graph, &isolated).await {
            Ok(_) => {
                info!(module = name, "module execution complete");
                ctx.set_output("done", Value::Bool(true));
                Ok(())
            }
            Err(Error::Cancelled) => {
                info!(module = name, "module execution was cancelled");
                ctx.set_output("cancelled", Value::Bool(true));
                Ok(())
            }
            Err(e) if e.is_passthrough() => {
                debug!(module = name, error = %e, "module raised a control signal");
                ctx.set_output("done", Value::Bool(true));
                Err(e)
            }
            Err(e) => {
                error!(module = name, error = %e, "error running module");
                ctx.set_output("failed", Value::from(e.to_string()));
                Err(Error::Graph(format!("Error running module: {e}")))
            }
        }
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("module", PropertyType::Str, "").describe("Registry name of the module to run")]
    }
}

pub fn run_module() -> Node {
    Node::new("core/RunModule", "Run Module", RunModuleKind)
        .input_socket(Socket::new("module").typed("str").optional())
        .output("done", "bool")
        .output("failed", "str")
        .output("cancelled", "bool")
}

pub fn route() -> Node {
    Node::new("core/Route", "Route", RouteKind).input("value", "any").output("value", "any")
}

struct WatchKind;

#[async_trait]
impl NodeKind for WatchKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let value = ctx.get_input_value("value");
        if ctx.shared().creative_mode() {
            debug!(node = %ctx.node.title, value = %value, "watch");
        }
        ctx.set_output("value", value);
        Ok(())
    }
}

pub fn watch() -> Node {
    Node::new("core/Watch", "Watch", WatchKind)
        .input("value", "any")
        .output("value", "any")
        .styled(NodeStyle::colors("#2e4657", "#2c3339", "F06D0"))
}

const STAGE_SOCKETS: [&str; 4] = ["state", "state_b", "state_c", "state_d"];

/// Pass-through whose `stage` property orders the chain it sits in.
struct StageKind;

#[async_trait]
impl NodeKind for StageKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        for name in STAGE_SOCKETS {
            if ctx.is_connected(name) {
                ctx.set_output(name, ctx.get_input_value(name));
            } else if name == "state" {
                ctx.set_output(name, Value::Bool(true));
            } else {
                ctx.set_deactivated(name, true);
            }
        }
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("stage", PropertyType::Int, 0).describe("Stage").range(0.0, f64::MAX, 1.0)]
    }
}

pub fn stage() -> Node {
    STAGE_SOCKETS
        .iter()
        .fold(Node::new(STAGE, "Stage", StageKind), |node, name| {
            node.input_socket(Socket::new(*name).optional()).output(name, "any")
        })
        .styled(NodeStyle::colors("#343055", "#2c2c38", "F0AA8"))
}

/// Activates `yes` for truthy input, `no` otherwise.
struct SwitchKind;

#[async_trait]
impl NodeKind for SwitchKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let value = ctx.get_input_value("value");
        let result = value.is_truthy();
        let value = if ctx.get_property("pass_through").is_truthy() { value } else { Value::Bool(true) };

        let (active, inactive) = if result { ("yes", "no") } else { ("no", "yes") };
        ctx.set_output(active, value);
        ctx.set_output(inactive, Value::Unresolved);
        ctx.set_deactivated(active, false);
        ctx.set_deactivated(inactive, true);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("pass_through", PropertyType::Bool, true)
            .describe("If True, the value will be passed through to the output, otherwise True will be passed through")]
    }
}

pub fn switch() -> Node {
    Node::new("core/Switch", "Switch", SwitchKind).input("value", "any").output("yes", "any").output("no", "any")
}

const OR_INPUTS: [&str; 4] = ["a", "b", "c", "d"];

/// Forwards the first of `a`..`d` that carries a value. Runs as soon as any
/// one of them is available.
struct OrRouterKind;

#[async_trait]
impl NodeKind for OrRouterKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let active: Vec<Value> = OR_INPUTS
            .iter()
            .filter(|name| source_active(ctx, name))
            .map(|name| ctx.get_input_value(name))
            .collect();
        let result = active.iter().any(Value::is_truthy);
        match active.into_iter().next() {
            Some(value) => ctx.set_output("value", value),
            None => ctx.set_deactivated("value", true),
        }
        ctx.set_output("result", Value::Bool(result));
        Ok(())
    }
}

pub fn or_router() -> Node {
    OR_INPUTS
        .iter()
        .fold(Node::new("core/ORRouter", "OR Router", OrRouterKind), |node, name| {
            node.input_socket(Socket::new(*name).group("flags"))
        })
        .output("value", "any")
        .output("result", "bool")
}

/// Routes `value` (or `true`) to `yes` when every connected flag of
/// `a`..`d` is truthy, to `no` otherwise. Unconnected flags are ignored.
struct AndRouterKind;

#[async_trait]
impl NodeKind for AndRouterKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let flags: Vec<bool> = OR_INPUTS
            .iter()
            .filter(|name| ctx.is_connected(name))
            .map(|name| ctx.get_input_value(name).is_truthy())
            .collect();
        let result = !flags.is_empty() && flags.iter().all(|&f| f);
        if ctx.state.verbosity == NodeVerbosity::Verbose {
            debug!(node = %ctx.node.title, ?flags, result, "and router");
        }
        let value = match ctx.get_input_value("value") {
            Value::Unresolved => Value::Bool(true),
            value => value,
        };
        let (active, inactive) = if result { ("yes", "no") } else { ("no", "yes") };
        ctx.set_output(active, value);
        ctx.set_output(inactive, Value::Unresolved);
        ctx.set_deactivated(active, false);
        ctx.set_deactivated(inactive, true);
        Ok(())
    }
}

pub fn and_router() -> Node {
    OR_INPUTS
        .iter()
        .fold(Node::new("core/ANDRouter", "AND Router", AndRouterKind), |node, name| {
            node.input_socket(Socket::new(*name).typed("bool").group("flags"))
        })
        .input_socket(Socket::new("value").optional())
        .output("yes", "any")
        .output("no", "any")
}

const CASES: [(&str, &str); 4] = [("case_a", "a"), ("case_b", "b"), ("case_c", "c"), ("case_d", "d")];

/// Routes `value` to the first output whose case matches it exactly.
///
/// With `attribute_name` set the value's map entry of that name is compared
/// instead of the value itself.
struct CaseKind;

fn case_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        other => other.to_string(),
    }
}

#[async_trait]
impl NodeKind for CaseKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let value = ctx.get_input_value("value");
        let attribute = ctx.get_property("attribute_name");
        let compare_to = match attribute.as_str().map(str::trim).filter(|a| !a.is_empty()) {
            Some(attribute) => match value.as_map().and_then(|m| m.get(attribute)) {
                Some(field) => case_key(field),
                None => {
                    return Err(Error::input(
                        &ctx.node.title,
                        "value",
                        format!("{} has no attribute '{attribute}'", value.type_name()),
                    ));
                }
            },
            None => case_key(&value),
        };

        let matched = CASES.iter().find(|(case, _)| ctx.get_property(case).as_str() == Some(compare_to.as_str()));
        for (_, output) in CASES {
            ctx.set_deactivated(output, true);
        }
        if let Some((_, output)) = matched {
            ctx.set_output(output, value);
            ctx.set_deactivated(output, false);
        }
        debug!(node = %ctx.node.title, compare_to = %compare_to, matched = ?matched.map(|(_, o)| o), "case");
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        std::iter::once(
            PropertyField::new("attribute_name", PropertyType::Str, "")
                .describe("The attribute name to check for the value"),
        )
        .chain(CASES.iter().map(|(case, output)| {
            PropertyField::new(*case, PropertyType::Str, "")
                .describe(format!("The value to compare to for case {}", output.to_uppercase()))
        }))
        .collect()
    }
}

pub fn case() -> Node {
    CASES
        .iter()
        .fold(Node::new("core/Case", "Case", CaseKind).input("value", "any"), |node, (_, output)| {
            node.output(output, "any")
        })
}

/// Outputs the first of `a`..`d` that is set: not unresolved, `None` or `false`.
struct CoallesceKind;

#[async_trait]
impl NodeKind for CoallesceKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let result = OR_INPUTS
            .iter()
            .map(|name| ctx.get_input_value(name))
            .find(|v| !matches!(v, Value::Unresolved | Value::Null | Value::Bool(false)))
            .unwrap_or(Value::Unresolved);
        ctx.set_output("value", result);
        Ok(())
    }
}

pub fn coallesce() -> Node {
    OR_INPUTS
        .iter()
        .fold(Node::new("core/Coallesce", "Coallesce", CoallesceKind), |node, name| {
            node.input_socket(Socket::new(*name).optional())
        })
        .output("value", "any")
}

struct MakeBoolKind;

#[async_trait]
impl NodeKind for MakeBoolKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        ctx.set_output("value", Value::Bool(ctx.get_property("value").is_truthy()));
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("value", PropertyType::Bool, true).describe("The boolean value")]
    }
}

pub fn make_bool() -> Node {
    Node::new("core/MakeBool", "Make Bool", MakeBoolKind).output("value", "bool")
}

/// Replaces an unresolved (and optionally `None`) value with `default`.
struct ApplyDefaultKind;

#[async_trait]
impl NodeKind for ApplyDefaultKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let value = ctx.get_input_value("value");
        let default = ctx.require_input("default")?;
        let apply = match value {
            Value::Unresolved => ctx.get_property("apply_on_unresolved").is_truthy(),
            Value::Null => ctx.get_property("apply_on_none").is_truthy(),
            _ => false,
        };
        ctx.set_output("value", if apply { default } else { value });
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![
            PropertyField::new("apply_on_none", PropertyType::Bool, false)
                .describe("If True, the default will be applied if the value is None"),
            PropertyField::new("apply_on_unresolved", PropertyType::Bool, true)
                .describe("If True, the default will be applied if the value is UNRESOLVED"),
        ]
    }
}

pub fn apply_default() -> Node {
    Node::new("core/ApplyDefault", "Apply Default", ApplyDefaultKind)
        .input_socket(Socket::new("value").optional())
        .input("default", "any")
        .output("value", "any")
}

struct MakeValueKind;

#[async_trait]
impl NodeKind for MakeValueKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        ctx.set_output("value", ctx.get_property("value"));
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("value", PropertyType::Any, Value::Null).describe("Value")]
    }
}

pub fn make_value() -> Node {
    Node::new("core/MakeValue", "Make Value", MakeValueKind).output("value", "any")
}

struct InvertKind;

#[async_trait]
impl NodeKind for InvertKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        ctx.set_output("value", Value::Bool(!ctx.get_input_value("value").is_truthy()));
        Ok(())
    }
}

pub fn invert() -> Node {
    Node::new("core/Invert", "Invert", InvertKind).input("value", "bool").output("value", "bool")
}

// ============================================================================
// Loop control
// ============================================================================

struct FlowKind(Flow);

#[async_trait]
impl NodeKind for FlowKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        debug!(node = %ctx.node.title, flow = ?self.0, "loop control");
        Err(Error::Flow(self.0))
    }
}

pub fn loop_break() -> Node {
    Node::new("core/LoopBreak", "Break Loop", FlowKind(Flow::Break)).input("state", "any")
}

pub fn loop_continue() -> Node {
    Node::new("core/LoopContinue", "Continue Loop", FlowKind(Flow::Continue)).input("state", "any")
}

const STOP_EXCEPTIONS: [(&str, Flow); 5] = [
    ("StopGraphExecution", Flow::StopGraph),
    ("StopModule", Flow::StopModule),
    ("LoopBreak", Flow::Break),
    ("LoopContinue", Flow::Continue),
    ("LoopExit", Flow::Exit),
];

/// Raises the flow signal named by `exception`.
struct StopKind;

#[async_trait]
impl NodeKind for StopKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let exception = ctx.require_input("exception")?;
        // lets Stage nodes chain onto this one
        ctx.set_output("state", ctx.get_input_value("state"));
        let flow = STOP_EXCEPTIONS
            .iter()
            .find(|(name, _)| exception.as_str() == Some(*name))
            .map(|(_, flow)| *flow)
            .ok_or_else(|| Error::input(&ctx.node.title, "exception", format!("Unknown exception: {exception}")))?;
        debug!(node = %ctx.node.title, ?flow, "stop");
        Err(Error::Flow(flow))
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("exception", PropertyType::Str, "StopGraphExecution")
            .describe("Exception")
            .choices(STOP_EXCEPTIONS.iter().map(|(name, _)| Value::from(*name)).collect())]
    }
}

pub fn stop() -> Node {
    Node::new("raise/Stop", "Stop", StopKind)
        .input("state", "any")
        .input_socket(Socket::new("exception").typed("str").optional())
        .output("state", "any")
        .styled(NodeStyle::colors("#111", "#401a1a", "F0028"))
}

// ============================================================================
// Errors
// ============================================================================

/// Hands errors raised by other nodes of its graph to a function.
///
/// The function receives the error as argument `exc`; a truthy return value
/// marks the error as handled.
struct ErrorHandlerKind;

#[async_trait]
impl NodeKind for ErrorHandlerKind {
    async fn run(&self, _ctx: &NodeContext<'_>) -> Result<()> {
        Ok(())
    }

    fn isolated(&self) -> bool {
        true
    }

    fn catches_errors(&self) -> bool {
        true
    }

    async fn catch(&self, ctx: &NodeContext<'_>, error: &Error) -> Result<bool> {
        info!(node = %ctx.node.title, error = %error, "error caught");
        let Some(source) = ctx.source("fn") else {
            warn!(node = %ctx.node.title, "error handler has no function connected");
            return Ok(false);
        };
        if let Some(fn_node) = ctx.graph.node(&source.node) {
            fn_node.kind().run(&NodeContext::new(fn_node, ctx.graph, ctx.state)).await?;
        }
        let Value::Function(function) = ctx.get_input_value("fn") else {
            error!(node = %ctx.node.title, "fn did not produce a function");
            return Ok(false);
        };
        let args = PropertyMap::from([("exc".to_string(), Value::Error(ErrorInfo::from(error)))]);
        let caught = function.call(ctx.state, args).await?;
        debug!(node = %ctx.node.title, result = %caught, "error handler result");
        Ok(caught.is_truthy())
    }
}

pub fn error_handler() -> Node {
    Node::new("core/ErrorHandler", "Error Handler", ErrorHandlerKind)
        .input("fn", "function")
        .styled(NodeStyle::colors("#461515", "#2c0a0a", "F05D6"))
}

struct UnpackExceptionKind;

#[async_trait]
impl NodeKind for UnpackExceptionKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        match ctx.get_input_value("exc") {
            Value::Error(info) => {
                ctx.set_output_values([("name", Value::from(info.name)), ("message", Value::from(info.message))]);
                Ok(())
            }
            other => Err(Error::input(
                &ctx.node.title,
                "exc",
                format!("expected an error, got {}", other.type_name()),
            )),
        }
    }
}

pub fn unpack_exception() -> Node {
    Node::new("core/functions/UnpackException", "Unpack Exception", UnpackExceptionKind)
        .input("exc", "error")
        .output("name", "str")
        .output("message", "str")
}

// ============================================================================
// Signals
// ============================================================================

/// Publishes `event_name` on the bus and dispatches it to the graph's
/// matching `Listen` modules.
struct TriggerKind;

#[async_trait]
impl NodeKind for TriggerKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let name = ctx.get_input_value("event_name");
        let Some(name) = name.as_str().filter(|s| !s.is_empty()) else {
            error!(node = %ctx.node.title, "event name not set");
            return Ok(());
        };
        let value = ctx.get_input_value("trigger");
        let event = Value::Map(
            [("name".to_string(), Value::from(name)), ("value".to_string(), value)].into_iter().collect(),
        );

        ctx.state.bus().publish(name, event.to_json());
        let listeners = dispatch_event(ctx.graph, ctx.state, name, event.clone()).await?;
        debug!(node = %ctx.node.title, event = name, listeners, "event triggered");
        ctx.set_output("event", event);
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![PropertyField::new("event_name", PropertyType::Str, "").describe("Event to trigger")]
    }
}

pub fn trigger() -> Node {
    Node::new("core/Trigger", "Trigger Event", TriggerKind)
        .input("trigger", "any")
        .input_socket(Socket::new("event_name").typed("str").optional())
        .output("event", "event")
}

/// Publishes a status message on the bus.
struct EmitStatusKind;

#[async_trait]
impl NodeKind for EmitStatusKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let message = ctx.require_input("message")?;
        let status = ctx.require_input("status")?;
        let mut payload = json!({"status": status.to_json(), "message": message.to_json()});
        if ctx.get_input_value("as_scene_message") == Value::Bool(true) {
            payload["data"] = json!({"as_scene_message": true});
        }
        ctx.state.bus().publish(signals::STATUS, payload);
        ctx.set_output("emitted", Value::Bool(true));
        Ok(())
    }

    fn fields(&self) -> Vec<PropertyField> {
        vec![
            PropertyField::new("message", PropertyType::Str, "").describe("The message text to emit"),
            PropertyField::new("status", PropertyType::Str, "info")
                .describe("The status of the message")
                .choices(STATUSES.into_iter().map(Value::from).collect()),
            PropertyField::new("as_scene_message", PropertyType::Bool, false)
                .describe("Whether to emit the message as a scene message"),
        ]
    }
}

const STATUSES: [&str; 5] = ["busy", "error", "info", "success", "warning"];

pub fn emit_status() -> Node {
    Node::new("event/EmitStatus", "Emit Status", EmitStatusKind)
        .input_socket(Socket::new("message").typed("str").optional())
        .input_socket(Socket::new("status").typed("str").optional())
        .input_socket(Socket::new("as_scene_message").typed("bool").optional())
        .output("emitted", "bool")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::run;
    use crate::graph::Graph;
    use crate::graph::flat::{export_graph, ExportMode};
    use crate::node::NodeId;
    use crate::registry::global;
    use crate::state::Runtime;

    fn create(name: &str) -> Node {
        global().create(name).unwrap()
    }

    #[tokio::test]
    async fn test_switch_deactivates_other_branch() {
        let mut graph = Graph::new("g");
        let make = graph.add_node(create("core/MakeValue"));
        graph.set_node_property(&make, "value", Value::from("")).unwrap();
        let switch = graph.add_node(create("core/Switch"));
        let yes = graph.add_node(create("core/Watch"));
        let no = graph.add_node(create("core/Watch"));
        graph.connect((&make, "value"), (&switch, "value")).unwrap();
        graph.connect((&switch, "yes"), (&yes, "value")).unwrap();
        graph.connect((&switch, "no"), (&no, "value")).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        assert_eq!(inner.output(&no, "value"), Value::from(""));
        assert!(inner.output(&yes, "value").is_unresolved());
    }

    #[tokio::test]
    async fn test_module_property_coerces() {
        let mut graph = Graph::new("g");
        let prop = graph.add_node(create(MODULE_PROPERTY));
        graph.set_node_property(&prop, "property_name", Value::from("count")).unwrap();
        graph.set_node_property(&prop, "property_type", Value::from("int")).unwrap();
        graph.set_node_property(&prop, "default", Value::from("7")).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        assert_eq!(inner.output(&prop, "value"), Value::Int(7));
    }

    #[tokio::test]
    async fn test_invert_and_stage_defaults() {
        let mut graph = Graph::new("g");
        let stage = graph.add_node(create(STAGE));
        let invert = graph.add_node(create("core/Invert"));
        graph.connect((&stage, "state"), (&invert, "value")).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        assert_eq!(inner.output(&stage, "state"), Value::Bool(true));
        assert_eq!(inner.output(&invert, "value"), Value::Bool(false));
    }

    #[tokio::test]
    async fn test_trigger_publishes() {
        let mut graph = Graph::new("g");
        let make = graph.add_node(create("core/MakeValue"));
        graph.set_node_property(&make, "value", Value::from(3)).unwrap();
        let trigger = graph.add_node(create("core/Trigger"));
        graph.set_node_property(&trigger, "event_name", Value::from("player_moved")).unwrap();
        graph.connect((&make, "value"), (&trigger, "trigger")).unwrap();

        let root = GraphState::root(Runtime::default());
        let mut rx = root.bus().subscribe_to("player_moved");
        run(&Arc::new(graph), &root).await.unwrap();
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.payload, json!({"name": "player_moved", "value": 3}));
    }

    fn flag(graph: &mut Graph, value: Value) -> NodeId {
        let make = graph.add_node(create("core/MakeValue"));
        graph.set_node_property(&make, "value", value).unwrap();
        make
    }

    #[tokio::test]
    async fn test_and_router_needs_every_connected_flag() {
        for (flags, routed) in [(vec![true, true], "yes"), (vec![true, false], "no")] {
            let mut graph = Graph::new("g");
            let router = graph.add_node(create("core/ANDRouter"));
            for (value, input) in flags.into_iter().zip(["a", "c"]) {
                let make = flag(&mut graph, Value::Bool(value));
                graph.connect((&make, "value"), (&router, input)).unwrap();
            }
            let yes = graph.add_node(create("core/Watch"));
            let no = graph.add_node(create("core/Watch"));
            graph.connect((&router, "yes"), (&yes, "value")).unwrap();
            graph.connect((&router, "no"), (&no, "value")).unwrap();

            let root = GraphState::root(Runtime::default());
            let inner = run(&Arc::new(graph), &root).await.unwrap();
            let (hit, miss) = if routed == "yes" { (yes, no) } else { (no, yes) };
            assert_eq!(inner.output(&hit, "value"), Value::Bool(true), "{routed}");
            assert!(inner.output(&miss, "value").is_unresolved(), "{routed}");
        }
    }

    #[tokio::test]
    async fn test_case_routes_matching_attribute() {
        let mut graph = Graph::new("g");
        let make = flag(&mut graph, Value::from(json!({"mood": "angry"})));
        let case = graph.add_node(create("core/Case"));
        graph.set_node_property(&case, "attribute_name", Value::from("mood")).unwrap();
        graph.set_node_property(&case, "case_a", Value::from("calm")).unwrap();
        graph.set_node_property(&case, "case_b", Value::from("angry")).unwrap();
        graph.connect((&make, "value"), (&case, "value")).unwrap();
        let a = graph.add_node(create("core/Watch"));
        let b = graph.add_node(create("core/Watch"));
        graph.connect((&case, "a"), (&a, "value")).unwrap();
        graph.connect((&case, "b"), (&b, "value")).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        assert_eq!(inner.output(&b, "value"), Value::from(json!({"mood": "angry"})));
        assert!(inner.output(&a, "value").is_unresolved());
    }

    #[tokio::test]
    async fn test_coallesce_bool_and_default() {
        let mut graph = Graph::new("g");
        let coallesce = graph.add_node(create("core/Coallesce"));
        let off = flag(&mut graph, Value::Bool(false));
        let zero = flag(&mut graph, Value::Int(0));
        graph.connect((&off, "value"), (&coallesce, "a")).unwrap();
        graph.connect((&zero, "value"), (&coallesce, "b")).unwrap();

        let make_bool = graph.add_node(create("core/MakeBool"));
        let none = flag(&mut graph, Value::Null);
        let fallback = flag(&mut graph, Value::from("fallback"));
        let apply = graph.add_node(create("core/ApplyDefault"));
        graph.set_node_property(&apply, "apply_on_none", Value::Bool(true)).unwrap();
        graph.connect((&none, "value"), (&apply, "value")).unwrap();
        graph.connect((&fallback, "value"), (&apply, "default")).unwrap();
        let keep = graph.add_node(create("core/ApplyDefault"));
        graph.connect((&none, "value"), (&keep, "value")).unwrap();
        graph.connect((&fallback, "value"), (&keep, "default")).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        assert_eq!(inner.output(&coallesce, "value"), Value::Int(0));
        assert_eq!(inner.output(&make_bool, "value"), Value::Bool(true));
        assert_eq!(inner.output(&apply, "value"), Value::from("fallback"));
        assert_eq!(inner.output(&keep, "value"), Value::Null);
    }

    #[tokio::test]
    async fn test_stop_flow_signals() {
        let mut graph = Graph::new("g");
        let make = flag(&mut graph, Value::Int(1));
        let stop = graph.add_node(create("raise/Stop"));
        graph.connect((&make, "value"), (&stop, "state")).unwrap();
        let after = graph.add_node(create("core/Watch"));
        graph.connect((&stop, "state"), (&after, "value")).unwrap();

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph.clone()), &root).await.unwrap();
        assert!(inner.output(&after, "value").is_unresolved());

        graph.set_node_property(&stop, "exception", Value::from("LoopBreak")).unwrap();
        let err = run(&Arc::new(graph.clone()), &root).await.unwrap_err();
        assert!(matches!(err, Error::Flow(Flow::Break)), "{err}");

        graph.set_node_property(&stop, "exception", Value::from("Explode")).unwrap();
        let err = run(&Arc::new(graph), &root).await.unwrap_err();
        assert!(matches!(err, Error::InputValue { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_stop_module_leaves_outer_graph_running() {
        let mut module = Graph::new("Stops");
        let make = flag(&mut module, Value::Int(1));
        let stop = module.add_node(create("raise/Stop"));
        module.set_node_property(&stop, "exception", Value::from("StopModule")).unwrap();
        module.connect((&make, "value"), (&stop, "state")).unwrap();

        let mut graph = Graph::new("g");
        graph.add_node(module.into_node());
        let after = flag(&mut graph, Value::from("still here"));

        let root = GraphState::root(Runtime::default());
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        assert_eq!(inner.output(&after, "value"), Value::from("still here"));
    }

    fn register_status_module(name: &str, message: Option<&str>) {
        let mut module = Graph::new("Status Module").with_registry(name);
        let emit = module.add_node(create("event/EmitStatus"));
        match message {
            Some(message) => {
                module.set_node_property(&emit, "message", Value::from(message)).unwrap();
                let touched = flag(&mut module, Value::Bool(true));
                let set = module.add_node(create("state/SetState"));
                module.set_node_property(&set, "name", Value::from("touched")).unwrap();
                module.set_node_property(&set, "scope", Value::from("shared")).unwrap();
                module.connect((&touched, "value"), (&set, "value")).unwrap();
            }
            // an unnamed GetState fails the run
            None => {
                module.add_node(create("state/GetState"));
            }
        }
        global().register_module(export_graph(&module, ExportMode::Full)).unwrap();
    }

    #[tokio::test]
    async fn test_run_module_isolates_shared_state() {
        register_status_module("runmodule/Greeting", Some("hello"));
        let mut graph = Graph::new("g");
        let runner = graph.add_node(create("core/RunModule"));
        graph.set_node_property(&runner, "module", Value::from("runmodule/Greeting")).unwrap();

        let root = GraphState::root(Runtime::default());
        root.shared().set_creative_mode(true);
        let mut status = root.bus().subscribe_to(signals::STATUS);
        let inner = run(&Arc::new(graph), &root).await.unwrap();

        assert_eq!(inner.output(&runner, "done"), Value::Bool(true));
        assert!(inner.output(&runner, "failed").is_unresolved());
        let signal = status.try_recv().unwrap();
        assert_eq!(signal.payload, json!({"status": "info", "message": "hello"}));
        assert!(!root.shared().contains("touched"));
    }

    #[tokio::test]
    async fn test_run_module_failure_and_self_reference() {
        register_status_module("runmodule/Broken", None);
        let mut graph = Graph::new("g").with_registry("runmodule/Outer");
        let runner = graph.add_node(create("core/RunModule"));
        graph.set_node_property(&runner, "module", Value::from("runmodule/Broken")).unwrap();

        let root = GraphState::root(Runtime::default());
        let err = run(&Arc::new(graph.clone()), &root).await.unwrap_err();
        assert!(matches!(err, Error::Graph(ref m) if m.starts_with("Error running module")), "{err}");

        graph.set_node_property(&runner, "module", Value::from("runmodule/Outer")).unwrap();
        let err = run(&Arc::new(graph), &root).await.unwrap_err();
        assert!(err.to_string().contains("Infinite loop"), "{err}");
    }

    #[tokio::test]
    async fn test_emit_status_flags_scene_message() {
        let mut graph = Graph::new("g");
        let emit = graph.add_node(create("event/EmitStatus"));
        graph.set_node_property(&emit, "message", Value::from("saved")).unwrap();
        graph.set_node_property(&emit, "status", Value::from("success")).unwrap();
        graph.set_node_property(&emit, "as_scene_message", Value::Bool(true)).unwrap();

        let root = GraphState::root(Runtime::default());
        let mut status = root.bus().subscribe_to(signals::STATUS);
        let inner = run(&Arc::new(graph), &root).await.unwrap();
        assert_eq!(inner.output(&emit, "emitted"), Value::Bool(true));
        assert_eq!(
            status.try_recv().unwrap().payload,
            json!({"status": "success", "message": "saved", "data": {"as_scene_message": true}})
        );
    }
}
