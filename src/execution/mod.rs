//! Graph execution engine.
//!
//! Runs a [`Graph`] against a [`GraphState`]: nodes are scheduled by
//! [`schedule`], executed one at a time, and their outputs published into
//! the state's socket table. Sub-graphs run as module nodes with their own
//! child state; loops re-run their body until a [`Flow`] signal or exit
//! condition ends them.
//!
//! | Entry point | Purpose |
//! |-------------|---------|
//! | [`run`] | run a graph to completion beneath a state |
//! | [`run_with`] | same, with module inputs/properties/run data seeded |
//! | [`execute_to_node`] | run only what a target node depends on |
//! | [`dispatch_event`] | trigger the `Listen` modules of a graph |

pub mod schedule;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::function::FunctionWrapper;
use crate::graph::{BaseType, Graph};
use crate::model::{ErrorInfo, PropertyMap, Socket, SocketRef, Value};
use crate::node::{NodeContext, NodeId, NodeKind, NodeVerbosity};
use crate::signals;
use crate::state::{GraphState, SharedState};
use crate::{Error, Flow, Result};

use self::schedule::{ancestors, Schedule};

/// Run-data key under which the last caught error is stored.
pub const ERROR_KEY: &str = "__error";
/// Run-data key holding the event of a `Listen` dispatch.
pub const EVENT_KEY: &str = "event";

// ============================================================================
// Hooks
// ============================================================================

/// Invoked with every non-passthrough error that escapes a graph's nodes.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Return `true` to swallow the error.
    async fn handle(&self, state: &GraphState, error: &Error) -> bool;
}

/// Invoked after a graph run completes without error.
#[async_trait]
pub trait GraphCallback: Send + Sync {
    async fn on_success(&self, state: &GraphState);
}

/// Swallows every error. The error stays readable under [`ERROR_KEY`].
pub struct SwallowErrors;

#[async_trait]
impl ErrorHandler for SwallowErrors {
    async fn handle(&self, state: &GraphState, error: &Error) -> bool {
        warn!(graph = %state.module_path(), error = %error, "error swallowed");
        true
    }
}

// ============================================================================
// Module nodes
// ============================================================================

/// Node kind that runs a nested graph.
pub struct ModuleKind {
    graph: Arc<Graph>,
}

impl ModuleKind {
    pub fn new(graph: Graph) -> Self {
        Self { graph: Arc::new(graph) }
    }
}

#[async_trait]
impl NodeKind for ModuleKind {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        if self.graph.base_type == BaseType::Function {
            let wrapper = FunctionWrapper::new(Arc::clone(&self.graph), current_properties(ctx));
            ctx.set_output("fn", Value::Function(Arc::new(wrapper)));
            return Ok(());
        }

        let inputs: PropertyMap = ctx
            .node
            .inputs
            .iter()
            .map(|s| (s.name.clone(), ctx.get_input_value(&s.name)))
            .collect();
        let options = RunOptions { inputs, properties: current_properties(ctx), data: PropertyMap::new() };

        let inner = match run_with(&self.graph, ctx.state, options).await {
            Ok(inner) => inner,
            Err(Error::Flow(Flow::StopModule)) => return Ok(()),
            Err(e) => return Err(e),
        };
        for (name, value) in graph_outputs(&self.graph, &inner) {
            if ctx.node.get_output_socket(&name).is_some() {
                ctx.set_output(&name, value);
            }
        }
        Ok(())
    }

    fn isolated(&self) -> bool {
        self.graph.base_type == BaseType::Listen
    }

    fn subgraph(&self) -> Option<&Arc<Graph>> {
        Some(&self.graph)
    }
}

/// Current values of every property of the running node, overrides applied.
fn current_properties(ctx: &NodeContext<'_>) -> PropertyMap {
    ctx.node.properties.keys().map(|k| (k.clone(), ctx.get_property(k))).collect()
}

/// Values arriving at the graph's `core/Output` nodes, keyed by output name.
pub fn graph_outputs(graph: &Graph, state: &GraphState) -> BTreeMap<String, Value> {
    graph
        .output_nodes()
        .into_iter()
        .filter_map(|node| {
            let name = node.get_property("output_name").as_str()?.to_string();
            let source = graph.source_of(&SocketRef::new(&node.id, "value"))?;
            if state.socket_deactivated(source) {
                return None;
            }
            Some((name, state.socket_value(source)))
        })
        .collect()
}

// ============================================================================
// Entry points
// ============================================================================

/// What a graph run starts with.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Values for the graph's `core/Input` nodes, by input name.
    pub inputs: PropertyMap,
    /// Module property values, overlaid on the graph's defaults.
    pub properties: PropertyMap,
    /// Initial run data.
    pub data: PropertyMap,
}

/// Run `graph` beneath `outer` and return the state it ran in.
pub async fn run(graph: &Arc<Graph>, outer: &GraphState) -> Result<GraphState> {
    run_with(graph, outer, RunOptions::default()).await
}

pub async fn run_with(graph: &Arc<Graph>, outer: &GraphState, options: RunOptions) -> Result<GraphState> {
    let inner = outer.child(graph);
    let mut properties = graph.module_properties();
    properties.extend(options.properties);
    inner.set_module_properties(properties);
    for (key, value) in options.data {
        inner.set_data(&key, value);
    }

    let result = if graph.base_type.is_loop() {
        run_loop(graph, &inner, &options.inputs).await
    } else {
        seed_inputs(graph, &inner, &options.inputs);
        execute_graph(graph, &inner, None).await
    };
    if inner.depth() <= 1 {
        inner.flush_node_states();
    }
    result.map(|()| inner)
}

/// Run only `target` and the nodes it depends on (plus their side
/// branches with `include_forks`). Isolated chains are not skipped.
pub async fn execute_to_node(
    graph: &Arc<Graph>,
    outer: &GraphState,
    target: &NodeId,
    include_forks: bool,
) -> Result<GraphState> {
    let inner = outer.child(graph);
    inner.set_module_properties(graph.module_properties());
    let result = execute_to_node_in(graph, &inner, target, include_forks).await;
    if inner.depth() <= 1 {
        inner.flush_node_states();
    }
    result.map(|()| inner)
}

pub(crate) async fn execute_to_node_in(
    graph: &Arc<Graph>,
    state: &GraphState,
    target: &NodeId,
    include_forks: bool,
) -> Result<()> {
    let idx = graph
        .index_of(target)
        .ok_or_else(|| Error::Graph(format!("node {target} not in graph '{}'", graph.title)))?;
    let subset = ancestors(graph, idx, include_forks);
    execute_graph(graph, state, Some(&subset)).await
}

/// Run every `Listen` module in `graph` whose `event_name` matches.
///
/// The event is available to the listener under run data [`EVENT_KEY`]
/// and as the value of an input named `event`. Returns the number of
/// listeners run.
pub async fn dispatch_event(graph: &Arc<Graph>, state: &GraphState, name: &str, event: Value) -> Result<usize> {
    let mut count = 0;
    for node in graph.nodes() {
        let Some(listener) = node.subgraph().filter(|g| g.base_type == BaseType::Listen) else {
            continue;
        };
        let wanted = node.get_property("event_name");
        if wanted.as_str() != Some(name) {
            continue;
        }
        debug!(listener = %node.title, event = name, "dispatching event");
        let options = RunOptions {
            inputs: PropertyMap::from([("event".to_string(), event.clone())]),
            properties: node.properties.clone(),
            data: PropertyMap::from([(EVENT_KEY.to_string(), event.clone())]),
        };
        run_with(listener, state, options).await?;
        count += 1;
    }
    Ok(count)
}

fn seed_inputs(graph: &Graph, state: &GraphState, inputs: &PropertyMap) {
    for node in graph.input_nodes() {
        let Some(name) = node.get_property("input_name").as_str().map(str::to_string) else {
            continue;
        };
        if let Some(value) = inputs.get(&name).filter(|v| !v.is_unresolved()) {
            state.set_socket_value(&SocketRef::new(&node.id, "value"), value.clone());
        }
    }
}

// ============================================================================
// Graph body
// ============================================================================

/// One pass over the graph, with error handlers and callbacks applied.
async fn execute_graph(graph: &Arc<Graph>, state: &GraphState, subset: Option<&HashSet<usize>>) -> Result<()> {
    let result = match Schedule::build_subset(graph, subset) {
        Ok(schedule) => run_chains(graph, state, &schedule, subset.is_some()).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) | Err(Error::Flow(Flow::StopGraph)) => {
            for callback in &graph.callbacks {
                callback.on_success(state).await;
            }
            Ok(())
        }
        Err(e) if e.is_passthrough() => Err(e),
        Err(e) => {
            state.set_data(ERROR_KEY, Value::Error(ErrorInfo::from(&e)));
            let mut swallowed = false;
            for handler in &graph.error_handlers {
                swallowed |= handler.handle(state, &e).await;
            }
            if swallowed {
                return Ok(());
            }
            error!(graph = %graph.title, error = %e, "graph run failed");
            if state.depth() <= 1 {
                state.bus().status("error", &e.to_string());
            }
            Err(e)
        }
    }
}

async fn run_chains(graph: &Arc<Graph>, state: &GraphState, schedule: &Schedule, run_isolated: bool) -> Result<()> {
    for chain in &schedule.chains {
        let Some(&last) = chain.order.last() else { continue };
        if !run_isolated && graph.node_at(last).is_isolated() {
            continue;
        }
        if state.verbosity == NodeVerbosity::Verbose {
            debug!(graph = %graph.title, nodes = chain.order.len(), priority = chain.priority, "running chain");
        }
        for &idx in &chain.order {
            run_node(graph, idx, state).await?;
        }
    }
    Ok(())
}

async fn run_loop(graph: &Arc<Graph>, state: &GraphState, inputs: &PropertyMap) -> Result<()> {
    let scene_loop = graph.base_type == BaseType::SceneLoop;
    let sleep = state.runtime().config.loop_sleep();
    let mut iteration: u64 = 0;

    loop {
        if scene_loop && !state.shared().scene_active() {
            info!(graph = %graph.title, "scene inactive, leaving scene loop");
            break;
        }
        state.reset_sockets();
        seed_inputs(graph, state, inputs);
        if scene_loop {
            state.bus().publish(signals::SCENE_LOOP_START, json!({"graph": graph.title, "iteration": iteration}));
        }

        let result = execute_graph(graph, state, None).await;

        if scene_loop {
            state.bus().publish(signals::SCENE_LOOP_END, json!({"graph": graph.title, "iteration": iteration}));
        }
        match result {
            Ok(()) | Err(Error::Flow(Flow::Continue)) => {}
            Err(Error::Flow(Flow::Break)) => break,
            Err(Error::Flow(Flow::Exit)) if scene_loop => break,
            Err(e) => return Err(e),
        }
        iteration += 1;

        if graph.exit_condition().is_some_and(|condition| condition(state)) {
            debug!(graph = %graph.title, iteration, "exit condition met");
            break;
        }
        if sleep.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(sleep).await;
        }
    }
    Ok(())
}

// ============================================================================
// Single node
// ============================================================================

async fn run_node(graph: &Arc<Graph>, idx: usize, state: &GraphState) -> Result<()> {
    let node = graph.node_at(idx);
    let ctx = NodeContext::new(node, graph, state);

    let available = match check_available(&ctx) {
        Ok(available) => available,
        Err(e) => return recover(&ctx, e).await,
    };

    let mut record = state.begin_node_state(node);
    if !available {
        if state.verbosity == NodeVerbosity::Verbose {
            debug!(node = %node.title, "inputs unavailable, skipping");
        }
        ctx.deactivate_outputs();
        if let Some(record) = record.as_mut() {
            record.deactivated = true;
        }
        state.finish_node_state(node, record, None);
        return Ok(());
    }

    if node.breakpoint {
        if let Err(e) = wait_for_breakpoint(&ctx).await {
            state.finish_node_state(node, record, None);
            return Err(e);
        }
    }

    if state.verbosity != NodeVerbosity::Silent {
        debug!(node = %node.title, registry = %node.registry, "running node");
    }
    match node.kind().run(&ctx).await {
        Ok(()) => {
            state.finish_node_state(node, record, None);
            Ok(())
        }
        Err(e) => {
            let message = (!matches!(e, Error::Flow(_))).then(|| e.to_string());
            state.finish_node_state(node, record, message);
            recover(&ctx, e).await
        }
    }
}

/// Offer a node error to the graph's catching nodes.
async fn recover(ctx: &NodeContext<'_>, e: Error) -> Result<()> {
    if e.is_passthrough() {
        return Err(e);
    }
    for handler in ctx.graph.nodes().iter().filter(|n| n.kind().catches_errors()) {
        let hctx = NodeContext::new(handler, ctx.graph, ctx.state);
        match handler.kind().catch(&hctx, &e).await {
            Ok(true) => {
                debug!(node = %ctx.node.title, handler = %handler.title, "error caught");
                return Ok(());
            }
            Ok(false) => {}
            Err(inner) if inner.is_passthrough() => return Err(inner),
            Err(inner) => warn!(handler = %handler.title, error = %inner, "error handler node failed"),
        }
    }
    Err(e)
}

fn input_available(ctx: &NodeContext<'_>, socket: &Socket) -> bool {
    let from_source = ctx.source(&socket.name).is_some_and(|src| {
        !ctx.state.socket_deactivated(src) && !ctx.state.socket_value(src).is_unresolved()
    });
    from_source || !ctx.get_property(&socket.name).is_unresolved()
}

/// Whether `ctx.node` should run. Deactivated or empty sources skip the
/// node; a required input with neither a source nor a property is an error.
fn check_available(ctx: &NodeContext<'_>) -> Result<bool> {
    let mut groups: BTreeMap<&str, bool> = BTreeMap::new();
    for socket in &ctx.node.inputs {
        let available = input_available(ctx, socket);
        if let Some(group) = socket.group.as_deref() {
            *groups.entry(group).or_insert(false) |= available;
            continue;
        }
        if socket.optional || available {
            continue;
        }
        if ctx.is_connected(&socket.name) {
            return Ok(false);
        }
        return Err(Error::input(&ctx.node.title, &socket.name, "not connected and no default value"));
    }
    Ok(groups.values().all(|&any| any))
}

// ============================================================================
// Breakpoints
// ============================================================================

struct BreakpointGuard<'a> {
    shared: &'a SharedState,
    node: &'a NodeId,
}

impl Drop for BreakpointGuard<'_> {
    fn drop(&mut self) {
        if self.shared.breakpoint().as_deref() == Some(self.node.as_str()) {
            self.shared.release_breakpoint();
        }
    }
}

/// Pause until the breakpoint key is cleared. Stops the graph if the scene
/// goes inactive while paused.
pub(crate) async fn wait_for_breakpoint(ctx: &NodeContext<'_>) -> Result<()> {
    let shared = ctx.shared();
    shared.set_breakpoint(ctx.id());
    let _guard = BreakpointGuard { shared, node: ctx.id() };

    ctx.state.bus().publish(
        signals::NODES_BREAKPOINT,
        json!({
            "node": {"id": ctx.id().as_str(), "title": ctx.node.title, "registry": ctx.node.registry},
            "module_path": ctx.state.module_path(),
        }),
    );
    info!(node = %ctx.node.title, module = %ctx.state.module_path(), "breakpoint hit");

    let interval = ctx.runtime().config.poll_interval();
    while shared.breakpoint().is_some() {
        if !shared.scene_active() {
            warn!(node = %ctx.node.title, "scene inactive while paused, stopping graph");
            return Err(Error::Flow(Flow::StopGraph));
        }
        tokio::time::sleep(interval).await;
    }
    debug!(node = %ctx.node.title, "breakpoint released");
    Ok(())
}
