//! # Graph State
//!
//! | Type | Lifetime | Holds |
//! |------|----------|-------|
//! | [`Runtime`] | process | signal bus, agents, prompt renderer, config |
//! | [`SharedState`] | scene / test run | keys shared by concurrent graphs (UX waits, breakpoints) |
//! | [`GraphState`] | one graph execution | socket values, property overrides, run data, call history |
//!
//! `SharedState` keeps the dict form (`_ux_<id>`, `__breakpoint`, ...) so
//! other components can read and write the same keys, but every concern
//! the runtime itself uses goes through a typed method.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;

use crate::config::RuntimeConfig;
use crate::focal::Call;
use crate::graph::Graph;
use crate::llm::{AgentRegistry, InstructionRenderer, PromptRenderer};
use crate::model::value::repr;
use crate::model::{PropertyMap, SocketRef, Value};
use crate::node::{Node, NodeId, NodeVerbosity};
use crate::signals::{self, SignalBus};

// ============================================================================
// Runtime
// ============================================================================

/// Process-wide services handed to every graph execution.
pub struct Runtime {
    pub bus: SignalBus,
    pub agents: AgentRegistry,
    pub renderer: Arc<dyn PromptRenderer>,
    pub config: RuntimeConfig,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            bus: SignalBus::new(),
            agents: AgentRegistry::new(),
            renderer: Arc::new(InstructionRenderer),
            config,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_agents(mut self, agents: AgentRegistry) -> Self {
        self.agents = agents;
        self
    }
}

// ============================================================================
// Shared state
// ============================================================================

const BREAKPOINT_KEY: &str = "__breakpoint";
const UX_WAITING: &str = "waiting";

/// Outcome of polling a UX wait slot.
#[derive(Debug, Clone, PartialEq)]
pub enum UxSlot {
    /// Nobody registered a wait for this id.
    Missing,
    Waiting,
    Resolved(Value),
}

pub struct SharedState {
    values: RwLock<HashMap<String, Value>>,
    scene_active: AtomicBool,
    creative_mode: AtomicBool,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            scene_active: AtomicBool::new(true),
            creative_mode: AtomicBool::new(false),
        }
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    // --- raw keys ---

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    // --- scene flags ---

    pub fn scene_active(&self) -> bool {
        self.scene_active.load(Ordering::SeqCst)
    }

    pub fn set_scene_active(&self, active: bool) {
        self.scene_active.store(active, Ordering::SeqCst);
    }

    pub fn creative_mode(&self) -> bool {
        self.creative_mode.load(Ordering::SeqCst)
    }

    pub fn set_creative_mode(&self, on: bool) {
        self.creative_mode.store(on, Ordering::SeqCst);
    }

    // --- breakpoints ---

    pub fn breakpoint(&self) -> Option<String> {
        self.get(BREAKPOINT_KEY).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set_breakpoint(&self, node: &NodeId) {
        self.set(BREAKPOINT_KEY, Value::from(node.as_str()));
    }

    /// Resume a paused graph.
    pub fn release_breakpoint(&self) -> bool {
        self.remove(BREAKPOINT_KEY).is_some()
    }

    // --- UX waits ---

    pub fn ux_key(ux_id: &str) -> String {
        format!("_ux_{ux_id}")
    }

    /// Mark a UX element as awaiting input.
    pub fn begin_ux_wait(&self, ux_id: &str) {
        self.set(&Self::ux_key(ux_id), Value::from(UX_WAITING));
    }

    pub fn poll_ux(&self, ux_id: &str) -> UxSlot {
        match self.get(&Self::ux_key(ux_id)) {
            None => UxSlot::Missing,
            Some(Value::String(s)) if s == UX_WAITING => UxSlot::Waiting,
            Some(v) => UxSlot::Resolved(v),
        }
    }

    /// Deliver a selection. Returns `false` when nothing is waiting on `ux_id`.
    pub fn resolve_ux(&self, ux_id: &str, payload: Value) -> bool {
        let key = Self::ux_key(ux_id);
        let mut values = self.values.write();
        match values.get(&key) {
            Some(Value::String(s)) if s == UX_WAITING => {
                values.insert(key, payload);
                true
            }
            _ => false,
        }
    }

    pub fn clear_ux(&self, ux_id: &str) {
        self.remove(&Self::ux_key(ux_id));
    }
}

// ============================================================================
// Flattened node state
// ============================================================================

/// Frontend-observable record of one node execution.
#[derive(Debug, Clone, Serialize)]
pub struct NodeState {
    pub node_id: String,
    pub title: String,
    pub module_path: String,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub deactivated: bool,
    pub error: Option<String>,
    pub input_values: HashMap<String, String>,
    pub output_values: HashMap<String, String>,
    pub properties: HashMap<String, String>,
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ============================================================================
// Graph state
// ============================================================================

#[derive(Debug, Clone, Default)]
struct SocketSlot {
    value: Value,
    deactivated: bool,
}

/// Handle on a parent state's run data.
pub struct ParentData<'a>(&'a RwLock<HashMap<String, Value>>);

impl ParentData<'_> {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.0.write().insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.read().contains_key(key)
    }
}

/// Per-execution context.
pub struct GraphState {
    shared: Arc<SharedState>,
    runtime: Arc<Runtime>,
    graph: Option<Arc<Graph>>,
    data: Arc<RwLock<HashMap<String, Value>>>,
    parent_data: Option<Arc<RwLock<HashMap<String, Value>>>>,
    sockets: RwLock<HashMap<SocketRef, SocketSlot>>,
    overrides: RwLock<HashMap<(NodeId, String), Value>>,
    module_properties: RwLock<PropertyMap>,
    calls: Arc<Mutex<Vec<Call>>>,
    stack: Arc<Mutex<Vec<NodeState>>>,
    last_published: Arc<Mutex<Option<Instant>>>,
    pub verbosity: NodeVerbosity,
    depth: usize,
}

impl fmt::Debug for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphState")
            .field("module_path", &self.module_path())
            .field("depth", &self.depth)
            .field("verbosity", &self.verbosity)
            .finish_non_exhaustive()
    }
}

impl GraphState {
    /// Fresh root state with its own shared dict.
    pub fn root(runtime: Runtime) -> Self {
        Self::with_shared(Arc::new(runtime), Arc::new(SharedState::new()))
    }

    pub fn with_shared(runtime: Arc<Runtime>, shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            runtime,
            graph: None,
            data: Arc::new(RwLock::new(HashMap::new())),
            parent_data: None,
            sockets: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            module_properties: RwLock::new(PropertyMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
            stack: Arc::new(Mutex::new(Vec::new())),
            last_published: Arc::new(Mutex::new(None)),
            verbosity: NodeVerbosity::Normal,
            depth: 0,
        }
    }

    /// Ephemeral state for running `graph` beneath this one.
    pub fn child(&self, graph: &Arc<Graph>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            runtime: Arc::clone(&self.runtime),
            graph: Some(Arc::clone(graph)),
            data: Arc::new(RwLock::new(HashMap::new())),
            parent_data: Some(Arc::clone(&self.data)),
            sockets: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            module_properties: RwLock::new(PropertyMap::new()),
            calls: Arc::clone(&self.calls),
            stack: Arc::clone(&self.stack),
            last_published: Arc::clone(&self.last_published),
            verbosity: self.verbosity,
            depth: self.depth + 1,
        }
    }

    pub fn with_verbosity(mut self, verbosity: NodeVerbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn shared_arc(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn bus(&self) -> &SignalBus {
        &self.runtime.bus
    }

    /// The graph this state executes, `None` for a root state.
    pub fn graph(&self) -> Option<&Arc<Graph>> {
        self.graph.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn module_path(&self) -> String {
        self.graph.as_ref().map(|g| g.registry.clone()).unwrap_or_default()
    }

    // --- run data ---

    pub fn data(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    pub fn set_data(&self, key: &str, value: Value) {
        self.data.write().insert(key.to_string(), value);
    }

    pub fn take_data(&self, key: &str) -> Option<Value> {
        self.data.write().remove(key)
    }

    pub fn has_data(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Run data of the state this one was spawned from, `None` for a root.
    pub fn parent_data(&self) -> Option<ParentData<'_>> {
        self.parent_data.as_deref().map(ParentData)
    }

    // --- sockets ---

    pub fn socket_value(&self, socket: &SocketRef) -> Value {
        self.sockets.read().get(socket).map(|s| s.value.clone()).unwrap_or_default()
    }

    pub fn set_socket_value(&self, socket: &SocketRef, value: Value) {
        self.sockets.write().entry(socket.clone()).or_default().value = value;
    }

    pub fn socket_deactivated(&self, socket: &SocketRef) -> bool {
        self.sockets.read().get(socket).is_some_and(|s| s.deactivated)
    }

    pub fn set_socket_deactivated(&self, socket: &SocketRef, deactivated: bool) {
        self.sockets.write().entry(socket.clone()).or_default().deactivated = deactivated;
    }

    /// Output value of a node in the graph this state executed.
    pub fn output(&self, node: &NodeId, socket: &str) -> Value {
        self.socket_value(&SocketRef::new(node, socket))
    }

    /// Forget every socket value, e.g. between loop iterations.
    pub fn reset_sockets(&self) {
        self.sockets.write().clear();
    }

    // --- properties ---

    pub fn property_override(&self, node: &NodeId, name: &str) -> Option<Value> {
        self.overrides.read().get(&(node.clone(), name.to_string())).cloned()
    }

    pub fn set_property_override(&self, node: &NodeId, name: &str, value: Value) {
        self.overrides.write().insert((node.clone(), name.to_string()), value);
    }

    pub fn module_property(&self, name: &str) -> Option<Value> {
        self.module_properties.read().get(name).cloned()
    }

    pub fn set_module_properties(&self, properties: PropertyMap) {
        *self.module_properties.write() = properties;
    }

    // --- focal calls ---

    pub fn push_calls(&self, calls: impl IntoIterator<Item = Call>) {
        self.calls.lock().extend(calls);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    // --- node states ---

    /// Start a flattened record for `node`. `None` outside creative mode.
    pub fn begin_node_state(&self, node: &Node) -> Option<NodeState> {
        if !self.shared.creative_mode() {
            return None;
        }
        let max = self.runtime.config.node_state_max_repr;
        let properties = node
            .properties
            .keys()
            .map(|k| {
                let v = self.property_override(&node.id, k).unwrap_or_else(|| node.get_property(k));
                (k.clone(), repr(&v, max))
            })
            .collect();
        let input_values = node
            .inputs
            .iter()
            .filter_map(|s| {
                let graph = self.graph.as_ref()?;
                let source = graph.source_of(&SocketRef::new(&node.id, &s.name))?;
                Some((s.name.clone(), repr(&self.socket_value(source), max)))
            })
            .collect();
        Some(NodeState {
            node_id: node.id.to_string(),
            title: node.title.clone(),
            module_path: self.module_path(),
            start_time: now_secs(),
            end_time: None,
            deactivated: false,
            error: None,
            input_values,
            output_values: HashMap::new(),
            properties,
        })
    }

    /// Finish the record and push it on the stack. The stack is published
    /// as `nodes_node_state` at most once per debounce window.
    pub fn finish_node_state(&self, node: &Node, record: Option<NodeState>, error: Option<String>) {
        let Some(mut record) = record else { return };
        let max = self.runtime.config.node_state_max_repr;
        record.end_time = Some(now_secs());
        record.error = error;
        record.output_values = node
            .outputs
            .iter()
            .map(|s| (s.name.clone(), repr(&self.output(&node.id, &s.name), max)))
            .collect();
        self.stack.lock().push(record);

        let due = {
            let mut last = self.last_published.lock();
            let window = self.runtime.config.node_state_debounce();
            let due = last.is_none_or(|at| at.elapsed() >= window);
            if due {
                *last = Some(Instant::now());
            }
            due
        };
        if due {
            self.flush_node_states();
        }
    }

    /// Publish and clear every record still on the stack.
    pub fn flush_node_states(&self) {
        let stack = std::mem::take(&mut *self.stack.lock());
        if stack.is_empty() {
            return;
        }
        let payload = json!({"stack": serde_json::to_value(&stack).unwrap_or_default()});
        self.runtime.bus.publish(signals::NODES_NODE_STATE, payload);
    }

    /// Records waiting for the next `nodes_node_state` publish.
    pub fn flattened(&self) -> Vec<NodeState> {
        self.stack.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ux_slot_lifecycle() {
        let shared = SharedState::new();
        assert_eq!(shared.poll_ux("a"), UxSlot::Missing);
        assert!(!shared.resolve_ux("a", Value::Null));

        shared.begin_ux_wait("a");
        assert_eq!(shared.poll_ux("a"), UxSlot::Waiting);
        assert!(shared.contains("_ux_a"));

        assert!(shared.resolve_ux("a", Value::from("picked")));
        assert_eq!(shared.poll_ux("a"), UxSlot::Resolved(Value::from("picked")));
        shared.clear_ux("a");
        assert_eq!(shared.poll_ux("a"), UxSlot::Missing);
    }

    #[test]
    fn test_breakpoint_key() {
        let shared = SharedState::new();
        assert!(shared.breakpoint().is_none());
        shared.set_breakpoint(&NodeId::from("n1"));
        assert_eq!(shared.get("__breakpoint"), Some(Value::from("n1")));
        assert!(shared.release_breakpoint());
        assert!(!shared.release_breakpoint());
    }

    #[test]
    fn test_child_shares_shared_but_not_sockets() {
        let root = GraphState::root(Runtime::default());
        let graph = Arc::new(Graph::new("g"));
        let socket = SocketRef::new(&NodeId::from("n"), "value");
        root.set_socket_value(&socket, Value::Int(1));
        root.shared().set("k", Value::Bool(true));

        let child = root.child(&graph);
        assert!(child.socket_value(&socket).is_unresolved());
        assert_eq!(child.shared().get("k"), Some(Value::Bool(true)));
        assert_eq!(child.depth(), 1);
    }
}
