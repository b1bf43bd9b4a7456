//! # Graph Model
//!
//! A [`Graph`] owns its nodes in an arena (`Vec<Node>` plus an id index)
//! and its edges as socket references:
//!
//! ```text
//!   edges:   "a.value" ──► ["b.value", "c.text"]
//!   sources: "b.value" ──► "a.value"          (one source per input)
//! ```
//!
//! A graph becomes a node of another graph through [`Graph::into_node`]:
//! its `core/Input` nodes turn into input sockets, its `core/Output`
//! nodes into output sockets and its `core/ModuleProperty` nodes into
//! properties.

pub mod flat;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::execution::{ErrorHandler, GraphCallback, ModuleKind};
use crate::model::{PropertyMap, Socket, SocketRef, Value};
use crate::node::{Node, NodeId, NodeStyle};
use crate::state::GraphState;
use crate::{Error, Result};

pub const INPUT: &str = "core/Input";
pub const OUTPUT: &str = "core/Output";
pub const MODULE_PROPERTY: &str = "core/ModuleProperty";
pub const STAGE: &str = "core/Stage";

/// Loop termination predicate evaluated after every iteration.
pub type ExitCondition = Arc<dyn Fn(&GraphState) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BaseType {
    #[default]
    #[serde(rename = "core/Graph")]
    Graph,
    #[serde(rename = "core/Loop")]
    Loop,
    #[serde(rename = "scene/SceneLoop")]
    SceneLoop,
    #[serde(rename = "core/Listen")]
    Listen,
    #[serde(rename = "core/functions/Function")]
    Function,
}

impl BaseType {
    pub const ALL: [BaseType; 5] =
        [BaseType::Graph, BaseType::Loop, BaseType::SceneLoop, BaseType::Listen, BaseType::Function];

    pub fn registry(&self) -> &'static str {
        match self {
            BaseType::Graph => "core/Graph",
            BaseType::Loop => "core/Loop",
            BaseType::SceneLoop => "scene/SceneLoop",
            BaseType::Listen => "core/Listen",
            BaseType::Function => "core/functions/Function",
        }
    }

    pub fn from_registry(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.registry() == name)
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, BaseType::Loop | BaseType::SceneLoop)
    }
}

#[derive(Clone)]
pub struct Graph {
    pub id: NodeId,
    pub title: String,
    pub registry: String,
    pub base_type: BaseType,
    pub properties: PropertyMap,
    pub extends: Option<String>,
    pub style: Option<NodeStyle>,
    /// Editor annotations, carried through the flat form untouched.
    pub groups: Vec<Json>,
    pub comments: Vec<Json>,
    pub callbacks: Vec<Arc<dyn GraphCallback>>,
    pub error_handlers: Vec<Arc<dyn ErrorHandler>>,
    exit_condition: Option<ExitCondition>,
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    edges: BTreeMap<SocketRef, Vec<SocketRef>>,
    sources: HashMap<SocketRef, SocketRef>,
}

impl Graph {
    pub fn new(title: &str) -> Self {
        Self::with_base_type(title, BaseType::Graph)
    }

    pub fn with_base_type(title: &str, base_type: BaseType) -> Self {
        Self {
            id: NodeId::generate(),
            title: title.to_string(),
            registry: base_type.registry().to_string(),
            base_type,
            properties: PropertyMap::new(),
            extends: None,
            style: None,
            groups: Vec::new(),
            comments: Vec::new(),
            callbacks: Vec::new(),
            error_handlers: Vec::new(),
            exit_condition: None,
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: BTreeMap::new(),
            sources: HashMap::new(),
        }
    }

    pub fn with_registry(mut self, registry: &str) -> Self {
        self.registry = registry.to_string();
        self
    }

    pub fn with_exit_condition(mut self, condition: ExitCondition) -> Self {
        self.exit_condition = Some(condition);
        self
    }

    pub fn exit_condition(&self) -> Option<&ExitCondition> {
        self.exit_condition.as_ref()
    }

    pub fn on_error(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.error_handlers.push(handler);
    }

    pub fn on_success(&mut self, callback: Arc<dyn GraphCallback>) {
        self.callbacks.push(callback);
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Add a node, replacing any node with the same id in place.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id.clone();
        match self.index.get(&id) {
            Some(&idx) => self.nodes[idx] = node,
            None => {
                self.index.insert(id.clone(), self.nodes.len());
                self.nodes.push(node);
            }
        }
        id
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let idx = self.index.remove(id)?;
        let node = self.nodes.remove(idx);
        for (i, n) in self.nodes.iter().enumerate().skip(idx) {
            self.index.insert(n.id.clone(), i);
        }
        self.edges.retain(|from, _| &from.node != id);
        for targets in self.edges.values_mut() {
            targets.retain(|t| &t.node != id);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
        self.rebuild_sources();
        Some(node)
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.index.get(id).map(|&i| &mut self.nodes[i])
    }

    pub fn node_at(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes_by_registry<'a>(&'a self, registry: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.registry == registry)
    }

    pub fn set_node_property(&mut self, id: &NodeId, name: &str, value: Value) -> Result<()> {
        let node = self
            .node_mut(id)
            .ok_or_else(|| Error::Graph(format!("node {id} not found")))?;
        node.properties.insert(name.to_string(), value);
        Ok(())
    }

    pub fn set_property(&mut self, name: &str, value: Value) {
        self.properties.insert(name.to_string(), value);
    }

    // ========================================================================
    // Edges
    // ========================================================================

    /// Connect an output socket to an input socket.
    ///
    /// An input has at most one source; connecting again replaces it.
    pub fn connect(&mut self, from: (&NodeId, &str), to: (&NodeId, &str)) -> Result<()> {
        self.connect_refs(SocketRef::new(from.0, from.1), SocketRef::new(to.0, to.1))
    }

    pub fn connect_refs(&mut self, from: SocketRef, to: SocketRef) -> Result<()> {
        let out = self
            .node(&from.node)
            .and_then(|n| n.get_output_socket(&from.socket))
            .ok_or_else(|| Error::Graph(format!("output socket {from} not found")))?;
        let inp = self
            .node(&to.node)
            .and_then(|n| n.get_input_socket(&to.socket))
            .ok_or_else(|| Error::Graph(format!("input socket {to} not found")))?;
        if !out.socket_type.accepts(&inp.socket_type) {
            return Err(Error::SocketType {
                from: from.to_string(),
                from_type: out.socket_type.to_string(),
                to: to.to_string(),
                to_type: inp.socket_type.to_string(),
            });
        }

        self.disconnect(&to);
        self.edges.entry(from.clone()).or_default().push(to.clone());
        self.sources.insert(to, from);
        Ok(())
    }

    /// Drop the edge feeding `input`, if any.
    pub fn disconnect(&mut self, input: &SocketRef) -> Option<SocketRef> {
        let source = self.sources.remove(input)?;
        if let Some(targets) = self.edges.get_mut(&source) {
            targets.retain(|t| t != input);
            if targets.is_empty() {
                self.edges.remove(&source);
            }
        }
        Some(source)
    }

    pub fn edges(&self) -> &BTreeMap<SocketRef, Vec<SocketRef>> {
        &self.edges
    }

    pub fn source_of(&self, input: &SocketRef) -> Option<&SocketRef> {
        self.sources.get(input)
    }

    /// Node-level dependencies as `(upstream, downstream)` arena indices.
    pub fn dependencies(&self) -> Vec<(usize, usize)> {
        let mut pairs: Vec<(usize, usize)> = self
            .edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (from, to)))
            .filter_map(|(from, to)| Some((self.index_of(&from.node)?, self.index_of(&to.node)?)))
            .collect();
        pairs.sort_unstable();
        pairs.dedup();
        pairs
    }

    fn rebuild_sources(&mut self) {
        self.sources = self
            .edges
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (to.clone(), from.clone())))
            .collect();
    }

    // ========================================================================
    // Module interface
    // ========================================================================

    fn sorted_by_num<'a>(&'a self, registry: &'a str) -> Vec<&'a Node> {
        let mut nodes: Vec<&Node> = self.nodes_by_registry(registry).collect();
        nodes.sort_by_key(|n| n.get_property("num").as_int().unwrap_or(0));
        nodes
    }

    pub fn input_nodes(&self) -> Vec<&Node> {
        self.sorted_by_num(INPUT)
    }

    pub fn output_nodes(&self) -> Vec<&Node> {
        self.sorted_by_num(OUTPUT)
    }

    /// Input sockets the graph exposes when used as a node.
    pub fn module_inputs(&self) -> Vec<Socket> {
        if matches!(self.base_type, BaseType::Listen | BaseType::Function) {
            return Vec::new();
        }
        self.input_nodes()
            .into_iter()
            .map(|n| {
                let mut socket = Socket::new(n.get_property("input_name").as_str().unwrap_or("state"))
                    .typed(n.get_property("input_type").as_str().unwrap_or("any"));
                socket.optional = n.get_property("input_optional").is_truthy();
                socket.group = n
                    .get_property("input_group")
                    .as_str()
                    .filter(|g| !g.is_empty())
                    .map(str::to_string);
                socket
            })
            .collect()
    }

    /// Output sockets the graph exposes when used as a node.
    pub fn module_outputs(&self) -> Vec<Socket> {
        match self.base_type {
            BaseType::Function => vec![Socket::new("fn").typed("function")],
            BaseType::Listen => Vec::new(),
            _ => self
                .output_nodes()
                .into_iter()
                .map(|n| {
                    Socket::new(n.get_property("output_name").as_str().unwrap_or("state"))
                        .typed(n.get_property("output_type").as_str().unwrap_or("any"))
                })
                .collect(),
        }
    }

    /// Default values of the properties declared by `core/ModuleProperty` nodes.
    pub fn module_properties(&self) -> PropertyMap {
        let mut properties = self.properties.clone();
        for node in self.nodes_by_registry(MODULE_PROPERTY) {
            if let Some(name) = node.get_property("property_name").as_str().filter(|s| !s.is_empty()) {
                properties
                    .entry(name.to_string())
                    .or_insert_with(|| node.get_property("default"));
            }
        }
        properties
    }

    /// Wrap this graph as a node of another graph.
    pub fn into_node(self) -> Node {
        let id = self.id.clone();
        let title = self.title.clone();
        let registry = self.registry.clone();
        let inputs = self.module_inputs();
        let outputs = self.module_outputs();
        let properties = self.module_properties();
        let style = self.style.clone();

        let mut node = Node::with_kind(&registry, &title, Arc::new(ModuleKind::new(self))).with_id(id);
        node.inputs = inputs;
        node.outputs = outputs;
        node.properties = properties;
        node.style = style;
        node
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("registry", &self.registry)
            .field("base_type", &self.base_type)
            .field("nodes", &self.nodes)
            .field("edges", &self.edges)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    fn node(name: &str) -> Node {
        registry::global().create(name).unwrap()
    }

    #[test]
    fn test_connect_replaces_source() {
        let mut graph = Graph::new("g");
        let a = graph.add_node(node("core/Route"));
        let b = graph.add_node(node("core/Route"));
        let c = graph.add_node(node("core/Route"));

        graph.connect((&a, "value"), (&c, "value")).unwrap();
        graph.connect((&b, "value"), (&c, "value")).unwrap();

        let input = SocketRef::new(&c, "value");
        assert_eq!(graph.source_of(&input), Some(&SocketRef::new(&b, "value")));
        assert!(!graph.edges().contains_key(&SocketRef::new(&a, "value")));
        assert_eq!(graph.dependencies(), vec![(1, 2)]);
    }

    #[test]
    fn test_connect_rejects_bad_sockets() {
        let mut graph = Graph::new("g");
        let a = graph.add_node(node("core/Route"));
        let b = graph.add_node(node("core/Route"));
        assert!(graph.connect((&a, "missing"), (&b, "value")).is_err());
        assert!(graph.connect((&a, "value"), (&b, "missing")).is_err());
    }

    #[test]
    fn test_connect_type_mismatch() {
        let mut graph = Graph::new("g");
        let a = graph.add_node(node("core/Invert"));
        let b = graph.add_node(node("core/functions/CallFunction"));
        let err = graph.connect((&a, "value"), (&b, "fn")).unwrap_err();
        assert!(matches!(err, Error::SocketType { .. }));
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut graph = Graph::new("g");
        let a = graph.add_node(node("core/Route"));
        let b = graph.add_node(node("core/Route"));
        let c = graph.add_node(node("core/Route"));
        graph.connect((&a, "value"), (&b, "value")).unwrap();
        graph.connect((&b, "value"), (&c, "value")).unwrap();

        graph.remove_node(&b);
        assert!(graph.edges().is_empty());
        assert_eq!(graph.index_of(&c), Some(1));
        assert!(graph.source_of(&SocketRef::new(&c, "value")).is_none());
    }

    #[test]
    fn test_module_interface() {
        let mut graph = Graph::new("child").with_registry("test/Child");
        let input = graph.add_node(node(INPUT));
        graph.set_node_property(&input, "input_name", Value::from("text")).unwrap();
        graph.set_node_property(&input, "input_type", Value::from("str")).unwrap();
        let output = graph.add_node(node(OUTPUT));
        graph.set_node_property(&output, "output_name", Value::from("result")).unwrap();
        let prop = graph.add_node(node(MODULE_PROPERTY));
        graph.set_node_property(&prop, "property_name", Value::from("mood")).unwrap();
        graph.set_node_property(&prop, "default", Value::from("calm")).unwrap();

        let wrapped = graph.into_node();
        assert_eq!(wrapped.registry, "test/Child");
        assert_eq!(wrapped.inputs[0].name, "text");
        assert_eq!(wrapped.inputs[0].socket_type.to_string(), "str");
        assert_eq!(wrapped.outputs[0].name, "result");
        assert_eq!(wrapped.get_property("mood"), Value::from("calm"));
        assert!(wrapped.subgraph().is_some());
    }

    #[test]
    fn test_function_graph_exposes_fn() {
        let graph = Graph::with_base_type("f", BaseType::Function);
        let wrapped = graph.into_node();
        assert_eq!(wrapped.outputs.len(), 1);
        assert_eq!(wrapped.outputs[0].name, "fn");
        assert!(wrapped.inputs.is_empty());
    }
}
