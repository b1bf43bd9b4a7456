//! # Nodes
//!
//! A [`Node`] is a static declaration: id, registry name, ordered sockets
//! and default properties. Its behaviour is a [`NodeKind`] trait object
//! shared by every instance of the same registry entry.
//!
//! Everything that changes while a graph runs (socket values, deactivation
//! flags, property overrides) lives in [`GraphState`], and nodes reach it
//! through a [`NodeContext`]:
//!
//! ```text
//!   upstream output ──► NodeContext::get_input_value ──► NodeKind::run
//!                                                          │
//!   downstream input ◄── GraphState sockets ◄── set_output_values
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::Graph;
use crate::model::{PropertyField, PropertyMap, Socket, SocketRef, Value};
use crate::state::{GraphState, Runtime, SharedState};
use crate::{Error, Result};

// ============================================================================
// Identity & presentation
// ============================================================================

/// Stable node identifier (uuid4 for nodes created at runtime).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self { Self(s) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeVerbosity {
    Silent,
    #[default]
    Normal,
    Verbose,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_title: Option<String>,
}

impl NodeStyle {
    pub fn colors(title_color: &str, node_color: &str, icon: &str) -> Self {
        Self {
            title_color: Some(title_color.to_string()),
            node_color: Some(node_color.to_string()),
            icon: Some(icon.to_string()),
            auto_title: None,
        }
    }
}

// ============================================================================
// Behaviour
// ============================================================================

/// Behaviour of a node type.
#[async_trait]
pub trait NodeKind: Send + Sync + 'static {
    /// Read inputs and properties, publish outputs.
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()>;

    /// Isolated nodes are never scheduled by the graph that contains them.
    fn isolated(&self) -> bool {
        false
    }

    /// Property metadata exposed to editors.
    fn fields(&self) -> Vec<PropertyField> {
        Vec::new()
    }

    /// The wrapped graph, for module nodes.
    fn subgraph(&self) -> Option<&Arc<Graph>> {
        None
    }

    /// Node-level error catching. Returns `true` when the error was handled.
    async fn catch(&self, _ctx: &NodeContext<'_>, _error: &Error) -> Result<bool> {
        Ok(false)
    }

    /// Whether this node takes part in error catching.
    fn catches_errors(&self) -> bool {
        false
    }
}

// ============================================================================
// Node
// ============================================================================

#[derive(Clone)]
pub struct Node {
    pub id: NodeId,
    pub title: String,
    pub registry: String,
    pub inputs: Vec<Socket>,
    pub outputs: Vec<Socket>,
    pub properties: PropertyMap,
    pub style: Option<NodeStyle>,
    /// Pause before this node runs.
    pub breakpoint: bool,
    /// Merged in from an `extends` parent; dropped when saving.
    pub inherited: bool,
    kind: Arc<dyn NodeKind>,
}

impl Node {
    pub fn new(registry: &str, title: &str, kind: impl NodeKind) -> Self {
        Self::with_kind(registry, title, Arc::new(kind))
    }

    pub fn with_kind(registry: &str, title: &str, kind: Arc<dyn NodeKind>) -> Self {
        let mut node = Self {
            id: NodeId::generate(),
            title: title.to_string(),
            registry: registry.to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: PropertyMap::new(),
            style: None,
            breakpoint: false,
            inherited: false,
            kind,
        };
        for field in node.kind.fields() {
            node.properties.insert(field.name.clone(), field.default.clone());
        }
        node
    }

    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn input(self, name: &str, socket_type: &str) -> Self {
        self.input_socket(Socket::new(name).typed(socket_type))
    }

    pub fn input_socket(mut self, socket: Socket) -> Self {
        self.inputs.push(socket);
        self
    }

    pub fn output(self, name: &str, socket_type: &str) -> Self {
        self.output_socket(Socket::new(name).typed(socket_type))
    }

    pub fn output_socket(mut self, socket: Socket) -> Self {
        self.outputs.push(socket);
        self
    }

    pub fn property(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn styled(mut self, style: NodeStyle) -> Self {
        self.style = Some(style);
        self
    }

    pub fn get_input_socket(&self, name: &str) -> Option<&Socket> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn get_output_socket(&self, name: &str) -> Option<&Socket> {
        self.outputs.iter().find(|s| s.name == name)
    }

    /// Static property value; `Unresolved` when the node has no such property.
    pub fn get_property(&self, name: &str) -> Value {
        self.properties.get(name).cloned().unwrap_or_default()
    }

    pub fn kind(&self) -> &Arc<dyn NodeKind> {
        &self.kind
    }

    pub fn is_isolated(&self) -> bool {
        self.kind.isolated()
    }

    pub fn subgraph(&self) -> Option<&Arc<Graph>> {
        self.kind.subgraph()
    }

    pub fn field(&self, name: &str) -> Option<PropertyField> {
        self.kind.fields().into_iter().find(|f| f.name == name)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("registry", &self.registry)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("properties", &self.properties)
            .finish()
    }
}

// ============================================================================
// Execution context
// ============================================================================

/// Everything a node sees while it runs.
pub struct NodeContext<'a> {
    pub node: &'a Node,
    pub graph: &'a Arc<Graph>,
    pub state: &'a GraphState,
}

impl<'a> NodeContext<'a> {
    pub fn new(node: &'a Node, graph: &'a Arc<Graph>, state: &'a GraphState) -> Self {
        Self { node, graph, state }
    }

    pub fn id(&self) -> &NodeId {
        &self.node.id
    }

    pub fn shared(&self) -> &SharedState {
        self.state.shared()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        self.state.runtime()
    }

    // --- properties ---

    /// Run-local override first, then the node's own property.
    pub fn get_property(&self, name: &str) -> Value {
        self.state
            .property_override(&self.node.id, name)
            .unwrap_or_else(|| self.node.get_property(name))
    }

    /// Override a property for the rest of this run.
    pub fn set_property(&self, name: &str, value: Value) {
        self.state.set_property_override(&self.node.id, name, value);
    }

    // --- inputs ---

    pub fn source(&self, input: &str) -> Option<&SocketRef> {
        self.graph.source_of(&SocketRef::new(&self.node.id, input))
    }

    pub fn is_connected(&self, input: &str) -> bool {
        self.source(input).is_some()
    }

    /// Value of the upstream socket, or the property of the same name.
    pub fn get_input_value(&self, name: &str) -> Value {
        if let Some(source) = self.source(name) {
            let value = self.state.socket_value(source);
            if !value.is_unresolved() {
                return value;
            }
        }
        self.get_property(name)
    }

    /// Connected sockets report their upstream value as-is (including
    /// `Null` and `Unresolved`); unconnected ones fall back to the property.
    pub fn normalized_input_value(&self, name: &str) -> Value {
        match self.source(name) {
            Some(source) => self.state.socket_value(source),
            None => self.get_property(name),
        }
    }

    pub fn require_input(&self, name: &str) -> Result<Value> {
        let value = self.get_input_value(name);
        if value.is_unresolved() {
            return Err(Error::input(&self.node.title, name, "required input has no value"));
        }
        Ok(value)
    }

    /// Like [`require_input`](Self::require_input) but also rejects `Null`.
    pub fn require_value(&self, name: &str) -> Result<Value> {
        match self.require_input(name)? {
            Value::Null => Err(Error::input(&self.node.title, name, "required input is None")),
            v => Ok(v),
        }
    }

    /// Require a number of one of `types` (`"int"`, `"float"`); numeric strings are parsed.
    pub fn require_number_input(&self, name: &str, types: &[&str]) -> Result<Value> {
        let value = match self.require_input(name)? {
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    Value::Int(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    Value::Float(f)
                } else {
                    return Err(Error::input(&self.node.title, name, format!("{s:?} is not a number")));
                }
            }
            v => v,
        };
        let allowed = match &value {
            Value::Int(_) => types.contains(&"int") || types.contains(&"float"),
            Value::Float(_) => types.contains(&"float"),
            _ => false,
        };
        if !allowed {
            return Err(Error::input(
                &self.node.title,
                name,
                format!("expected one of {types:?}, got {}", value.type_name()),
            ));
        }
        match (&value, types.contains(&"int")) {
            (Value::Int(i), false) => Ok(Value::Float(*i as f64)),
            _ => Ok(value),
        }
    }

    // --- outputs ---

    pub fn set_output(&self, name: &str, value: Value) {
        self.state.set_socket_value(&SocketRef::new(&self.node.id, name), value);
    }

    pub fn set_output_values<I, K>(&self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (name, value) in values {
            self.set_output(name.as_ref(), value);
        }
    }

    pub fn get_output(&self, name: &str) -> Value {
        self.state.socket_value(&SocketRef::new(&self.node.id, name))
    }

    pub fn set_deactivated(&self, output: &str, deactivated: bool) {
        self.state.set_socket_deactivated(&SocketRef::new(&self.node.id, output), deactivated);
    }

    pub fn deactivate_outputs(&self) {
        for socket in &self.node.outputs {
            self.set_deactivated(&socket.name, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl NodeKind for Noop {
        async fn run(&self, _ctx: &NodeContext<'_>) -> Result<()> {
            Ok(())
        }

        fn fields(&self) -> Vec<PropertyField> {
            vec![PropertyField::new("amount", crate::PropertyType::Int, 3)]
        }
    }

    #[test]
    fn test_node_builder() {
        let node = Node::new("test/Noop", "Noop", Noop)
            .input("value", "str,int")
            .output("value", "any")
            .property("extra", true);
        assert_eq!(node.inputs.len(), 1);
        assert_eq!(node.get_property("amount"), Value::Int(3));
        assert_eq!(node.get_property("extra"), Value::Bool(true));
        assert!(node.get_property("missing").is_unresolved());
        assert!(node.field("amount").is_some());
        assert!(!node.is_isolated());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }
}
