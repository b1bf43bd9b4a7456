//! Node registry: registry name → node factory.
//!
//! The global registry is process-wide and starts out with every built-in
//! node kind. Graph modules can be registered from their flat form; they
//! are imported (and their `extends` chain flattened) each time a node is
//! created from them.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use serde_json::Value as Json;

use crate::graph::{flat, BaseType, Graph};
use crate::node::Node;
use crate::{nodes, Error, Result};

pub type NodeFactory = Arc<dyn Fn() -> Node + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Factory(NodeFactory),
    Module(Arc<Json>),
}

#[derive(Default)]
pub struct Registry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::with_builtins);

/// The process-wide registry.
pub fn global() -> &'static Registry {
    &GLOBAL
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in node kind.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        if let Err(e) = nodes::register_builtins(&registry) {
            tracing::error!(error = %e, "registering built-in nodes failed");
        }
        registry
    }

    /// Register a node factory. Re-registering a name replaces it.
    pub fn register<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Node + Send + Sync + 'static,
    {
        self.validate_registry_path(name)?;
        self.entries.write().insert(name.to_string(), Entry::Factory(Arc::new(factory)));
        Ok(())
    }

    /// Register a graph module from its flat form. Returns its registry name.
    pub fn register_module(&self, definition: Json) -> Result<String> {
        let name = definition
            .get("registry")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::Registry("module definition has no registry name".into()))?
            .to_string();
        if BaseType::from_registry(&name).is_some() {
            return Err(Error::Registry(format!("'{name}' is a base type")));
        }
        self.validate_registry_path(&name)?;
        tracing::debug!(registry = %name, "registered module");
        self.entries.write().insert(name.clone(), Entry::Module(Arc::new(definition)));
        Ok(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Flat form of a registered module.
    pub fn module_definition(&self, name: &str) -> Option<Arc<Json>> {
        match self.entries.read().get(name) {
            Some(Entry::Module(def)) => Some(Arc::clone(def)),
            _ => None,
        }
    }

    /// Registered modules with the given base type.
    pub fn modules_by_base_type(&self, base_type: BaseType) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter_map(|(name, entry)| match entry {
                Entry::Module(def) => {
                    let base = def.get("base_type").and_then(Json::as_str).and_then(BaseType::from_registry);
                    (base.unwrap_or_default() == base_type).then(|| name.clone())
                }
                Entry::Factory(_) => None,
            })
            .collect()
    }

    /// Instantiate a node by registry name.
    pub fn create(&self, name: &str) -> Result<Node> {
        let entry = self.entries.read().get(name).cloned();
        match entry {
            Some(Entry::Factory(factory)) => Ok(factory()),
            Some(Entry::Module(def)) => Ok(flat::import_graph(&def, self)?.into_node()),
            None => match BaseType::from_registry(name) {
                Some(base) => Ok(Graph::with_base_type(name, base).into_node()),
                None => Err(Error::Registry(format!("Node type '{name}' not found"))),
            },
        }
    }

    /// Instantiate a registered module as a graph.
    pub fn create_graph(&self, name: &str) -> Result<Graph> {
        let def = self
            .module_definition(name)
            .ok_or_else(|| Error::Registry(format!("Node type '{name}' not found")))?;
        flat::import_graph(&def, self)
    }

    /// A path needs at least two `/`-separated parts and may not sit on
    /// top of, or underneath, an existing registration.
    pub fn validate_registry_path(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::Registry("Empty registry path".into()));
        }
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::Registry(
                "Registry path must contain at least two parts (e.g., 'my/node')".into(),
            ));
        }
        let entries = self.entries.read();
        for existing in entries.keys() {
            if existing.starts_with(&format!("{path}/")) {
                return Err(Error::Registry(format!("'{path}' is a prefix of existing node '{existing}'")));
            }
            if path.starts_with(&format!("{existing}/")) {
                return Err(Error::Registry(format!("'{path}' would be nested under existing node '{existing}'")));
            }
        }
        Ok(())
    }
}

/// Normalise a display name into a camel-case registry segment.
///
/// `"My Other Node"` → `"myOtherNode"`, `"my-node"` → `"myNode"`.
pub fn normalize_registry_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut word_start = true;
    for ch in name.chars() {
        if ch.is_alphabetic() {
            if word_start {
                out.extend(ch.to_uppercase());
            } else {
                out.extend(ch.to_lowercase());
            }
            word_start = false;
        } else {
            if ch.is_ascii_digit() {
                out.push(ch);
            }
            word_start = true;
        }
    }
    let mut chars = out.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).filter(|c| c.is_ascii_alphanumeric()).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = global();
        for name in ["core/Input", "core/Output", "core/Route", "core/Stage", "core/functions/Argument"] {
            assert!(registry.contains(name), "{name} missing");
        }
        let node = registry.create("core/Watch").unwrap();
        assert_eq!(node.registry, "core/Watch");
    }

    #[test]
    fn test_unknown_node() {
        let err = Registry::new().create("nope/Missing").unwrap_err();
        assert_eq!(err.to_string(), "Registry error: Node type 'nope/Missing' not found");
    }

    #[test]
    fn test_base_types_create_empty_modules() {
        let node = Registry::new().create("core/Loop").unwrap();
        assert_eq!(node.subgraph().unwrap().base_type, BaseType::Loop);
    }

    #[test]
    fn test_validate_registry_path() {
        let registry = Registry::new();
        registry.register("my/node", || global().create("core/Route").unwrap()).unwrap();
        assert!(registry.validate_registry_path("single").is_err());
        assert!(registry.validate_registry_path("").is_err());
        assert!(registry.validate_registry_path("my").is_err());
        assert!(registry.validate_registry_path("my/node/child").is_err());
        assert!(registry.validate_registry_path("my/other").is_ok());
    }

    #[test]
    fn test_normalize_registry_name() {
        assert_eq!(normalize_registry_name("My Node"), "myNode");
        assert_eq!(normalize_registry_name("My-Node"), "myNode");
        assert_eq!(normalize_registry_name("My Other Node"), "myOtherNode");
        assert_eq!(normalize_registry_name("node 2 go"), "node2Go");
    }
}
