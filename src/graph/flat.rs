//! Flat form: the JSON shape graphs are stored and exchanged in.
//!
//! ```json
//! {
//!   "id": "…", "title": "…", "registry": "my/Module", "base_type": "core/Graph",
//!   "extends": "my/Parent", "properties": {…},
//!   "nodes": { "<id>": { "id": "…", "title": "…", "registry": "core/Route", "properties": {…} } },
//!   "edges": { "<id>.value": ["<id>.value"] },
//!   "groups": [], "comments": []
//! }
//! ```
//!
//! Module nodes whose registry is a bare base type are inline graphs and
//! embed their own flat form under `"graph"`. Everything else is rebuilt
//! from the registry and then overridden with the stored id, title and
//! properties.
//!
//! `extends` is flattened at import: the parent's nodes, edges, groups and
//! comments are merged in and marked inherited, then the child's own
//! definitions win. Saving drops everything inherited again.

use serde_json::{json, Map, Value as Json};

use super::{BaseType, Graph};
use crate::model::{SocketRef, Value};
use crate::node::{Node, NodeId, NodeStyle};
use crate::registry::Registry;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Everything, inherited items included.
    Full,
    /// What gets written back to a module file.
    Save,
}

// ============================================================================
// Export
// ============================================================================

pub fn export_graph(graph: &Graph, mode: ExportMode) -> Json {
    let keep = |node: &Node| mode == ExportMode::Full || !node.inherited;

    let nodes: Map<String, Json> = graph
        .nodes()
        .iter()
        .filter(|n| keep(n))
        .map(|n| (n.id.to_string(), export_node(n, mode)))
        .collect();

    let dropped = |r: &SocketRef| graph.node(&r.node).is_some_and(|n| !keep(n));
    let edges: Map<String, Json> = graph
        .edges()
        .iter()
        .filter(|(from, targets)| !dropped(from) && targets.iter().all(|t| !dropped(t)))
        .map(|(from, targets)| {
            (from.to_string(), Json::Array(targets.iter().map(|t| Json::String(t.to_string())).collect()))
        })
        .collect();

    let keep_annotation = |a: &&Json| {
        mode == ExportMode::Full || !a.get("inherited").and_then(Json::as_bool).unwrap_or(false)
    };

    json!({
        "id": graph.id.to_string(),
        "title": graph.title,
        "registry": graph.registry,
        "base_type": graph.base_type.registry(),
        "extends": graph.extends,
        "properties": export_properties(&graph.properties),
        "style": graph.style,
        "nodes": nodes,
        "edges": edges,
        "groups": graph.groups.iter().filter(keep_annotation).cloned().collect::<Vec<_>>(),
        "comments": graph.comments.iter().filter(keep_annotation).cloned().collect::<Vec<_>>(),
    })
}

fn export_node(node: &Node, mode: ExportMode) -> Json {
    let ephemeral: Vec<String> =
        node.kind().fields().into_iter().filter(|f| f.ephemeral).map(|f| f.name).collect();
    let properties = node
        .properties
        .iter()
        .filter(|(k, _)| !ephemeral.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut out = json!({
        "id": node.id.to_string(),
        "title": node.title,
        "registry": node.registry,
        "properties": export_properties(&properties),
        "breakpoint": node.breakpoint,
        "inherited": node.inherited,
    });
    if let Some(graph) = node.subgraph().filter(|_| BaseType::from_registry(&node.registry).is_some()) {
        out["graph"] = export_graph(graph, mode);
    }
    out
}

fn export_properties(properties: &crate::model::PropertyMap) -> Json {
    Json::Object(
        properties
            .iter()
            .filter(|(_, v)| !v.is_unresolved())
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

// ============================================================================
// Import
// ============================================================================

/// Definition with its `extends` chain merged in.
struct Flattened {
    header: Json,
    nodes: Vec<(Json, bool)>,
    /// Inherited edges first, so the child's own wiring wins on conflicts.
    edges: Vec<(String, Vec<String>)>,
    groups: Vec<Json>,
    comments: Vec<Json>,
}

pub fn import_graph(def: &Json, registry: &Registry) -> Result<Graph> {
    let flat = flatten(def, registry, &mut Vec::new())?;
    build(flat, registry)
}

pub fn import_graph_str(json: &str, registry: &Registry) -> Result<Graph> {
    import_graph(&serde_json::from_str(json)?, registry)
}

fn flatten(def: &Json, registry: &Registry, chain: &mut Vec<String>) -> Result<Flattened> {
    let own_nodes: Vec<(Json, bool)> = def
        .get("nodes")
        .and_then(Json::as_object)
        .map(|m| m.values().map(|n| (n.clone(), false)).collect())
        .unwrap_or_default();
    let own_edges = edge_list(def);
    let own_groups = list(def, "groups");
    let own_comments = list(def, "comments");

    let extends = def.get("extends").and_then(Json::as_str).filter(|s| !s.is_empty());
    let Some(parent_name) = extends else {
        return Ok(Flattened {
            header: def.clone(),
            nodes: own_nodes,
            edges: own_edges,
            groups: own_groups,
            comments: own_comments,
        });
    };

    if chain.iter().any(|c| c == parent_name) {
        return Err(Error::Registry(format!("circular extends through '{parent_name}'")));
    }
    chain.push(parent_name.to_string());
    let parent_def = registry
        .module_definition(parent_name)
        .ok_or_else(|| Error::Registry(format!("Node type '{parent_name}' not found")))?;
    let parent = flatten(&parent_def, registry, chain)?;
    chain.pop();

    let own_ids: Vec<&str> = own_nodes.iter().filter_map(|(n, _)| n.get("id").and_then(Json::as_str)).collect();
    let mut nodes: Vec<(Json, bool)> = parent
        .nodes
        .into_iter()
        .filter(|(n, _)| n.get("id").and_then(Json::as_str).is_none_or(|id| !own_ids.contains(&id)))
        .map(|(n, _)| (n, true))
        .collect();
    nodes.extend(own_nodes);

    let mut edges = parent.edges;
    edges.extend(own_edges);

    let mark = |mut a: Json| {
        if let Some(obj) = a.as_object_mut() {
            obj.insert("inherited".into(), Json::Bool(true));
        }
        a
    };
    let mut groups: Vec<Json> = parent.groups.into_iter().map(mark).collect();
    groups.extend(own_groups);
    let mut comments: Vec<Json> = parent.comments.into_iter().map(mark).collect();
    comments.extend(own_comments);

    let mut header = def.clone();
    if let (Some(parent_props), Some(obj)) =
        (parent.header.get("properties").and_then(Json::as_object), header.as_object_mut())
    {
        let mut merged = parent_props.clone();
        if let Some(own) = obj.get("properties").and_then(Json::as_object) {
            merged.extend(own.clone());
        }
        obj.insert("properties".into(), Json::Object(merged));
    }

    Ok(Flattened { header, nodes, edges, groups, comments })
}

fn edge_list(def: &Json) -> Vec<(String, Vec<String>)> {
    def.get("edges")
        .and_then(Json::as_object)
        .map(|m| {
            m.iter()
                .map(|(from, targets)| {
                    let targets = targets
                        .as_array()
                        .map(|a| a.iter().filter_map(Json::as_str).map(str::to_string).collect())
                        .unwrap_or_default();
                    (from.clone(), targets)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn list(def: &Json, key: &str) -> Vec<Json> {
    def.get(key).and_then(Json::as_array).cloned().unwrap_or_default()
}

fn str_field<'a>(def: &'a Json, key: &str) -> Option<&'a str> {
    def.get(key).and_then(Json::as_str)
}

fn build(flat: Flattened, registry: &Registry) -> Result<Graph> {
    let header = &flat.header;
    let base_type = str_field(header, "base_type")
        .map(|b| BaseType::from_registry(b).ok_or_else(|| Error::Registry(format!("unknown base type '{b}'"))))
        .transpose()?
        .unwrap_or_default();

    let mut graph = Graph::with_base_type(str_field(header, "title").unwrap_or("Graph"), base_type);
    if let Some(id) = str_field(header, "id") {
        graph.id = NodeId::from(id);
    }
    if let Some(registry_name) = str_field(header, "registry") {
        graph.registry = registry_name.to_string();
    }
    graph.extends = str_field(header, "extends").filter(|s| !s.is_empty()).map(str::to_string);
    graph.style = header
        .get("style")
        .filter(|s| !s.is_null())
        .map(|s| serde_json::from_value::<NodeStyle>(s.clone()))
        .transpose()?;
    if let Some(props) = header.get("properties").and_then(Json::as_object) {
        for (k, v) in props {
            graph.properties.insert(k.clone(), Value::from_json(v));
        }
    }
    graph.groups = flat.groups;
    graph.comments = flat.comments;

    for (def, inherited) in &flat.nodes {
        let mut node = import_node(def, registry)?;
        node.inherited = *inherited;
        graph.add_node(node);
    }

    for (from, targets) in &flat.edges {
        let from: SocketRef = from.parse()?;
        for to in targets {
            graph.connect_refs(from.clone(), to.parse()?)?;
        }
    }
    Ok(graph)
}

fn import_node(def: &Json, registry: &Registry) -> Result<Node> {
    let registry_name = str_field(def, "registry")
        .ok_or_else(|| Error::Registry("node definition has no registry name".into()))?;

    let mut node = match def.get("graph") {
        Some(inline) => import_graph(inline, registry)?.into_node(),
        None => registry.create(registry_name)?,
    };

    if let Some(id) = str_field(def, "id") {
        node.id = NodeId::from(id);
    }
    if let Some(title) = str_field(def, "title") {
        node.title = title.to_string();
    }
    node.breakpoint = def.get("breakpoint").and_then(Json::as_bool).unwrap_or(false);
    if let Some(props) = def.get("properties").and_then(Json::as_object) {
        for (k, v) in props {
            let value = Value::from_json(v);
            let value = match node.field(k) {
                Some(field) => field.kind.coerce(&value).unwrap_or(value),
                None => value,
            };
            node.properties.insert(k.clone(), value);
        }
    }
    Ok(node)
}
