//! # talemate-core — Node-Graph Runtime & Scene Changelog
//!
//! The engine behind an AI-driven storytelling workbench: a dataflow
//! node-graph runtime that schedules agent work as typed nodes, and an
//! incremental changelog that records every mutation of the scene
//! document so any prior revision can be rebuilt.
//!
//! ## Design Principles
//!
//! 1. **Arena graphs**: nodes live in a `Vec` inside their `Graph`, edges reference sockets by `"<node>.<socket>"`
//! 2. **Trait-first nodes**: every node kind implements [`NodeKind`] and is discoverable by registry name
//! 3. **State outside nodes**: socket values and property overrides live in [`GraphState`], so a graph is immutable while it runs
//! 4. **Disk is the truth**: the changelog files are the durable history; memory sessions only stage deltas
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use talemate_core::{registry, run, Graph, GraphState, Runtime, Value};
//!
//! # async fn example() -> talemate_core::Result<()> {
//! let mut graph = Graph::new("demo");
//! let make = graph.add_node(registry::global().create("core/MakeValue")?);
//! let watch = graph.add_node(registry::global().create("core/Watch")?);
//! graph.connect((&make, "value"), (&watch, "value"))?;
//! graph.set_node_property(&make, "value", Value::from("hello"))?;
//!
//! let state = GraphState::root(Runtime::default());
//! let inner = run(&Arc::new(graph), &state).await?;
//! assert_eq!(inner.output(&watch, "value"), Value::from("hello"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! | Layer | Module | Responsibility |
//! |-------|--------|----------------|
//! | L1 | `model` | `Value` with `Unresolved`, socket-type algebra |
//! | L2 | `node` | sockets, properties, the `NodeKind` contract |
//! | L3 | `graph`, `registry` | containment, flat form, `extends` merging |
//! | L4 | `execution`, `state`, `signals` | scheduling, loops, breakpoints |
//! | L5 | `function` | subgraphs as callables |
//! | L6 | `focal`, `llm` | LLM call dispatch |
//! | L7 | `ux` | interactive wait-nodes |
//! | L8 | `scene` | scene document projection |
//! | L9–L10 | `changelog` | delta segments, in-memory sessions |

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod model;
pub mod node;
pub mod graph;
pub mod registry;
pub mod state;
pub mod signals;
pub mod execution;
pub mod nodes;
pub mod function;
pub mod focal;
pub mod llm;
pub mod ux;
pub mod scene;
pub mod changelog;

// ============================================================================
// Re-exports: Model (the DTOs)
// ============================================================================

pub use model::{
    Value, ErrorInfo, PropertyMap, PropertyField, PropertyType,
    Socket, SocketRef, SocketType,
};

// ============================================================================
// Re-exports: Graph runtime
// ============================================================================

pub use node::{Node, NodeId, NodeKind, NodeContext, NodeStyle, NodeVerbosity};
pub use graph::{Graph, BaseType};
pub use state::{GraphState, NodeState, ParentData, Runtime, SharedState};
pub use signals::{Signal, SignalBus};
pub use execution::{
    run, run_with, execute_to_node, dispatch_event,
    ErrorHandler, GraphCallback, RunOptions, SwallowErrors,
};
pub use function::FunctionWrapper;

// ============================================================================
// Re-exports: Focal, UX, Scene
// ============================================================================

pub use focal::{callback_fn, collect_calls, Argument, Call, Callback, CallbackFn, Focal};
pub use llm::{Agent, AgentRegistry, LlmClient, PromptRenderer};
pub use ux::{UxChoice, UxElement, UxSelection};
pub use scene::{Scene, SceneRef};

// ============================================================================
// Re-exports: Changelog
// ============================================================================

pub use changelog::{
    append_scene_delta, reconstruct_scene_data, rollback_scene_to_revision,
    list_revisions, list_revision_entries, latest_revision_at,
    delete_changelog_files, save_changelog, write_reconstructed_scene,
    DeleteReport, RevisionEntry, session::InMemoryChangelog,
};
pub use config::{RuntimeConfig, ChangelogConfig};

// ============================================================================
// Error Types
// ============================================================================

/// Control-flow signals carried through the error channel.
///
/// These unwind a graph run without being errors in the reporting sense:
/// graph error handlers never see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Leave the innermost loop.
    Break,
    /// Skip to the next iteration of the innermost loop.
    Continue,
    /// Leave every loop up to the scene loop.
    Exit,
    /// End the current graph run quietly.
    StopGraph,
    /// End the current module run; the enclosing graph carries on.
    StopModule,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Error in node {node} input {input}: {message}")]
    InputValue { node: String, input: String, message: String },

    #[error("Action rejected: {0}")]
    ActionRejected(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Data parsing error: {message}")]
    DataParsing { message: String, data: Option<String> },

    #[error("Delta error: {0}")]
    Delta(String),

    #[error("Invalid revision: {requested}. Latest available is {latest}.")]
    InvalidRevision { requested: i64, latest: u64 },

    #[error("Cycle detected: {0}")]
    Cycle(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Socket type mismatch: {from} ({from_type}) -> {to} ({to_type})")]
    SocketType { from: String, from_type: String, to: String, to_type: String },

    #[error("Flow control: {0:?}")]
    Flow(Flow),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Errors that bypass graph error handlers and travel straight to the caller.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            Error::ActionRejected(_) | Error::Flow(_) | Error::Cancelled
        )
    }

    /// Short kind name, used when an error is handed to graph nodes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InputValue { .. } => "InputValueError",
            Error::ActionRejected(_) => "ActionRejected",
            Error::UnknownAction(_) => "UnknownAction",
            Error::DataParsing { .. } => "DataParsingError",
            Error::Delta(_) => "DeltaError",
            Error::InvalidRevision { .. } => "InvalidRevision",
            Error::Cycle(_) => "CycleError",
            Error::Registry(_) => "RegistryError",
            Error::Graph(_) => "GraphError",
            Error::SocketType { .. } => "SocketTypeError",
            Error::Flow(_) => "Flow",
            Error::Llm(_) => "LlmError",
            Error::Cancelled => "Cancelled",
            Error::Io(_) => "IoError",
            Error::Json(_) => "JsonError",
            Error::Yaml(_) => "YamlError",
        }
    }

    pub(crate) fn input(node: &str, input: &str, message: impl Into<String>) -> Self {
        Error::InputValue { node: node.to_string(), input: input.to_string(), message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
