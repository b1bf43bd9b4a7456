//! Callable function graphs.
//!
//! A `Function` graph declares its parameters with `core/functions/Argument`
//! nodes and its result with a `core/functions/Return` node. Calling a
//! [`FunctionWrapper`] runs the graph in a fresh child state up to the
//! return node and yields what arrived there.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::execution::execute_to_node_in;
use crate::focal::{Argument, CallbackFn};
use crate::graph::Graph;
use crate::model::{PropertyMap, Value};
use crate::state::GraphState;
use crate::{Error, Result};

pub const ARGUMENT: &str = "core/functions/Argument";
pub const RETURN: &str = "core/functions/Return";

/// Run-data key holding the call's keyword arguments.
pub(crate) const ARGS_KEY: &str = "__fn_args";
/// Run-data key the return node writes its value to.
pub(crate) const RESULT_KEY: &str = "__fn_result";

pub struct FunctionWrapper {
    graph: Arc<Graph>,
    properties: PropertyMap,
}

impl FunctionWrapper {
    pub fn new(graph: Arc<Graph>, properties: PropertyMap) -> Self {
        Self { graph, properties }
    }

    pub fn name(&self) -> &str {
        &self.graph.title
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Parameters declared by the graph's argument nodes.
    pub fn arguments(&self) -> Vec<Argument> {
        self.graph
            .nodes_by_registry(ARGUMENT)
            .filter_map(|n| {
                let name = n.get_property("name").as_str().filter(|s| !s.is_empty())?.to_string();
                let kind = n.get_property("typ").as_str().unwrap_or("str").to_string();
                Some(Argument::new(&name, &kind))
            })
            .collect()
    }

    /// Run the function graph with keyword `arguments` beneath `parent`.
    ///
    /// Yields `Unresolved` when the return node was never reached.
    pub async fn call(&self, parent: &GraphState, arguments: PropertyMap) -> Result<Value> {
        let ret = self
            .graph
            .nodes_by_registry(RETURN)
            .next()
            .ok_or_else(|| Error::Graph(format!("function '{}' has no return node", self.graph.title)))?;

        debug!(function = %self.name(), args = arguments.len(), "calling function");
        let inner = parent.child(&self.graph);
        let mut properties = self.graph.module_properties();
        properties.extend(self.properties.clone());
        inner.set_module_properties(properties);
        inner.set_data(ARGS_KEY, Value::Map(arguments));

        execute_to_node_in(&self.graph, &inner, &ret.id, true).await?;
        Ok(inner.take_data(RESULT_KEY).unwrap_or(Value::Unresolved))
    }
}

impl fmt::Debug for FunctionWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionWrapper").field("name", &self.name()).finish()
    }
}

#[async_trait]
impl CallbackFn for FunctionWrapper {
    async fn call(&self, state: &GraphState, arguments: PropertyMap) -> Result<Value> {
        FunctionWrapper::call(self, state, arguments).await
    }
}
