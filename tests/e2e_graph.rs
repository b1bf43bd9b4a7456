//! End-to-end tests for graph execution: ordering, modules, loops,
//! error handling and breakpoints.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use talemate_core::execution::ERROR_KEY;
use talemate_core::graph::flat::{export_graph, import_graph, ExportMode};
use talemate_core::signals;
use talemate_core::{
    registry, run, run_with, BaseType, Error, Graph, GraphState, Node, NodeContext, NodeId, NodeKind, PropertyMap,
    Result, RunOptions, Runtime, SwallowErrors, Value,
};

fn create(name: &str) -> Node {
    registry::global().create(name).unwrap()
}

fn make_value(graph: &mut Graph, value: Value) -> NodeId {
    let id = graph.add_node(create("core/MakeValue"));
    graph.set_node_property(&id, "value", value).unwrap();
    id
}

/// Records its title when it runs and forwards the first connected input.
struct Record(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl NodeKind for Record {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        self.0.lock().push(ctx.node.title.clone());
        let value = ctx
            .node
            .inputs
            .iter()
            .map(|s| ctx.get_input_value(&s.name))
            .find(|v| !v.is_unresolved())
            .unwrap_or(Value::Bool(true));
        ctx.set_output("value", value);
        Ok(())
    }
}

fn recorder(log: &Arc<Mutex<Vec<String>>>, title: &str, inputs: &[&str]) -> Node {
    inputs
        .iter()
        .fold(Node::new("test/Record", title, Record(Arc::clone(log))), |node, name| node.input(name, "any"))
        .output("value", "any")
}

// ============================================================================
// 1. Ordering
// ============================================================================

#[tokio::test]
async fn test_node_runs_after_all_of_its_sources() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut graph = Graph::new("order");
    let c = graph.add_node(recorder(&log, "C", &["b", "d"]));
    let b = graph.add_node(recorder(&log, "B", &["a"]));
    let d = graph.add_node(recorder(&log, "D", &[]));
    let a = graph.add_node(recorder(&log, "A", &[]));
    graph.connect((&a, "value"), (&b, "a")).unwrap();
    graph.connect((&b, "value"), (&c, "b")).unwrap();
    graph.connect((&d, "value"), (&c, "d")).unwrap();

    let root = GraphState::root(Runtime::default());
    let inner = run(&Arc::new(graph), &root).await.unwrap();

    let order = log.lock().clone();
    assert_eq!(order.len(), 4);
    let pos = |t: &str| order.iter().position(|o| o == t).unwrap();
    assert!(pos("A") < pos("B"));
    assert!(pos("B") < pos("C"));
    assert!(pos("D") < pos("C"));
    assert_eq!(inner.output(&c, "value"), Value::Bool(true));
}

#[tokio::test]
async fn test_stage_orders_independent_chains() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut graph = Graph::new("stages");
    let late_stage = graph.add_node(create("core/Stage"));
    graph.set_node_property(&late_stage, "stage", Value::Int(2)).unwrap();
    let late = graph.add_node(recorder(&log, "late", &["state"]));
    graph.connect((&late_stage, "state"), (&late, "state")).unwrap();

    let early_stage = graph.add_node(create("core/Stage"));
    graph.set_node_property(&early_stage, "stage", Value::Int(1)).unwrap();
    let early = graph.add_node(recorder(&log, "early", &["state"]));
    graph.connect((&early_stage, "state"), (&early, "state")).unwrap();

    let root = GraphState::root(Runtime::default());
    run(&Arc::new(graph), &root).await.unwrap();
    assert_eq!(*log.lock(), vec!["early".to_string(), "late".to_string()]);
}

// ============================================================================
// 2. Modules
// ============================================================================

fn doubler_module() -> Graph {
    let mut graph = Graph::new("echo").with_registry("test/Echo");
    let input = graph.add_node(create("core/Input"));
    graph.set_node_property(&input, "input_name", Value::from("text")).unwrap();
    let route = graph.add_node(create("core/Route"));
    let output = graph.add_node(create("core/Output"));
    graph.set_node_property(&output, "output_name", Value::from("echoed")).unwrap();
    graph.connect((&input, "value"), (&route, "value")).unwrap();
    graph.connect((&route, "value"), (&output, "value")).unwrap();
    graph
}

#[tokio::test]
async fn test_module_inputs_and_outputs() {
    let module = doubler_module();
    let root = GraphState::root(Runtime::default());
    let options = RunOptions {
        inputs: PropertyMap::from([("text".to_string(), Value::from("hello"))]),
        ..Default::default()
    };
    let inner = run_with(&Arc::new(module.clone()), &root, options).await.unwrap();
    assert_eq!(
        talemate_core::execution::graph_outputs(&module, &inner).get("echoed"),
        Some(&Value::from("hello"))
    );

    let mut outer = Graph::new("outer");
    let text = make_value(&mut outer, Value::from("nested"));
    let node = outer.add_node(module.into_node());
    let watch = outer.add_node(create("core/Watch"));
    outer.connect((&text, "value"), (&node, "text")).unwrap();
    outer.connect((&node, "echoed"), (&watch, "value")).unwrap();

    let inner = run(&Arc::new(outer), &root).await.unwrap();
    assert_eq!(inner.output(&watch, "value"), Value::from("nested"));
}

#[tokio::test]
async fn test_module_survives_flat_round_trip() {
    let json = export_graph(&doubler_module(), ExportMode::Save);
    let imported = import_graph(&json, registry::global()).unwrap();
    assert_eq!(export_graph(&imported, ExportMode::Save), json);
    assert_eq!(imported.module_inputs()[0].name, "text");
    assert_eq!(imported.module_outputs()[0].name, "echoed");
}

// ============================================================================
// 3. Loops
// ============================================================================

/// Outputs whether it has run `limit` times.
struct Counter {
    runs: Arc<AtomicUsize>,
    limit: usize,
}

#[async_trait]
impl NodeKind for Counter {
    async fn run(&self, ctx: &NodeContext<'_>) -> Result<()> {
        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.set_output("done", Value::Bool(runs >= self.limit));
        Ok(())
    }
}

#[tokio::test]
async fn test_loop_break() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::with_base_type("loop", BaseType::Loop);
    let counter = graph.add_node(
        Node::new("test/Counter", "Counter", Counter { runs: Arc::clone(&runs), limit: 3 }).output("done", "bool"),
    );
    let switch = graph.add_node(create("core/Switch"));
    let brk = graph.add_node(create("core/LoopBreak"));
    graph.connect((&counter, "done"), (&switch, "value")).unwrap();
    graph.connect((&switch, "yes"), (&brk, "state")).unwrap();

    let root = GraphState::root(Runtime::default());
    run(&Arc::new(graph), &root).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_loop_exit_condition() {
    let runs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&runs);
    let mut graph = Graph::with_base_type("loop", BaseType::Loop)
        .with_exit_condition(Arc::new(move |_state: &GraphState| seen.load(Ordering::SeqCst) >= 5));
    graph.add_node(
        Node::new("test/Counter", "Counter", Counter { runs: Arc::clone(&runs), limit: usize::MAX })
            .output("done", "bool"),
    );

    let root = GraphState::root(Runtime::default());
    run(&Arc::new(graph), &root).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_scene_loop_stops_when_scene_inactive() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::with_base_type("scene", BaseType::SceneLoop);
    graph.add_node(
        Node::new("test/Counter", "Counter", Counter { runs: Arc::clone(&runs), limit: usize::MAX })
            .output("done", "bool"),
    );
    let root = GraphState::root(Runtime::default());
    root.shared().set_scene_active(false);
    run(&Arc::new(graph), &root).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

// ============================================================================
// 4. Errors
// ============================================================================

#[tokio::test]
async fn test_unhandled_error_reaches_caller() {
    let mut graph = Graph::new("g");
    let text = make_value(&mut graph, Value::from("not a function"));
    let call = graph.add_node(create("core/functions/CallFunction"));
    graph.connect((&text, "value"), (&call, "fn")).unwrap();

    let root = GraphState::root(Runtime::default());
    let err = run(&Arc::new(graph), &root).await.unwrap_err();
    assert!(matches!(&err, Error::InputValue { input, .. } if input == "fn"), "{err}");
}

#[tokio::test]
async fn test_graph_error_handler_swallows() {
    let mut graph = Graph::new("g");
    graph.add_node(create("core/Watch"));
    graph.on_error(Arc::new(SwallowErrors));
    let root = GraphState::root(Runtime::default());
    let inner = run(&Arc::new(graph), &root).await.unwrap();
    assert!(matches!(inner.data(ERROR_KEY), Some(Value::Error(_))));
}

/// Function graph returning the name of the error it is given.
fn error_name_function() -> Graph {
    let mut graph = Graph::with_base_type("on_error", BaseType::Function);
    let exc = graph.add_node(create("core/functions/Argument"));
    graph.set_node_property(&exc, "name", Value::from("exc")).unwrap();
    let unpack = graph.add_node(create("core/functions/UnpackException"));
    let ret = graph.add_node(create("core/functions/Return"));
    graph.connect((&exc, "value"), (&unpack, "exc")).unwrap();
    graph.connect((&unpack, "name"), (&ret, "value")).unwrap();
    graph
}

#[tokio::test]
async fn test_error_handler_node_catches() {
    let mut graph = Graph::new("g");
    let function = graph.add_node(error_name_function().into_node());
    let handler = graph.add_node(create("core/ErrorHandler"));
    graph.connect((&function, "fn"), (&handler, "fn")).unwrap();
    // fails: required input without a source
    graph.add_node(create("core/Watch"));

    let root = GraphState::root(Runtime::default());
    run(&Arc::new(graph), &root).await.unwrap();
}

#[tokio::test]
async fn test_passthrough_errors_skip_handlers() {
    struct Reject;

    #[async_trait]
    impl NodeKind for Reject {
        async fn run(&self, _ctx: &NodeContext<'_>) -> Result<()> {
            Err(Error::ActionRejected("no".into()))
        }
    }

    let mut graph = Graph::new("g");
    graph.add_node(Node::new("test/Reject", "Reject", Reject));
    graph.on_error(Arc::new(SwallowErrors));
    let root = GraphState::root(Runtime::default());
    let err = run(&Arc::new(graph), &root).await.unwrap_err();
    assert!(matches!(err, Error::ActionRejected(_)));
}

// ============================================================================
// 5. Breakpoints
// ============================================================================

#[tokio::test]
async fn test_breakpoint_waits_for_release() {
    let mut graph = Graph::new("g");
    let value = make_value(&mut graph, Value::Int(9));
    let bp = graph.add_node(create("core/functions/Breakpoint"));
    graph.connect((&value, "value"), (&bp, "state")).unwrap();

    let mut config = talemate_core::RuntimeConfig::default();
    config.poll_interval_ms = 10;
    let root = GraphState::root(Runtime::new(config));
    let shared = Arc::clone(root.shared_arc());

    let release = async {
        while shared.breakpoint().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(shared.release_breakpoint());
    };
    let graph = Arc::new(graph);
    let (inner, ()) = tokio::join!(run(&graph, &root), release);
    assert_eq!(inner.unwrap().output(&bp, "state"), Value::Int(9));
    assert!(shared.breakpoint().is_none());
}

#[tokio::test]
async fn test_breakpoint_stops_graph_when_scene_ends() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut graph = Graph::new("g");
    let value = make_value(&mut graph, Value::Int(1));
    let bp = graph.add_node(create("core/functions/Breakpoint"));
    let after = graph.add_node(recorder(&log, "after", &["state"]));
    graph.connect((&value, "value"), (&bp, "state")).unwrap();
    graph.connect((&bp, "state"), (&after, "state")).unwrap();

    let mut config = talemate_core::RuntimeConfig::default();
    config.poll_interval_ms = 10;
    let root = GraphState::root(Runtime::new(config));
    let shared = Arc::clone(root.shared_arc());

    let stop = async {
        while shared.breakpoint().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shared.set_scene_active(false);
    };
    let graph = Arc::new(graph);
    let (result, ()) = tokio::join!(run(&graph, &root), stop);
    result.unwrap();
    assert!(log.lock().is_empty());
    assert!(shared.breakpoint().is_none());
}

// ============================================================================
// 6. Node states
// ============================================================================

fn two_node_graph() -> Graph {
    let mut graph = Graph::new("states");
    let make = make_value(&mut graph, Value::from("x"));
    let watch = graph.add_node(create("core/Watch"));
    graph.connect((&make, "value"), (&watch, "value")).unwrap();
    graph
}

#[tokio::test]
async fn test_no_node_states_outside_creative_mode() {
    let root = GraphState::root(Runtime::default());
    let mut states = root.bus().subscribe_to(signals::NODES_NODE_STATE);

    let inner = run(&Arc::new(two_node_graph()), &root).await.unwrap();

    assert!(states.drain().is_empty());
    assert!(inner.flattened().is_empty());
}

#[tokio::test]
async fn test_node_states_published_in_creative_mode() {
    let root = GraphState::root(Runtime::default());
    root.shared().set_creative_mode(true);
    let mut states = root.bus().subscribe_to(signals::NODES_NODE_STATE);

    let inner = run(&Arc::new(two_node_graph()), &root).await.unwrap();

    // the first record goes out at once, the rest is flushed when the run ends
    let titles: Vec<String> = states
        .drain()
        .iter()
        .flat_map(|s| s.payload["stack"].as_array().cloned().unwrap_or_default())
        .filter_map(|record| record["title"].as_str().map(str::to_string))
        .collect();
    assert_eq!(titles, vec!["Make Value".to_string(), "Watch".to_string()]);
    assert!(inner.flattened().is_empty());
}
