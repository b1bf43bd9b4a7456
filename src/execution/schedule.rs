//! Scheduling: split a graph into chains and order each chain.
//!
//! 1. Build a node-level DAG from the socket edges (cycles are rejected).
//! 2. Group nodes into weakly connected chains.
//! 3. Order every chain by walking backwards from its terminal nodes
//!    (no outgoing edges) so each node comes after all of its upstreams.
//! 4. Sort chains by their lowest `core/Stage` value; unstaged chains go last.

use std::collections::{BTreeMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::Direction;

use crate::graph::{Graph, STAGE};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    /// Arena indices in execution order.
    pub order: Vec<usize>,
    pub priority: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub chains: Vec<Chain>,
}

struct Dag {
    graph: DiGraph<usize, ()>,
    index: Vec<NodeIndex>,
}

impl Dag {
    fn build(graph: &Graph, subset: Option<&HashSet<usize>>) -> Result<Self> {
        let included = |i: usize| subset.is_none_or(|s| s.contains(&i));
        let mut dag = DiGraph::with_capacity(graph.len(), graph.len());
        let index: Vec<NodeIndex> = (0..graph.len()).map(|i| dag.add_node(i)).collect();
        for (a, b) in graph.dependencies() {
            if included(a) && included(b) {
                dag.add_edge(index[a], index[b], ());
            }
        }
        if is_cyclic_directed(&dag) {
            return Err(Error::Cycle(format!("graph '{}' contains a cycle", graph.title)));
        }
        Ok(Self { graph: dag, index })
    }

    fn neighbors(&self, node: usize, dir: Direction) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(self.index[node], dir)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Post-order walk over upstream edges, starting at `terminals`.
    fn order_from(&self, terminals: &[usize]) -> Vec<usize> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<(usize, bool)> = terminals.iter().rev().map(|&t| (t, false)).collect();
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if !visited.insert(node) {
                continue;
            }
            stack.push((node, true));
            for upstream in self.neighbors(node, Direction::Incoming).into_iter().rev() {
                if !visited.contains(&upstream) {
                    stack.push((upstream, false));
                }
            }
        }
        order
    }
}

impl Schedule {
    pub fn build(graph: &Graph) -> Result<Self> {
        Self::build_subset(graph, None)
    }

    /// Schedule only the nodes in `subset` (all nodes when `None`).
    pub fn build_subset(graph: &Graph, subset: Option<&HashSet<usize>>) -> Result<Self> {
        let dag = Dag::build(graph, subset)?;
        let members: Vec<usize> = (0..graph.len()).filter(|i| subset.is_none_or(|s| s.contains(i))).collect();

        let mut components: UnionFind<usize> = UnionFind::new(graph.len());
        for edge in dag.graph.raw_edges() {
            components.union(dag.graph[edge.source()], dag.graph[edge.target()]);
        }
        let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut first_seen: Vec<usize> = Vec::new();
        for &m in &members {
            let root = components.find(m);
            grouped
                .entry(root)
                .or_insert_with(|| {
                    first_seen.push(root);
                    Vec::new()
                })
                .push(m);
        }

        let mut chains: Vec<Chain> = first_seen
            .into_iter()
            .filter_map(|root| grouped.remove(&root))
            .map(|nodes| {
                let terminals: Vec<usize> = nodes
                    .iter()
                    .copied()
                    .filter(|&n| dag.neighbors(n, Direction::Outgoing).is_empty())
                    .collect();
                let priority = nodes
                    .iter()
                    .map(|&n| graph.node_at(n))
                    .filter(|n| n.registry == STAGE)
                    .filter_map(|n| n.get_property("stage").as_int())
                    .min()
                    .unwrap_or(i64::MAX);
                Chain { order: dag.order_from(&terminals), priority }
            })
            .collect();
        chains.sort_by_key(|c| c.priority);
        Ok(Self { chains })
    }
}

/// Upstream closure of `target` (inclusive). With `include_forks`, nodes
/// hanging off that closure which do not lead back into `target` are added too.
pub fn ancestors(graph: &Graph, target: usize, include_forks: bool) -> HashSet<usize> {
    let deps = graph.dependencies();
    let upstream_of = |n: usize| deps.iter().filter(move |(_, b)| *b == n).map(|(a, _)| *a);
    let downstream_of = |n: usize| deps.iter().filter(move |(a, _)| *a == n).map(|(_, b)| *b);

    let mut set = HashSet::from([target]);
    let mut stack = vec![target];
    while let Some(n) = stack.pop() {
        for up in upstream_of(n) {
            if set.insert(up) {
                stack.push(up);
            }
        }
    }
    if !include_forks {
        return set;
    }

    let mut forks = HashSet::new();
    let mut stack: Vec<usize> = set.iter().copied().filter(|&n| n != target).collect();
    while let Some(n) = stack.pop() {
        for down in downstream_of(n) {
            if !set.contains(&down) && forks.insert(down) {
                stack.push(down);
            }
        }
    }
    set.extend(forks);
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use crate::node::NodeId;
    use crate::registry::global;

    fn route(graph: &mut Graph) -> NodeId {
        graph.add_node(global().create("core/Route").unwrap())
    }

    #[test]
    fn test_order_respects_dependencies() {
        // A -> B -> C <- D
        let mut g = Graph::new("g");
        let a = route(&mut g);
        let b = route(&mut g);
        let c = global().create("core/ORRouter").unwrap();
        let c = g.add_node(c);
        let d = route(&mut g);
        g.connect((&a, "value"), (&b, "value")).unwrap();
        g.connect((&b, "value"), (&c, "a")).unwrap();
        g.connect((&d, "value"), (&c, "b")).unwrap();

        let schedule = Schedule::build(&g).unwrap();
        assert_eq!(schedule.chains.len(), 1);
        let order = &schedule.chains[0].order;
        let pos = |id: &NodeId| order.iter().position(|&i| i == g.index_of(id).unwrap()).unwrap();
        assert!(pos(&a) < pos(&b));
        assert!(pos(&b) < pos(&c));
        assert!(pos(&d) < pos(&c));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_chains_sorted_by_stage() {
        let mut g = Graph::new("g");
        let plain = route(&mut g);
        let stage = g.add_node(global().create(STAGE).unwrap());
        g.set_node_property(&stage, "stage", Value::Int(-5)).unwrap();

        let schedule = Schedule::build(&g).unwrap();
        assert_eq!(schedule.chains.len(), 2);
        assert_eq!(schedule.chains[0].order, vec![g.index_of(&stage).unwrap()]);
        assert_eq!(schedule.chains[1].order, vec![g.index_of(&plain).unwrap()]);
        assert_eq!(schedule.chains[1].priority, i64::MAX);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut g = Graph::new("loopy");
        let a = route(&mut g);
        let b = route(&mut g);
        g.connect((&a, "value"), (&b, "value")).unwrap();
        g.connect((&b, "value"), (&a, "value")).unwrap();
        let err = Schedule::build(&g).unwrap_err();
        assert!(matches!(err, Error::Cycle(_)));
    }

    #[test]
    fn test_ancestors_with_forks() {
        // a -> b -> target, a -> fork
        let mut g = Graph::new("g");
        let a = route(&mut g);
        let b = route(&mut g);
        let target = route(&mut g);
        let fork = route(&mut g);
        let unrelated = route(&mut g);
        g.connect((&a, "value"), (&b, "value")).unwrap();
        g.connect((&b, "value"), (&target, "value")).unwrap();
        g.connect((&a, "value"), (&fork, "value")).unwrap();

        let t = g.index_of(&target).unwrap();
        let plain = ancestors(&g, t, false);
        assert_eq!(plain.len(), 3);
        assert!(!plain.contains(&g.index_of(&fork).unwrap()));

        let with_forks = ancestors(&g, t, true);
        assert!(with_forks.contains(&g.index_of(&fork).unwrap()));
        assert!(!with_forks.contains(&g.index_of(&unrelated).unwrap()));

        let schedule = Schedule::build_subset(&g, Some(&plain)).unwrap();
        assert_eq!(schedule.chains.len(), 1);
        assert_eq!(schedule.chains[0].order.last(), Some(&t));
    }
}
