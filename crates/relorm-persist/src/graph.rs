//! Directed dependency graph with deterministic ordering.
//!
//! An edge `from -> to` means "`from` depends on `to`": in
//! [`DependencyGraph::overall_order`], `to` comes first. Sibling traversal
//! follows edge insertion order, so identical input produces identical
//! output.

use crate::error::GraphError;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// A dependency graph over nodes of type `N` carrying data `D`.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N, D = ()> {
    /// Nodes in insertion order.
    nodes: Vec<N>,
    data: HashMap<N, D>,
    outgoing: HashMap<N, Vec<N>>,
    incoming: HashMap<N, Vec<N>>,
}

/// Short-lived DFS state for one traversal.
///
/// The walk keeps its own frame stack, so the depth of a chain is bounded
/// by memory rather than by the thread stack.
struct Traversal<N> {
    leaves_only: bool,
    visited: HashSet<N>,
    on_path: HashSet<N>,
    path: Vec<N>,
    result: Vec<N>,
}

impl<N: Clone + Eq + Hash> Traversal<N> {
    fn new(leaves_only: bool) -> Self {
        Self {
            leaves_only,
            visited: HashSet::new(),
            on_path: HashSet::new(),
            path: Vec::new(),
            result: Vec::new(),
        }
    }

    fn enter(&mut self, node: &N) {
        self.visited.insert(node.clone());
        self.on_path.insert(node.clone());
        self.path.push(node.clone());
    }

    fn visit(&mut self, edges: &HashMap<N, Vec<N>>, start: &N) -> Result<(), GraphError<N>> {
        // (node, index of the next outgoing edge to follow)
        let mut frames: Vec<(N, usize)> = vec![(start.clone(), 0)];
        self.enter(start);

        while let Some(frame) = frames.last_mut() {
            let targets = edges.get(&frame.0).map_or(&[][..], Vec::as_slice);
            let Some(next) = targets.get(frame.1) else {
                let leaf = targets.is_empty();
                let Some((node, _)) = frames.pop() else {
                    break;
                };
                self.path.pop();
                self.on_path.remove(&node);
                if !self.leaves_only || leaf {
                    self.result.push(node);
                }
                continue;
            };
            frame.1 += 1;

            if !self.visited.contains(next) {
                self.enter(next);
                frames.push((next.clone(), 0));
            } else if self.on_path.contains(next) {
                let pos = self.path.iter().position(|n| n == next).unwrap_or(0);
                let mut cycle = self.path[pos..].to_vec();
                cycle.push(next.clone());
                return Err(GraphError::Cycle(cycle));
            }
        }
        Ok(())
    }
}

impl<N, D> Default for DependencyGraph<N, D> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            data: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }
}

impl<N, D> DependencyGraph<N, D>
where
    N: Clone + Eq + Hash + fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_node(&self, node: &N) -> bool {
        self.data.contains_key(node)
    }

    pub fn node_data(&self, node: &N) -> Option<&D> {
        self.data.get(node)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[N] {
        &self.nodes
    }

    /// Add a node. A node that already exists keeps its data.
    pub fn add_node(&mut self, node: N, data: D) {
        if self.has_node(&node) {
            return;
        }
        self.nodes.push(node.clone());
        self.outgoing.insert(node.clone(), Vec::new());
        self.incoming.insert(node.clone(), Vec::new());
        self.data.insert(node, data);
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, node: &N) {
        if self.data.remove(node).is_none() {
            return;
        }
        self.nodes.retain(|n| n != node);
        self.outgoing.remove(node);
        self.incoming.remove(node);
        for edges in self.outgoing.values_mut().chain(self.incoming.values_mut()) {
            edges.retain(|n| n != node);
        }
    }

    /// Record that `from` depends on `to`.
    pub fn add_dependency(&mut self, from: &N, to: &N) -> Result<(), GraphError<N>> {
        if !self.has_node(from) {
            return Err(GraphError::NodeNotFound(from.clone()));
        }
        if !self.has_node(to) {
            return Err(GraphError::NodeNotFound(to.clone()));
        }
        if let Some(out) = self.outgoing.get_mut(from) {
            if !out.contains(to) {
                out.push(to.clone());
            }
        }
        if let Some(inc) = self.incoming.get_mut(to) {
            if !inc.contains(from) {
                inc.push(from.clone());
            }
        }
        Ok(())
    }

    pub fn remove_dependency(&mut self, from: &N, to: &N) {
        if let Some(out) = self.outgoing.get_mut(from) {
            out.retain(|n| n != to);
        }
        if let Some(inc) = self.incoming.get_mut(to) {
            inc.retain(|n| n != from);
        }
    }

    /// Everything `node` transitively depends on, deepest first.
    pub fn dependencies_of(&self, node: &N, leaves_only: bool) -> Result<Vec<N>, GraphError<N>> {
        self.closure(&self.outgoing, node, leaves_only)
    }

    /// Everything that transitively depends on `node`, deepest first.
    pub fn dependants_of(&self, node: &N, leaves_only: bool) -> Result<Vec<N>, GraphError<N>> {
        self.closure(&self.incoming, node, leaves_only)
    }

    fn closure(
        &self,
        edges: &HashMap<N, Vec<N>>,
        node: &N,
        leaves_only: bool,
    ) -> Result<Vec<N>, GraphError<N>> {
        if !self.has_node(node) {
            return Err(GraphError::NodeNotFound(node.clone()));
        }
        let mut traversal = Traversal::new(leaves_only);
        traversal.visit(edges, node)?;
        let mut result = traversal.result;
        result.retain(|n| n != node);
        Ok(result)
    }

    /// A global order in which every dependency precedes its dependants.
    ///
    /// The whole graph is checked for cycles before any order is produced.
    pub fn overall_order(&self, leaves_only: bool) -> Result<Vec<N>, GraphError<N>> {
        let mut cycle_check = Traversal::new(false);
        for node in &self.nodes {
            if !cycle_check.visited.contains(node) {
                cycle_check.visit(&self.outgoing, node)?;
            }
        }

        let mut traversal = Traversal::new(leaves_only);
        for node in &self.nodes {
            let is_root = self.incoming.get(node).is_none_or(Vec::is_empty);
            if is_root && !traversal.visited.contains(node) {
                traversal.visit(&self.outgoing, node)?;
            }
        }
        Ok(traversal.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&'static str]) -> DependencyGraph<&'static str> {
        let mut g = DependencyGraph::new();
        for n in nodes {
            g.add_node(*n, ());
        }
        g
    }

    fn position(order: &[&str], node: &str) -> usize {
        order.iter().position(|n| *n == node).unwrap()
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut g: DependencyGraph<&str, i32> = DependencyGraph::new();
        g.add_node("a", 1);
        g.add_node("a", 2);
        assert_eq!(g.len(), 1);
        assert_eq!(g.node_data(&"a"), Some(&1));
    }

    #[test]
    fn test_add_dependency_requires_nodes() {
        let mut g = graph(&["a"]);
        assert_eq!(
            g.add_dependency(&"a", &"b"),
            Err(GraphError::NodeNotFound("b"))
        );
        assert_eq!(
            g.add_dependency(&"c", &"a"),
            Err(GraphError::NodeNotFound("c"))
        );
    }

    #[test]
    fn test_dependencies_of_deepest_first() {
        let mut g = graph(&["a", "b", "c", "d"]);
        g.add_dependency(&"a", &"b").unwrap();
        g.add_dependency(&"b", &"c").unwrap();
        g.add_dependency(&"a", &"d").unwrap();
        g.add_dependency(&"a", &"b").unwrap();

        assert_eq!(g.dependencies_of(&"a", false).unwrap(), vec!["c", "b", "d"]);
        assert_eq!(g.dependencies_of(&"a", true).unwrap(), vec!["c", "d"]);
        assert_eq!(g.dependants_of(&"c", false).unwrap(), vec!["a", "b"]);
        assert!(g.dependencies_of(&"c", false).unwrap().is_empty());
    }

    #[test]
    fn test_overall_order_respects_every_edge() {
        let mut g = graph(&["post", "comment", "user", "tag", "org"]);
        let edges = [
            ("comment", "post"),
            ("comment", "user"),
            ("post", "user"),
            ("user", "org"),
        ];
        for (from, to) in edges {
            g.add_dependency(&from, &to).unwrap();
        }

        let order = g.overall_order(false).unwrap();
        assert_eq!(order.len(), 5);
        for (from, to) in edges {
            assert!(position(&order, to) < position(&order, from), "{from} -> {to}");
        }
        assert_eq!(order, vec!["org", "user", "post", "comment", "tag"]);

        let leaves = g.overall_order(true).unwrap();
        assert_eq!(leaves, vec!["org", "tag"]);
    }

    #[test]
    fn test_overall_order_is_deterministic() {
        let build = || {
            let mut g = graph(&["a", "b", "c", "d"]);
            g.add_dependency(&"d", &"b").unwrap();
            g.add_dependency(&"d", &"a").unwrap();
            g.add_dependency(&"c", &"a").unwrap();
            g.overall_order(false).unwrap()
        };
        assert_eq!(build(), build());
        assert_eq!(build(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let mut g = graph(&["x", "a", "b", "c"]);
        g.add_dependency(&"x", &"a").unwrap();
        g.add_dependency(&"a", &"b").unwrap();
        g.add_dependency(&"b", &"c").unwrap();
        g.add_dependency(&"c", &"a").unwrap();

        assert_eq!(
            g.overall_order(false),
            Err(GraphError::Cycle(vec!["a", "b", "c", "a"]))
        );
        assert!(matches!(
            g.dependencies_of(&"x", false),
            Err(GraphError::Cycle(_))
        ));
    }

    #[test]
    fn test_cycle_without_roots_still_fails() {
        let mut g = graph(&["a", "b"]);
        g.add_dependency(&"a", &"b").unwrap();
        g.add_dependency(&"b", &"a").unwrap();
        assert!(matches!(g.overall_order(true), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut g = graph(&["a", "b", "c"]);
        g.add_dependency(&"a", &"b").unwrap();
        g.add_dependency(&"b", &"c").unwrap();
        g.remove_node(&"b");
        g.remove_node(&"missing");

        assert!(!g.has_node(&"b"));
        assert!(g.dependencies_of(&"a", false).unwrap().is_empty());
        assert_eq!(g.overall_order(false).unwrap(), vec!["a", "c"]);

        g.remove_dependency(&"a", &"c");
        g.add_dependency(&"a", &"c").unwrap();
        g.remove_dependency(&"a", &"c");
        assert_eq!(g.overall_order(false).unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn test_long_chain_orders_without_recursion() {
        const LEN: usize = 100_000;
        let mut g: DependencyGraph<usize> = DependencyGraph::new();
        for i in 0..LEN {
            g.add_node(i, ());
        }
        for i in 0..LEN - 1 {
            g.add_dependency(&i, &(i + 1)).unwrap();
        }

        let order = g.overall_order(false).unwrap();
        assert_eq!(order.len(), LEN);
        assert_eq!(order[0], LEN - 1);
        assert_eq!(order[LEN - 1], 0);
        assert_eq!(g.overall_order(true).unwrap(), vec![LEN - 1]);
        assert_eq!(g.dependencies_of(&0, false).unwrap().len(), LEN - 1);

        g.add_dependency(&(LEN - 1), &0).unwrap();
        let Err(GraphError::Cycle(path)) = g.overall_order(false) else {
            panic!("expected a cycle");
        };
        assert_eq!(path.len(), LEN + 1);
        assert_eq!(path.first(), path.last());
    }

    #[test]
    fn test_empty_graph() {
        let g: DependencyGraph<u32> = DependencyGraph::new();
        assert!(g.is_empty());
        assert!(g.overall_order(false).unwrap().is_empty());
    }
}
