//! Dependency graph for beads
//!
//! Holds the `blocks` edges among a candidate set of beads, rejects cycles,
//! and produces a deterministic topological order for the planner.
//! Uses petgraph for graph operations.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

use super::bead::Bead;

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Adding dependency would create a cycle: {0} -> {1}")]
    CycleDetected(String, String),

    #[error("Bead not found in graph: {0}")]
    BeadNotFound(String),

    #[error("Self-dependency not allowed: {0}")]
    SelfDependency(String),

    #[error("Dependency cycle among beads: {}", .0.join(", "))]
    Cyclic(Vec<String>),
}

/// A dependency graph for beads
#[derive(Debug, Default)]
pub struct BeadGraph {
    /// Edge direction is dependency -> dependent
    graph: DiGraph<String, ()>,

    node_map: HashMap<String, NodeIndex>,
}

impl BeadGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            node_map: HashMap::new(),
        }
    }

    /// Builds a graph from a candidate set of beads.
    ///
    /// Only `blocks` edges between two candidates are kept; a dependency on a
    /// bead outside the set does not constrain ordering inside it.
    pub fn from_beads<'a>(beads: impl IntoIterator<Item = &'a Bead>) -> Result<Self, GraphError> {
        let mut graph = Self::new();

        let beads: Vec<_> = beads.into_iter().collect();
        for bead in &beads {
            graph.add_bead(&bead.id);
        }

        for bead in &beads {
            for dep_id in bead.blocking_ids() {
                if graph.contains(dep_id) && dep_id != bead.id {
                    graph.add_dependency(&bead.id, dep_id)?;
                }
            }
        }

        Ok(graph)
    }

    /// Adds a bead to the graph
    pub fn add_bead(&mut self, bead_id: &str) {
        if !self.node_map.contains_key(bead_id) {
            let idx = self.graph.add_node(bead_id.to_string());
            self.node_map.insert(bead_id.to_string(), idx);
        }
    }

    /// Adds an edge: `bead` depends on `depends_on`
    pub fn add_dependency(&mut self, bead: &str, depends_on: &str) -> Result<(), GraphError> {
        if bead == depends_on {
            return Err(GraphError::SelfDependency(bead.to_string()));
        }

        let bead_idx = *self
            .node_map
            .get(bead)
            .ok_or_else(|| GraphError::BeadNotFound(bead.to_string()))?;
        let dep_idx = *self
            .node_map
            .get(depends_on)
            .ok_or_else(|| GraphError::BeadNotFound(depends_on.to_string()))?;

        if self.graph.find_edge(dep_idx, bead_idx).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(dep_idx, bead_idx, ());

        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(GraphError::CycleDetected(
                bead.to_string(),
                depends_on.to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the direct dependencies of a bead that are inside the graph
    pub fn dependencies(&self, bead_id: &str) -> Vec<String> {
        self.neighbors(bead_id, petgraph::Direction::Incoming)
    }

    /// Returns the beads inside the graph that directly depend on `bead_id`
    pub fn dependents(&self, bead_id: &str) -> Vec<String> {
        self.neighbors(bead_id, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, bead_id: &str, direction: petgraph::Direction) -> Vec<String> {
        let Some(idx) = self.node_map.get(bead_id) else {
            return vec![];
        };

        self.graph
            .neighbors_directed(*idx, direction)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    /// Returns all beads in topological order (dependencies before dependents).
    ///
    /// Ties are broken by insertion order, so the same input always yields
    /// the same order.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let deg = self
                    .graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .count();
                (idx, deg)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(idx, _)| Reverse(*idx))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(self.graph[idx].clone());

            for next in self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Outgoing)
            {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse(next));
                    }
                }
            }
        }

        if order.len() != self.graph.node_count() {
            let mut stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(idx, _)| self.graph[idx].clone())
                .collect();
            stuck.sort();
            return Err(GraphError::Cyclic(stuck));
        }

        Ok(order)
    }

    pub fn contains(&self, bead_id: &str) -> bool {
        self.node_map.contains_key(bead_id)
    }

    pub fn len(&self) -> usize {
        self.node_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bead::BeadDependency;

    fn bead(id: &str, blocks_on: &[&str]) -> Bead {
        let mut b = Bead::new(id, id);
        for dep in blocks_on {
            b = b.with_dependency(BeadDependency::blocks(*dep));
        }
        b
    }

    #[test]
    fn empty_graph() {
        let graph = BeadGraph::new();
        assert!(graph.is_empty());
        assert_eq!(graph.topological_order().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn order_respects_blocks_edges() {
        // c depends on b, b depends on a
        let beads = [bead("c", &["b"]), bead("b", &["a"]), bead("a", &[])];
        let graph = BeadGraph::from_beads(&beads).unwrap();

        assert_eq!(graph.topological_order().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn independent_beads_keep_input_order() {
        let beads = [bead("x", &[]), bead("a", &[]), bead("m", &[])];
        let graph = BeadGraph::from_beads(&beads).unwrap();

        assert_eq!(graph.topological_order().unwrap(), vec!["x", "a", "m"]);
    }

    #[test]
    fn edges_to_outside_beads_are_ignored() {
        let beads = [bead("a", &["not-in-set"]), bead("b", &[])];
        let graph = BeadGraph::from_beads(&beads).unwrap();

        assert!(graph.dependencies("a").is_empty());
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn parent_child_edges_do_not_order() {
        let child = Bead::new("c", "c").with_dependency(BeadDependency::parent("p"));
        let beads = [child, bead("p", &[])];
        let graph = BeadGraph::from_beads(&beads).unwrap();

        assert_eq!(graph.topological_order().unwrap(), vec!["c", "p"]);
    }

    #[test]
    fn cycle_detection() {
        let beads = [bead("a", &["b"]), bead("b", &["a"])];
        let result = BeadGraph::from_beads(&beads);

        assert!(matches!(result, Err(GraphError::CycleDetected(_, _))));
    }

    #[test]
    fn self_dependency_rejected() {
        let mut graph = BeadGraph::new();
        graph.add_bead("a");

        assert!(matches!(
            graph.add_dependency("a", "a"),
            Err(GraphError::SelfDependency(_))
        ));
    }

    #[test]
    fn unknown_bead_returns_error() {
        let mut graph = BeadGraph::new();
        graph.add_bead("a");

        assert!(matches!(
            graph.add_dependency("a", "zzz"),
            Err(GraphError::BeadNotFound(_))
        ));
    }

    #[test]
    fn dependents_are_reported() {
        let beads = [bead("a", &[]), bead("b", &["a"]), bead("c", &["a"])];
        let graph = BeadGraph::from_beads(&beads).unwrap();

        let mut dependents = graph.dependents("a");
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c"]);
    }
}
