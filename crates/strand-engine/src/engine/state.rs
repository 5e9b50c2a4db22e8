use std::collections::{BTreeMap, VecDeque};

use strand_core::snapshot::TraversalState;

use crate::graph::{Edge, Graph};

/// Traversal marks for every edge and node of one scope.
///
/// A node becomes ready once none of its inbound edges is `Unknown` and at
/// least one is `Taken`. When all inbound edges end up `Skipped` the node is
/// skipped too and its own outgoing edges are skipped in turn.
#[derive(Debug, Clone, Default)]
pub(crate) struct Traversal {
    edges: BTreeMap<String, TraversalState>,
    nodes: BTreeMap<String, TraversalState>,
}

impl Traversal {
    pub fn new(graph: &Graph) -> Self {
        Self {
            edges: graph
                .edges()
                .iter()
                .map(|e| (e.id.clone(), TraversalState::Unknown))
                .collect(),
            nodes: graph
                .nodes()
                .iter()
                .map(|n| (n.id.clone(), TraversalState::Unknown))
                .collect(),
        }
    }

    pub fn from_parts(
        edges: BTreeMap<String, TraversalState>,
        nodes: BTreeMap<String, TraversalState>,
    ) -> Self {
        Self { edges, nodes }
    }

    pub fn edges(&self) -> &BTreeMap<String, TraversalState> {
        &self.edges
    }

    pub fn nodes(&self) -> &BTreeMap<String, TraversalState> {
        &self.nodes
    }

    pub fn node_state(&self, node_id: &str) -> TraversalState {
        self.nodes.get(node_id).copied().unwrap_or_default()
    }

    pub fn mark_taken(&mut self, node_id: &str) {
        self.nodes.insert(node_id.to_string(), TraversalState::Taken);
    }

    /// Resolve the outgoing edges of a finished node.
    ///
    /// Edges accepted by `take` are marked taken, the rest skipped. Returns
    /// the nodes that became ready, in edge declaration order.
    pub fn advance<F>(&mut self, graph: &Graph, node_id: &str, take: F) -> Vec<String>
    where
        F: Fn(&Edge) -> bool,
    {
        let mut pending = VecDeque::new();
        for edge in graph.outgoing_edges(node_id) {
            let state = if take(edge) {
                TraversalState::Taken
            } else {
                TraversalState::Skipped
            };
            self.edges.insert(edge.id.clone(), state);
            pending.push_back(edge.target.clone());
        }

        let mut ready = Vec::new();
        while let Some(target) = pending.pop_front() {
            if self.node_state(&target) != TraversalState::Unknown {
                continue;
            }
            let inbound: Vec<TraversalState> = graph
                .incoming_edges(&target)
                .iter()
                .map(|e| self.edges.get(&e.id).copied().unwrap_or_default())
                .collect();
            if inbound.contains(&TraversalState::Unknown) {
                continue;
            }
            if inbound.contains(&TraversalState::Taken) {
                self.nodes.insert(target.clone(), TraversalState::Taken);
                ready.push(target);
                continue;
            }
            self.nodes.insert(target.clone(), TraversalState::Skipped);
            for edge in graph.outgoing_edges(&target) {
                self.edges.insert(edge.id.clone(), TraversalState::Skipped);
                pending.push_back(edge.target.clone());
            }
        }
        ready
    }
}
