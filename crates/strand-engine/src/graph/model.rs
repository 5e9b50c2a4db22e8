use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use strand_core::error::{Result, StrandError};
use strand_core::variables::RESERVED_SCOPES;

use super::description::{ErrorStrategy, GraphDescription, NodeDescription};
use super::edge::{Edge, FAIL_BRANCH_HANDLE};
use super::node::{GraphNode, NodeType};
use crate::nodes::StrategyRegistry;

/// Immutable, validated workflow graph.
///
/// Built once per execution. Container nodes own their child graph through
/// their strategy; this graph only holds one scope.
#[derive(Debug)]
pub struct Graph {
    root_id: String,
    nodes: Vec<GraphNode>,
    node_index: HashMap<String, usize>,
    edges: Vec<Edge>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
}

impl Graph {
    /// Validate a description and resolve every node's strategy.
    pub fn build(desc: &GraphDescription, registry: &StrategyRegistry) -> Result<Arc<Self>> {
        let mut seen = HashSet::new();
        for node in &desc.nodes {
            if node.id.is_empty() {
                return Err(StrandError::InvalidGraph("node with empty id".into()));
            }
            if RESERVED_SCOPES.contains(&node.id.as_str()) {
                return Err(StrandError::InvalidGraph(format!(
                    "node id '{}' is reserved",
                    node.id
                )));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(StrandError::InvalidGraph(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }
        for node in &desc.nodes {
            if let Some(container) = &node.container_id {
                let parent = desc.node(container).ok_or_else(|| {
                    StrandError::InvalidGraph(format!(
                        "node '{}' references unknown container '{}'",
                        node.id, container
                    ))
                })?;
                let parent_type: NodeType = parent.node_type.parse()?;
                if !parent_type.is_container() {
                    return Err(StrandError::InvalidGraph(format!(
                        "node '{}' is nested in '{}', which is not a container",
                        node.id, container
                    )));
                }
            }
        }
        for edge in &desc.edges {
            for end in [&edge.source, &edge.target] {
                if !seen.contains(end.as_str()) {
                    return Err(StrandError::InvalidGraph(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
        }

        let graph = Self::build_scope(desc, None, registry)?;
        graph.check_reads();
        Ok(Arc::new(graph))
    }

    fn build_scope(
        desc: &GraphDescription,
        container: Option<&NodeDescription>,
        registry: &StrategyRegistry,
    ) -> Result<Self> {
        let scope = container.map(|c| c.id.as_str());
        let members: Vec<&NodeDescription> = desc
            .nodes
            .iter()
            .filter(|n| n.container_id.as_deref() == scope)
            .collect();
        let member_ids: HashSet<&str> = members.iter().map(|n| n.id.as_str()).collect();

        let mut edges = Vec::new();
        for e in &desc.edges {
            let source_in = member_ids.contains(e.source.as_str());
            let target_in = member_ids.contains(e.target.as_str());
            match (source_in, target_in) {
                (true, true) => {
                    let mut edge = Edge::new(&e.source, &e.target, &e.source_handle);
                    if let Some(id) = &e.id {
                        edge.id = id.clone();
                    }
                    edges.push(edge);
                }
                (false, false) => {}
                _ => {
                    return Err(StrandError::InvalidGraph(format!(
                        "edge {} -> {} crosses a container boundary",
                        e.source, e.target
                    )))
                }
            }
        }

        let root_id = match container {
            None => {
                let starts: Vec<&str> = members
                    .iter()
                    .filter(|n| n.node_type == NodeType::Start.as_str())
                    .map(|n| n.id.as_str())
                    .collect();
                match starts.as_slice() {
                    [one] => one.to_string(),
                    [] => return Err(StrandError::InvalidGraph("graph has no start node".into())),
                    _ => {
                        return Err(StrandError::InvalidGraph(format!(
                            "graph has {} start nodes",
                            starts.len()
                        )))
                    }
                }
            }
            Some(c) => {
                let declared = c
                    .config
                    .get("start_node_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let first_free = members
                    .iter()
                    .find(|n| !edges.iter().any(|e| e.target == n.id))
                    .map(|n| n.id.clone());
                declared.or(first_free).ok_or_else(|| {
                    StrandError::InvalidGraph(format!("container '{}' has no child nodes", c.id))
                })?
            }
        };

        let mut nodes = Vec::with_capacity(members.len());
        for d in members {
            let node_type: NodeType = d.node_type.parse()?;
            let child = if node_type.is_container() {
                Some(Arc::new(Self::build_scope(desc, Some(d), registry)?))
            } else {
                None
            };
            let strategy = registry.create(node_type, d, child)?;
            nodes.push(GraphNode::new(d, node_type, strategy));
        }

        Self::from_parts(root_id, nodes, edges)
    }

    /// Assemble and validate one scope from already-resolved nodes.
    pub(crate) fn from_parts(root_id: String, nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Result<Self> {
        let node_index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        if !node_index.contains_key(&root_id) {
            return Err(StrandError::InvalidGraph(format!(
                "root node '{root_id}' is not part of the graph"
            )));
        }

        let mut edge_ids = HashSet::new();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(StrandError::InvalidGraph(format!(
                    "duplicate edge '{}'",
                    edge.id
                )));
            }
            outgoing.entry(edge.source.clone()).or_default().push(i);
            incoming.entry(edge.target.clone()).or_default().push(i);
        }

        let graph = Self {
            root_id,
            nodes,
            node_index,
            edges,
            outgoing,
            incoming,
        };
        graph.check_acyclic()?;
        graph.check_reachable()?;
        debug!(
            root = %graph.root_id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "Graph built"
        );
        Ok(graph)
    }

    /// Kahn's algorithm over the whole scope.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), self.incoming_edges(&n.id).len()))
            .collect();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for edge in self.outgoing_edges(id) {
                if let Some(d) = in_degree.get_mut(edge.target.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(edge.target.as_str());
                    }
                }
            }
        }
        if visited != self.nodes.len() {
            return Err(StrandError::InvalidGraph(
                "cycle detected outside a loop or iteration container".into(),
            ));
        }
        Ok(())
    }

    fn check_reachable(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::from([self.root_id.as_str()]);
        let mut stack = vec![self.root_id.as_str()];
        while let Some(id) = stack.pop() {
            for edge in self.outgoing_edges(id) {
                if seen.insert(edge.target.as_str()) {
                    stack.push(edge.target.as_str());
                }
            }
        }
        if let Some(orphan) = self.nodes.iter().find(|n| !seen.contains(n.id.as_str())) {
            return Err(StrandError::InvalidGraph(format!(
                "node '{}' is not reachable from '{}'",
                orphan.id, self.root_id
            )));
        }
        Ok(())
    }

    /// Warn about reads of sibling nodes that can never have run first.
    fn check_reads(&self) {
        for node in &self.nodes {
            let upstream = self.ancestors(&node.id);
            for sel in node.strategy.reads() {
                let owner = sel.node_id.as_str();
                if sel.is_reserved() || owner == node.id || !self.node_index.contains_key(owner) {
                    continue;
                }
                if !upstream.contains(owner) {
                    warn!(
                        node_id = %node.id,
                        selector = %sel,
                        "Node reads a variable from a node that is not upstream"
                    );
                }
            }
        }
    }

    /// Every node with a path to `node_id`.
    pub fn ancestors(&self, node_id: &str) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let mut stack = vec![node_id];
        while let Some(id) = stack.pop() {
            for edge in self.incoming_edges(id) {
                if seen.insert(edge.source.as_str()) {
                    stack.push(edge.source.as_str());
                }
            }
        }
        seen
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.node_index.get(id).map(|i| &self.nodes[*i])
    }

    /// Find a node here or inside any container's child graph, together with
    /// its enclosing containers, outermost first.
    pub fn find_nested(&self, id: &str) -> Option<(Vec<&GraphNode>, &GraphNode)> {
        if let Some(node) = self.node(id) {
            return Some((Vec::new(), node));
        }
        self.nodes.iter().find_map(|container| {
            let (mut path, node) = container.strategy.child_graph()?.find_nested(id)?;
            path.insert(0, container);
            Some((path, node))
        })
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edges in declaration order.
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(node_id)
            .map(|ids| ids.iter().map(|i| &self.edges[*i]).collect())
            .unwrap_or_default()
    }

    pub fn incoming_edges(&self, node_id: &str) -> Vec<&Edge> {
        self.incoming
            .get(node_id)
            .map(|ids| ids.iter().map(|i| &self.edges[*i]).collect())
            .unwrap_or_default()
    }

    /// Declared strategy, or fail-branch when the node has a fail-branch edge.
    pub fn error_strategy(&self, node_id: &str) -> Option<ErrorStrategy> {
        let declared = self.node(node_id).and_then(|n| n.error_strategy);
        declared.or_else(|| {
            self.outgoing_edges(node_id)
                .iter()
                .any(|e| e.source_handle == FAIL_BRANCH_HANDLE)
                .then_some(ErrorStrategy::FailBranch)
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_test_utils::fixtures::*;

    fn build(v: serde_json::Value) -> Result<Arc<Graph>> {
        let desc = GraphDescription::from_value(v)?;
        Graph::build(&desc, &StrategyRegistry::default())
    }

    fn linear() -> serde_json::Value {
        workflow(
            vec![
                start_node(&["q"]),
                llm_node("llm", "{{#start.q#}}"),
                end_node("end", &[("answer", &["llm", "text"])]),
            ],
            vec![edge("start", "llm"), edge("llm", "end")],
        )
    }

    #[test]
    fn test_build_linear() {
        let graph = build(linear()).unwrap();
        assert_eq!(graph.root_id(), "start");
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.outgoing_edges("start")[0].target, "llm");
        assert_eq!(graph.incoming_edges("end")[0].source, "llm");
        assert_eq!(graph.node("llm").map(|n| n.node_type), Some(NodeType::Llm));
    }

    #[test]
    fn test_rejects_cycle() {
        let err = build(workflow(
            vec![
                start_node(&[]),
                llm_node("a", "x"),
                llm_node("b", "y"),
            ],
            vec![edge("start", "a"), edge("a", "b"), edge("b", "a")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_unreachable() {
        let err = build(workflow(
            vec![start_node(&[]), llm_node("orphan", "x")],
            vec![],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("orphan"));
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_ids() {
        let err = build(workflow(
            vec![start_node(&[]), llm_node("sys", "x")],
            vec![edge("start", "sys")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("reserved"));

        let err = build(workflow(
            vec![start_node(&[]), llm_node("a", "x"), llm_node("a", "y")],
            vec![edge("start", "a")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_missing_or_double_start() {
        assert!(build(workflow(vec![llm_node("a", "x")], vec![])).is_err());
        let mut second = start_node(&[]);
        second["id"] = json!("start2");
        assert!(build(workflow(vec![start_node(&[]), second], vec![])).is_err());
    }

    #[test]
    fn test_rejects_unknown_edge_endpoint() {
        let err = build(workflow(vec![start_node(&[])], vec![edge("start", "ghost")])).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_unknown_type_is_unsupported() {
        let err = build(workflow(
            vec![start_node(&[]), node("x", "answer", json!({}))],
            vec![edge("start", "x")],
        ))
        .unwrap_err();
        assert!(matches!(err, StrandError::UnsupportedNodeType { .. }));
    }

    #[test]
    fn test_fail_branch_edge_implies_strategy() {
        let graph = build(workflow(
            vec![
                start_node(&[]),
                llm_node("llm", "x"),
                end_node("ok", &[]),
                end_node("bad", &[]),
            ],
            vec![
                edge("start", "llm"),
                edge("llm", "ok"),
                branch_edge("llm", "bad", "fail-branch"),
            ],
        ))
        .unwrap();
        assert_eq!(graph.error_strategy("llm"), Some(ErrorStrategy::FailBranch));
        assert_eq!(graph.error_strategy("ok"), None);
    }

    #[test]
    fn test_container_children_split_out() {
        let mut child = llm_node("inner", "{{#iter.item#}}");
        child["container_id"] = json!("iter");
        let graph = build(workflow(
            vec![
                start_node(&[]),
                node(
                    "iter",
                    "iteration",
                    json!({
                        "iterator_selector": ["start", "items"],
                        "output_selector": ["inner", "text"],
                        "start_node_id": "inner"
                    }),
                ),
                child,
                end_node("end", &[("out", &["iter", "output"])]),
            ],
            vec![edge("start", "iter"), edge("iter", "end")],
        ))
        .unwrap();
        assert_eq!(graph.len(), 3);
        assert!(graph.node("inner").is_none());
    }

    #[test]
    fn test_find_nested_reports_enclosing_container() {
        let mut child = llm_node("inner", "{{#iter.item#}}");
        child["container_id"] = json!("iter");
        let graph = build(workflow(
            vec![
                start_node(&[]),
                node(
                    "iter",
                    "iteration",
                    json!({
                        "iterator_selector": ["start", "items"],
                        "output_selector": ["inner", "text"],
                        "start_node_id": "inner"
                    }),
                ),
                child,
            ],
            vec![edge("start", "iter")],
        ))
        .unwrap();

        let (path, node) = graph.find_nested("inner").unwrap();
        assert_eq!(node.id, "inner");
        assert_eq!(path.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["iter"]);
        let (path, _) = graph.find_nested("iter").unwrap();
        assert!(path.is_empty());
        assert!(graph.find_nested("ghost").is_none());
    }

    #[test]
    fn test_dashed_ids_keep_edges_apart() {
        let graph = build(workflow(
            vec![
                start_node(&[]),
                code_node("a", &[], &[]),
                code_node("a-b", &[], &[]),
                code_node("c", &[], &[]),
            ],
            vec![
                edge("start", "a"),
                edge("start", "a-b"),
                branch_edge("a-b", "c", "x"),
                branch_edge("a", "c", "b-x"),
            ],
        ))
        .unwrap();
        assert_eq!(graph.edges().len(), 4);
    }

    #[test]
    fn test_edge_crossing_container_rejected() {
        let mut child = llm_node("inner", "x");
        child["container_id"] = json!("iter");
        let err = build(workflow(
            vec![
                start_node(&[]),
                node(
                    "iter",
                    "iteration",
                    json!({"iterator_selector": ["start", "items"], "output_selector": ["inner", "text"]}),
                ),
                child,
            ],
            vec![edge("start", "iter"), edge("start", "inner")],
        ))
        .unwrap_err();
        assert!(err.to_string().contains("container boundary"));
    }

    #[test]
    fn test_ancestors() {
        let graph = build(linear()).unwrap();
        let up = graph.ancestors("end");
        assert!(up.contains("start") && up.contains("llm"));
        assert!(graph.ancestors("start").is_empty());
    }
}
