use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use strand_core::error::{Result, StrandError};

use super::NodeStrategy;
use crate::graph::{Graph, NodeDescription, NodeType};

/// Builds a strategy from its description. Containers also get their child graph.
pub type StrategyFactory = Arc<
    dyn Fn(&NodeDescription, Option<Arc<Graph>>) -> Result<Arc<dyn NodeStrategy>> + Send + Sync,
>;

/// Strategy factories keyed by `(type, version)`.
#[derive(Clone)]
pub struct StrategyRegistry {
    factories: HashMap<NodeType, BTreeMap<String, StrategyFactory>>,
}

impl StrategyRegistry {
    /// A registry with no strategies at all.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the factory for one `(type, version)`.
    pub fn register<F>(&mut self, node_type: NodeType, version: &str, factory: F)
    where
        F: Fn(&NodeDescription, Option<Arc<Graph>>) -> Result<Arc<dyn NodeStrategy>>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .entry(node_type)
            .or_default()
            .insert(version.to_string(), Arc::new(factory));
    }

    /// Registered versions for a type, newest last.
    pub fn versions(&self, node_type: NodeType) -> Vec<&str> {
        let mut versions: Vec<&str> = self
            .factories
            .get(&node_type)
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        versions.sort_by_key(|v| version_key(v));
        versions
    }

    /// Resolve and build the strategy for one node.
    ///
    /// A description without a version gets the newest registered one.
    pub fn create(
        &self,
        node_type: NodeType,
        desc: &NodeDescription,
        child: Option<Arc<Graph>>,
    ) -> Result<Arc<dyn NodeStrategy>> {
        let unsupported = || StrandError::UnsupportedNodeType {
            node_type: node_type.to_string(),
            version: desc.version.clone().unwrap_or_else(|| "*".into()),
        };
        let by_version = self.factories.get(&node_type).ok_or_else(unsupported)?;
        let factory = match &desc.version {
            Some(v) => by_version.get(v),
            None => by_version
                .iter()
                .max_by_key(|(v, _)| version_key(v))
                .map(|(_, f)| f),
        }
        .ok_or_else(unsupported)?;
        let strategy = factory(desc, child)?;
        debug!(
            node_id = %desc.id,
            node_type = %node_type,
            version = strategy.version(),
            "Resolved node strategy"
        );
        Ok(strategy)
    }
}

fn version_key(v: &str) -> (u32, String) {
    (v.parse().unwrap_or(0), v.to_string())
}

fn require_child(desc: &NodeDescription, child: Option<Arc<Graph>>) -> Result<Arc<Graph>> {
    child.ok_or_else(|| StrandError::NodeConfig {
        node_id: desc.id.clone(),
        message: "container has no child graph".into(),
    })
}

impl Default for StrategyRegistry {
    /// Registry holding every built-in strategy.
    fn default() -> Self {
        use super::*;

        let mut r = Self::empty();
        r.register(NodeType::Start, "1", |d, _| Ok(Arc::new(start::StartNode::new(d)?)));
        r.register(NodeType::End, "1", |d, _| Ok(Arc::new(end::EndNode::new(d)?)));
        r.register(NodeType::Llm, "1", |d, _| Ok(Arc::new(llm::LlmNode::new(d)?)));
        r.register(NodeType::IfElse, "1", |d, _| Ok(Arc::new(if_else::IfElseNode::new(d)?)));
        r.register(NodeType::QuestionClassifier, "1", |d, _| {
            Ok(Arc::new(question_classifier::QuestionClassifierNode::new(d)?))
        });
        r.register(NodeType::Iteration, "1", |d, child| {
            Ok(Arc::new(iteration::IterationNode::new(d, require_child(d, child)?)?))
        });
        r.register(NodeType::Loop, "1", |d, child| {
            Ok(Arc::new(loop_node::LoopNode::new(d, require_child(d, child)?)?))
        });
        r.register(NodeType::Tool, "1", |d, _| Ok(Arc::new(tool::ToolNode::new(d)?)));
        r.register(NodeType::Agent, "2", |d, _| Ok(Arc::new(agent::AgentNode::new(d)?)));
        r.register(NodeType::Code, "1", |d, _| Ok(Arc::new(code::CodeNode::new(d)?)));
        r.register(NodeType::HttpRequest, "1", |d, _| {
            Ok(Arc::new(http_request::HttpRequestNode::new(d)?))
        });
        r.register(NodeType::KnowledgeRetrieval, "1", |d, _| {
            Ok(Arc::new(knowledge_retrieval::KnowledgeRetrievalNode::new(d)?))
        });
        r.register(NodeType::ParameterExtractor, "1", |d, _| {
            Ok(Arc::new(parameter_extractor::ParameterExtractorNode::new(d)?))
        });
        r.register(NodeType::VariableAggregator, "1", |d, _| {
            Ok(Arc::new(variable_aggregator::VariableAggregatorNode::new(d)?))
        });
        r.register(NodeType::Assigner, "1", |d, _| {
            Ok(Arc::new(assigner::AssignerNode::new(d)?))
        });
        r
    }
}
