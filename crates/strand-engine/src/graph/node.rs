use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strand_core::error::{Result, StrandError};
use strand_core::variables::Segment;

use super::description::{ErrorStrategy, NodeDescription, RetryConfig};
use crate::nodes::NodeStrategy;

/// Closed set of node kinds the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Start,
    End,
    Llm,
    IfElse,
    QuestionClassifier,
    Iteration,
    Loop,
    Tool,
    Agent,
    Code,
    HttpRequest,
    KnowledgeRetrieval,
    ParameterExtractor,
    VariableAggregator,
    Assigner,
}

impl NodeType {
    pub const ALL: [NodeType; 15] = [
        Self::Start,
        Self::End,
        Self::Llm,
        Self::IfElse,
        Self::QuestionClassifier,
        Self::Iteration,
        Self::Loop,
        Self::Tool,
        Self::Agent,
        Self::Code,
        Self::HttpRequest,
        Self::KnowledgeRetrieval,
        Self::ParameterExtractor,
        Self::VariableAggregator,
        Self::Assigner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Llm => "llm",
            Self::IfElse => "if-else",
            Self::QuestionClassifier => "question-classifier",
            Self::Iteration => "iteration",
            Self::Loop => "loop",
            Self::Tool => "tool",
            Self::Agent => "agent",
            Self::Code => "code",
            Self::HttpRequest => "http-request",
            Self::KnowledgeRetrieval => "knowledge-retrieval",
            Self::ParameterExtractor => "parameter-extractor",
            Self::VariableAggregator => "variable-aggregator",
            Self::Assigner => "assigner",
        }
    }

    /// Nodes whose result selects a subset of outgoing edges.
    pub fn is_branch(&self) -> bool {
        matches!(self, Self::IfElse | Self::QuestionClassifier)
    }

    /// Nodes that run a nested sub-graph.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Iteration | Self::Loop)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "variable-assigner" | "assigner" => return Ok(Self::Assigner),
            "if_else" => return Ok(Self::IfElse),
            _ => {}
        }
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StrandError::UnsupportedNodeType {
                node_type: s.to_string(),
                version: "*".to_string(),
            })
    }
}

/// A validated node with its strategy already resolved.
#[derive(Clone)]
pub struct GraphNode {
    pub id: String,
    pub node_type: NodeType,
    pub title: String,
    pub container_id: Option<String>,
    pub error_strategy: Option<ErrorStrategy>,
    pub default_value: BTreeMap<String, Segment>,
    pub retry: RetryConfig,
    pub strategy: Arc<dyn NodeStrategy>,
}

impl GraphNode {
    pub fn new(desc: &NodeDescription, node_type: NodeType, strategy: Arc<dyn NodeStrategy>) -> Self {
        Self {
            id: desc.id.clone(),
            node_type,
            title: desc.title().to_string(),
            container_id: desc.container_id.clone(),
            error_strategy: desc.error_strategy,
            default_value: desc
                .default_value
                .iter()
                .map(|(k, v)| (k.clone(), Segment::from_value(v.clone())))
                .collect(),
            retry: desc.retry.unwrap_or_default(),
            strategy,
        }
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("version", &self.strategy.version())
            .field("error_strategy", &self.error_strategy)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_parse() {
        assert_eq!("if-else".parse::<NodeType>().unwrap(), NodeType::IfElse);
        assert_eq!(
            "variable-assigner".parse::<NodeType>().unwrap(),
            NodeType::Assigner
        );
        assert!(matches!(
            "answer".parse::<NodeType>(),
            Err(StrandError::UnsupportedNodeType { .. })
        ));
    }

    #[test]
    fn test_serde_matches_as_str() {
        for t in NodeType::ALL {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, serde_json::Value::String(t.as_str().into()));
        }
    }

    #[test]
    fn test_kinds() {
        assert!(NodeType::QuestionClassifier.is_branch());
        assert!(!NodeType::Llm.is_branch());
        assert!(NodeType::Loop.is_container());
    }
}
