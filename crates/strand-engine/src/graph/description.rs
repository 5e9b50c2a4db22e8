use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_core::error::{Result, StrandError};

use super::edge::DEFAULT_HANDLE;

/// How a node recovers from a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    /// Take the `fail-branch` edges instead of the normal ones.
    FailBranch,
    /// Write `default_value` outputs and continue normally.
    DefaultValue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_interval_ms: u64,
}

/// Declarative node as supplied by the workflow-definition store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Strategy version. Absent picks the newest registered version.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Iteration/loop node this node lives inside.
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub error_strategy: Option<ErrorStrategy>,
    #[serde(default)]
    pub default_value: BTreeMap<String, Value>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl NodeDescription {
    pub fn new(id: &str, node_type: &str, config: Value) -> Self {
        Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            version: None,
            title: None,
            container_id: None,
            config,
            error_strategy: None,
            default_value: BTreeMap::new(),
            retry: None,
        }
    }

    /// Deserialize this node's config blob into a strategy config.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T> {
        let config = if self.config.is_null() {
            Value::Object(Default::default())
        } else {
            self.config.clone()
        };
        serde_json::from_value(config).map_err(|e| StrandError::NodeConfig {
            node_id: self.id.clone(),
            message: e.to_string(),
        })
    }

    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDescription {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default = "default_handle", alias = "sourceHandle")]
    pub source_handle: String,
}

fn default_handle() -> String {
    DEFAULT_HANDLE.to_string()
}

/// A whole workflow: nodes plus edges, containers flattened via `container_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    pub nodes: Vec<NodeDescription>,
    #[serde(default)]
    pub edges: Vec<EdgeDescription>,
}

impl GraphDescription {
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_value(v: Value) -> Result<Self> {
        Ok(serde_json::from_value(v)?)
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescription> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let desc = GraphDescription::from_value(json!({
            "nodes": [{"id": "start", "type": "start"}],
            "edges": [{"source": "start", "target": "end"}]
        }))
        .unwrap();
        assert_eq!(desc.edges[0].source_handle, "source");
        assert!(desc.nodes[0].version.is_none());
        assert!(desc.nodes[0].retry.is_none());
        assert_eq!(desc.nodes[0].title(), "start");
    }

    #[test]
    fn test_source_handle_alias() {
        let edge: EdgeDescription = serde_json::from_value(json!({
            "source": "if", "target": "a", "sourceHandle": "true"
        }))
        .unwrap();
        assert_eq!(edge.source_handle, "true");
    }

    #[test]
    fn test_parse_config_error_names_node() {
        #[derive(Debug, Deserialize)]
        struct Cfg {
            #[allow(dead_code)]
            required: String,
        }
        let node = NodeDescription::new("n1", "code", json!({}));
        let err = node.parse_config::<Cfg>().unwrap_err();
        assert!(err.to_string().contains("n1"));
    }

    #[test]
    fn test_error_strategy_wire_names() {
        let node: NodeDescription = serde_json::from_value(json!({
            "id": "h", "type": "http-request",
            "error_strategy": "fail-branch",
            "retry": {"max_retries": 2, "retry_interval_ms": 10}
        }))
        .unwrap();
        assert_eq!(node.error_strategy, Some(ErrorStrategy::FailBranch));
        assert_eq!(node.retry.map(|r| r.max_retries), Some(2));
    }
}
