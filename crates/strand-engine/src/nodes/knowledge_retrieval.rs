use std::cmp::Ordering;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::traits::RetrievedChunk;
use strand_core::variables::{Segment, Selector};

use super::{from_future, NodeError, NodeResult, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

#[derive(Debug, Clone, Deserialize)]
struct RetrievalConfig {
    query_variable_selector: Selector,
    dataset_ids: Vec<String>,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    4
}

/// Queries knowledge bases and returns ranked chunks under `result`.
pub struct KnowledgeRetrievalNode {
    config: RetrievalConfig,
}

impl KnowledgeRetrievalNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let config: RetrievalConfig = desc.parse_config()?;
        if config.dataset_ids.is_empty() {
            return Err(StrandError::NodeConfig {
                node_id: desc.id.clone(),
                message: "no datasets selected".into(),
            });
        }
        Ok(Self { config })
    }

    async fn retrieve(self: Arc<Self>, ctx: NodeRunContext) -> NodeResult {
        let query = match ctx.pool.get(&self.config.query_variable_selector) {
            Some(Segment::String(q)) => q,
            _ => {
                return Err(NodeError::recoverable(
                    "KnowledgeRetrievalError",
                    "query variable is not string type",
                ))
            }
        };
        let mut inputs = Map::new();
        inputs.insert("query".into(), Value::String(query.clone()));
        if query.trim().is_empty() {
            return Err(NodeError::recoverable("KnowledgeRetrievalError", "query is required"));
        }

        let retriever = ctx.exec.services.retriever()?.clone();
        let chunks = tokio::select! {
            r = retriever.retrieve(&self.config.dataset_ids, &query, self.config.top_k) => r?,
            _ = ctx.exec.cancel.cancelled() => return Err(StrandError::Cancelled.into()),
        };
        debug!(node_id = %ctx.node_id, hits = chunks.len(), "Retrieved chunks");

        let mut result = NodeRunResult::default().output("result", rank(chunks));
        result.inputs = inputs;
        Ok(result)
    }
}

/// Sort by descending score (missing scores last) and number the positions from 1.
fn rank(mut chunks: Vec<RetrievedChunk>) -> Segment {
    chunks.sort_by(|a, b| {
        b.score
            .unwrap_or(0.0)
            .partial_cmp(&a.score.unwrap_or(0.0))
            .unwrap_or(Ordering::Equal)
    });
    let items: Vec<Map<String, Value>> = chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let mut metadata = c.metadata;
            metadata.insert("score".into(), json!(c.score));
            metadata.insert("position".into(), json!(i + 1));
            let mut item = Map::new();
            item.insert("content".into(), Value::String(c.content));
            item.insert("title".into(), json!(c.title));
            item.insert("metadata".into(), Value::Object(metadata));
            item
        })
        .collect();
    Segment::ArrayObject(items)
}

impl NodeStrategy for KnowledgeRetrievalNode {
    fn node_type(&self) -> NodeType {
        NodeType::KnowledgeRetrieval
    }

    fn reads(&self) -> Vec<Selector> {
        vec![self.config.query_variable_selector.clone()]
    }

    fn writes(&self) -> Vec<String> {
        vec!["result".into()]
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        from_future(self.retrieve(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use strand_core::context::Services;
    use strand_core::variables::VariablePool;
    use strand_test_utils::services::FakeRetriever;

    fn node() -> Arc<KnowledgeRetrievalNode> {
        let desc = NodeDescription::new(
            "kr",
            "knowledge-retrieval",
            json!({"query_variable_selector": ["sys", "query"], "dataset_ids": ["d1"], "top_k": 2}),
        );
        Arc::new(KnowledgeRetrievalNode::new(&desc).unwrap())
    }

    fn pool(query: &str) -> VariablePool {
        use strand_core::variables::SystemVariables;
        VariablePool::with_scopes(
            SystemVariables {
                query: Some(query.into()),
                ..Default::default()
            },
            Default::default(),
            Default::default(),
        )
    }

    #[tokio::test]
    async fn test_ranked_results() {
        let retriever = FakeRetriever::new(&["first", "second", "third"]);
        let services = Services::new().with_retriever(Arc::new(retriever));
        let (_, result) = collect(node().run(ctx("kr", pool("what?"), services))).await;
        let Segment::ArrayObject(items) = &result.unwrap().outputs["result"] else {
            panic!("expected array of objects");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["content"], json!("first"));
        assert_eq!(items[1]["metadata"]["position"], json!(2));
    }

    #[tokio::test]
    async fn test_empty_query_fails() {
        let services = Services::new().with_retriever(Arc::new(FakeRetriever::new(&["x"])));
        let (_, result) = collect(node().run(ctx("kr", pool("  "), services))).await;
        assert!(result.unwrap_err().message.contains("query is required"));
    }

    #[test]
    fn test_rank_orders_by_score() {
        let chunk = |content: &str, score: Option<f64>| RetrievedChunk {
            content: content.into(),
            title: None,
            score,
            metadata: Map::new(),
        };
        let Segment::ArrayObject(items) =
            rank(vec![chunk("low", Some(0.1)), chunk("none", None), chunk("high", Some(0.9))])
        else {
            panic!("expected array of objects");
        };
        let order: Vec<&Value> = items.iter().map(|i| &i["content"]).collect();
        assert_eq!(order, vec![&json!("high"), &json!("low"), &json!("none")]);
    }
}
