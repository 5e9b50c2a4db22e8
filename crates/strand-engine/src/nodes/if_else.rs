use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::variables::Selector;

use super::condition::{self, Condition, LogicalOperator};
use super::{dedup_selectors, done, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

/// Handle taken when no case matches.
pub const ELSE_HANDLE: &str = "false";

#[derive(Debug, Clone, Deserialize)]
pub struct Case {
    pub case_id: String,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IfElseConfig {
    #[serde(default)]
    cases: Vec<Case>,
    // single-condition-group form
    #[serde(default)]
    logical_operator: LogicalOperator,
    #[serde(default)]
    conditions: Vec<Condition>,
}

/// Branch node. Selects the first case whose conditions hold.
pub struct IfElseNode {
    cases: Vec<Case>,
}

impl IfElseNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let config: IfElseConfig = desc.parse_config()?;
        let cases = if config.cases.is_empty() {
            if config.conditions.is_empty() {
                return Err(StrandError::NodeConfig {
                    node_id: desc.id.clone(),
                    message: "if-else node declares no cases".into(),
                });
            }
            vec![Case {
                case_id: "true".into(),
                logical_operator: config.logical_operator,
                conditions: config.conditions,
            }]
        } else {
            config.cases
        };
        Ok(Self { cases })
    }
}

impl NodeStrategy for IfElseNode {
    fn node_type(&self) -> NodeType {
        NodeType::IfElse
    }

    fn reads(&self) -> Vec<Selector> {
        dedup_selectors(
            self.cases
                .iter()
                .flat_map(|c| condition::selectors(&c.conditions)),
        )
    }

    fn writes(&self) -> Vec<String> {
        vec!["result".into(), "selected_case_id".into()]
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        let mut evaluated = Vec::new();
        let mut selected = None;
        for case in &self.cases {
            let matched = condition::evaluate_all(&ctx.pool, &case.conditions, case.logical_operator);
            evaluated.push(json!({"case_id": case.case_id, "result": matched}));
            if matched {
                selected = Some(case.case_id.clone());
                break;
            }
        }
        let handle = selected.clone().unwrap_or_else(|| ELSE_HANDLE.to_string());
        let mut result = NodeRunResult::default()
            .output("result", selected.is_some())
            .output("selected_case_id", handle.clone())
            .handle(handle);
        result
            .process_data
            .insert("condition_results".into(), evaluated.into());
        done(Ok(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use strand_core::variables::{Segment, VariablePool};

    fn pool(n: i64) -> VariablePool {
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["n"]), n).unwrap();
        pool
    }

    async fn handle_for(node: Arc<IfElseNode>, n: i64) -> String {
        let (_, result) = collect(node.run(ctx("if", pool(n), Default::default()))).await;
        result.unwrap().edge_source_handle.unwrap()
    }

    #[tokio::test]
    async fn test_legacy_form() {
        let desc = NodeDescription::new(
            "if",
            "if-else",
            json!({
                "logical_operator": "and",
                "conditions": [{"variable_selector": ["start", "n"], "comparison_operator": ">", "value": "3"}]
            }),
        );
        let node = Arc::new(IfElseNode::new(&desc).unwrap());
        assert_eq!(handle_for(node.clone(), 5).await, "true");
        assert_eq!(handle_for(node, 1).await, "false");
    }

    #[tokio::test]
    async fn test_first_matching_case_wins() {
        let desc = NodeDescription::new(
            "if",
            "if-else",
            json!({"cases": [
                {"case_id": "big", "conditions": [{"variable_selector": ["start", "n"], "comparison_operator": ">", "value": "10"}]},
                {"case_id": "pos", "conditions": [{"variable_selector": ["start", "n"], "comparison_operator": ">", "value": "0"}]},
                {"case_id": "also", "conditions": [{"variable_selector": ["start", "n"], "comparison_operator": "≥", "value": "0"}]}
            ]}),
        );
        let node = Arc::new(IfElseNode::new(&desc).unwrap());
        assert_eq!(handle_for(node.clone(), 50).await, "big");
        assert_eq!(handle_for(node.clone(), 5).await, "pos");
        assert_eq!(handle_for(node, -1).await, "false");
    }

    #[tokio::test]
    async fn test_outputs() {
        let desc = NodeDescription::new(
            "if",
            "if-else",
            json!({"conditions": [{"variable_selector": ["start", "n"], "comparison_operator": "=", "value": "1"}]}),
        );
        let node = Arc::new(IfElseNode::new(&desc).unwrap());
        let (_, result) = collect(node.run(ctx("if", pool(1), Default::default()))).await;
        let result = result.unwrap();
        assert_eq!(result.outputs["result"], Segment::Boolean(true));
        assert_eq!(result.outputs["selected_case_id"], Segment::from("true"));
    }

    #[test]
    fn test_requires_conditions() {
        let desc = NodeDescription::new("if", "if-else", json!({}));
        assert!(IfElseNode::new(&desc).is_err());
    }
}
