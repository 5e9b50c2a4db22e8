use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::types::ChatMessage;
use strand_core::variables::{template, Selector};

use super::llm::{complete, extract_json_object, usage_value};
use super::{dedup_selectors, from_future, NodeResult, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassConfig {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClassifierConfig {
    model: ModelConfig,
    query_variable_selector: Selector,
    classes: Vec<ClassConfig>,
    #[serde(default)]
    instruction: String,
}

/// Branch node. Asks the model to pick a class; the class id is the handle.
pub struct QuestionClassifierNode {
    config: ClassifierConfig,
}

impl QuestionClassifierNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let config: ClassifierConfig = desc.parse_config()?;
        if config.classes.is_empty() {
            return Err(StrandError::NodeConfig {
                node_id: desc.id.clone(),
                message: "question classifier declares no classes".into(),
            });
        }
        Ok(Self { config })
    }

    fn system_prompt(&self, instruction: &str) -> String {
        let categories: Vec<Value> = self
            .config
            .classes
            .iter()
            .map(|c| json!({"category_id": c.id, "category_name": c.name}))
            .collect();
        format!(
            "You are a text classification engine. Classify the user input into exactly one \
             of the categories below and reply only with JSON of the form \
             {{\"category_id\": \"...\", \"category_name\": \"...\"}}.\n\
             Categories: {}\n{}",
            Value::Array(categories),
            instruction
        )
    }

    async fn classify(self: Arc<Self>, ctx: NodeRunContext) -> NodeResult {
        let query = ctx
            .pool
            .get(&self.config.query_variable_selector)
            .map(|s| s.text())
            .unwrap_or_default();
        let instruction = ctx.pool.convert_template(&self.config.instruction);
        let messages = vec![
            ChatMessage::system(self.system_prompt(&instruction)),
            ChatMessage::user(query.clone()),
        ];
        let (text, usage) = complete(&ctx, &self.config.model, messages).await?;
        let class = self.pick(&text);

        let mut result = NodeRunResult::default()
            .output("class_name", class.name.clone())
            .output("class_id", class.id.clone())
            .output("usage", usage_value(&usage))
            .handle(class.id.clone());
        result.inputs.insert("query".into(), Value::String(query));
        result
            .process_data
            .insert("model_output".into(), Value::String(text));
        result.usage = usage;
        Ok(result)
    }

    /// Match model output to a class, falling back to the first one.
    fn pick(&self, text: &str) -> &ClassConfig {
        let classes = &self.config.classes;
        if let Some(map) = extract_json_object(text) {
            let id = map.get("category_id").and_then(Value::as_str);
            let name = map.get("category_name").and_then(Value::as_str);
            if let Some(c) = classes
                .iter()
                .find(|c| Some(c.id.as_str()) == id)
                .or_else(|| classes.iter().find(|c| Some(c.name.as_str()) == name))
            {
                return c;
            }
        }
        let trimmed = text.trim();
        if let Some(c) = classes.iter().find(|c| c.name == trimmed || c.id == trimmed) {
            return c;
        }
        warn!(output = %trimmed, "Classifier output matched no class, using the first");
        &classes[0]
    }
}

impl NodeStrategy for QuestionClassifierNode {
    fn node_type(&self) -> NodeType {
        NodeType::QuestionClassifier
    }

    fn reads(&self) -> Vec<Selector> {
        let mut sels = vec![self.config.query_variable_selector.clone()];
        sels.extend(template::selectors(&self.config.instruction));
        dedup_selectors(sels)
    }

    fn writes(&self) -> Vec<String> {
        vec!["class_name".into(), "class_id".into(), "usage".into()]
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        from_future(self.classify(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use strand_core::context::Services;
    use strand_core::variables::{Segment, VariablePool};
    use strand_test_utils::llm::ScriptedLlm;

    fn node() -> Arc<QuestionClassifierNode> {
        let desc = NodeDescription::new(
            "qc",
            "question-classifier",
            json!({
                "model": {"name": "m"},
                "query_variable_selector": ["sys", "query"],
                "classes": [{"id": "1", "name": "billing"}, {"id": "2", "name": "bug report"}]
            }),
        );
        Arc::new(QuestionClassifierNode::new(&desc).unwrap())
    }

    async fn classify(reply: &str) -> NodeRunResult {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::text(reply)]));
        let (_, result) = collect(node().run(ctx(
            "qc",
            VariablePool::new(),
            Services::new().with_llm(llm),
        )))
        .await;
        result.unwrap()
    }

    #[tokio::test]
    async fn test_json_reply_selects_handle() {
        let result = classify(r#"{"category_id": "2", "category_name": "bug report"}"#).await;
        assert_eq!(result.edge_source_handle.as_deref(), Some("2"));
        assert_eq!(result.outputs["class_name"], Segment::from("bug report"));
    }

    #[tokio::test]
    async fn test_bare_name_reply() {
        let result = classify("billing").await;
        assert_eq!(result.edge_source_handle.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_unmatched_falls_back_to_first() {
        let result = classify("no idea").await;
        assert_eq!(result.edge_source_handle.as_deref(), Some("1"));
    }

    #[test]
    fn test_reads_query() {
        assert_eq!(node().reads(), vec![Selector::system("query")]);
    }
}
