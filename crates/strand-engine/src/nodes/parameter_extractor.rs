use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::types::ChatMessage;
use strand_core::variables::{template, Segment, Selector};

use super::llm::{complete, extract_json_object, usage_value};
use super::{dedup_selectors, from_future, NodeResult, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ParamType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "select")]
    Select,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "bool", alias = "boolean")]
    Bool,
    #[serde(rename = "array[string]")]
    ArrayString,
    #[serde(rename = "array[number]")]
    ArrayNumber,
    #[serde(rename = "array[object]")]
    ArrayObject,
}

impl ParamType {
    fn json_type(&self) -> &'static str {
        match self {
            Self::String | Self::Select => "string",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::ArrayString | Self::ArrayNumber | Self::ArrayObject => "array",
        }
    }

    /// Value used when the model gave nothing usable.
    fn empty(&self) -> Value {
        match self {
            Self::String | Self::Select => json!(""),
            Self::Number => json!(0),
            Self::Bool => json!(false),
            Self::ArrayString | Self::ArrayNumber | Self::ArrayObject => json!([]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExtractorConfig {
    model: ModelConfig,
    query: Selector,
    parameters: Vec<ParameterConfig>,
    #[serde(default)]
    instruction: String,
}

fn parse_number(s: &str) -> Option<Value> {
    let s = s.trim();
    if s.contains('.') {
        s.parse::<f64>().ok().map(|f| json!(f))
    } else {
        s.parse::<i64>().ok().map(|i| json!(i))
    }
}

/// Coerce one raw value to the declared type. `None` means unusable.
fn transform(param_type: ParamType, raw: &Value) -> Option<Value> {
    match (param_type, raw) {
        (ParamType::Number, Value::Number(_)) => Some(raw.clone()),
        (ParamType::Number, Value::String(s)) => parse_number(s),
        (ParamType::Bool, Value::Bool(_)) => Some(raw.clone()),
        (ParamType::Bool, Value::String(s)) => match s.to_lowercase().as_str() {
            "true" => Some(json!(true)),
            "false" => Some(json!(false)),
            _ => None,
        },
        (ParamType::String | ParamType::Select, Value::String(_)) => Some(raw.clone()),
        (ParamType::ArrayString, Value::Array(items)) => Some(Value::Array(
            items.iter().filter(|v| v.is_string()).cloned().collect(),
        )),
        (ParamType::ArrayNumber, Value::Array(items)) => Some(Value::Array(
            items
                .iter()
                .filter_map(|v| match v {
                    Value::Number(_) => Some(v.clone()),
                    Value::String(s) => parse_number(s),
                    _ => None,
                })
                .collect(),
        )),
        (ParamType::ArrayObject, Value::Array(items)) => Some(Value::Array(
            items.iter().filter(|v| v.is_object()).cloned().collect(),
        )),
        _ => None,
    }
}

/// Pulls structured parameters out of free text with a model call.
///
/// Extraction problems do not fail the node: they are reported through
/// `__is_success` / `__reason` and the affected parameters get empty values.
/// Only a failed model call is an error.
pub struct ParameterExtractorNode {
    config: ExtractorConfig,
}

impl ParameterExtractorNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let config: ExtractorConfig = desc.parse_config()?;
        if config.parameters.is_empty() {
            return Err(StrandError::NodeConfig {
                node_id: desc.id.clone(),
                message: "parameter extractor declares no parameters".into(),
            });
        }
        Ok(Self { config })
    }

    fn schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.config.parameters {
            let mut prop = json!({"type": p.param_type.json_type(), "description": p.description});
            if !p.options.is_empty() {
                prop["enum"] = json!(p.options);
            }
            properties.insert(p.name.clone(), prop);
            if p.required {
                required.push(p.name.clone());
            }
        }
        json!({"type": "object", "properties": properties, "required": required})
    }

    fn system_prompt(&self, instruction: &str) -> String {
        format!(
            "Extract the parameters described by this JSON schema from the user's text and \
             reply with a single JSON object only.\nSchema: {}\n{}",
            self.schema(),
            instruction
        )
    }

    /// Check and coerce the model's object. Returns the outputs plus the first problem seen.
    fn check_outputs(&self, parsed: Option<Map<String, Value>>) -> (BTreeMap<String, Segment>, Option<String>) {
        let mut outputs = BTreeMap::new();
        let mut error = None;
        let parsed = match parsed {
            Some(map) => map,
            None => {
                error = Some("failed to extract a JSON object from the model response".to_string());
                Map::new()
            }
        };
        for p in &self.config.parameters {
            let value = match parsed.get(&p.name) {
                None => {
                    if p.required && error.is_none() {
                        error = Some(format!("parameter {} is required", p.name));
                    }
                    None
                }
                Some(raw) => {
                    let coerced = transform(p.param_type, raw);
                    if coerced.is_none() && error.is_none() {
                        error = Some(format!("invalid {} value for {}", p.param_type.json_type(), p.name));
                    }
                    if let (ParamType::Select, Some(Value::String(s))) = (p.param_type, &coerced) {
                        if !p.options.is_empty() && !p.options.contains(s) && error.is_none() {
                            error = Some(format!("invalid select value for {}", p.name));
                        }
                    }
                    coerced
                }
            };
            let value = value.unwrap_or_else(|| p.param_type.empty());
            outputs.insert(p.name.clone(), Segment::from_value(value));
        }
        (outputs, error)
    }

    async fn extract(self: Arc<Self>, ctx: NodeRunContext) -> NodeResult {
        let query = ctx
            .pool
            .get(&self.config.query)
            .map(|s| s.text())
            .unwrap_or_default();
        let instruction = ctx.pool.convert_template(&self.config.instruction);
        let messages = vec![
            ChatMessage::system(self.system_prompt(&instruction)),
            ChatMessage::user(query.clone()),
        ];
        let (text, usage) = complete(&ctx, &self.config.model, messages).await?;

        let (mut outputs, error) = self.check_outputs(extract_json_object(&text));
        if let Some(e) = &error {
            warn!(node_id = %ctx.node_id, error = %e, "Parameter extraction incomplete");
        }
        outputs.insert("__is_success".into(), Segment::Integer(i64::from(error.is_none())));
        outputs.insert(
            "__reason".into(),
            error.map(Segment::String).unwrap_or(Segment::None),
        );
        outputs.insert("__usage".into(), usage_value(&usage));

        let mut result = NodeRunResult::with_outputs(outputs);
        result.inputs.insert("query".into(), Value::String(query));
        result
            .process_data
            .insert("llm_text".into(), Value::String(text));
        result.usage = usage;
        Ok(result)
    }
}

impl NodeStrategy for ParameterExtractorNode {
    fn node_type(&self) -> NodeType {
        NodeType::ParameterExtractor
    }

    fn reads(&self) -> Vec<Selector> {
        let mut sels = vec![self.config.query.clone()];
        sels.extend(template::selectors(&self.config.instruction));
        dedup_selectors(sels)
    }

    fn writes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config.parameters.iter().map(|p| p.name.clone()).collect();
        names.extend(["__is_success", "__reason", "__usage"].map(String::from));
        names
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        from_future(self.extract(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use strand_core::context::Services;
    use strand_core::variables::VariablePool;
    use strand_test_utils::llm::ScriptedLlm;

    fn node() -> Arc<ParameterExtractorNode> {
        let desc = NodeDescription::new(
            "pe",
            "parameter-extractor",
            json!({
                "model": {"name": "m"},
                "query": ["start", "text"],
                "parameters": [
                    {"name": "city", "type": "string", "required": true},
                    {"name": "days", "type": "number"},
                    {"name": "tags", "type": "array[string]"}
                ]
            }),
        );
        Arc::new(ParameterExtractorNode::new(&desc).unwrap())
    }

    async fn extract(reply: &str) -> NodeRunResult {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::text(reply)]));
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["text"]), "3 days in Rome").unwrap();
        let (_, result) = collect(node().run(ctx("pe", pool, Services::new().with_llm(llm)))).await;
        result.unwrap()
    }

    #[tokio::test]
    async fn test_extracts_and_coerces() {
        let r = extract(r#"Sure: {"city": "Rome", "days": "3", "tags": ["trip", 1]}"#).await;
        assert_eq!(r.outputs["city"], Segment::from("Rome"));
        assert_eq!(r.outputs["days"], Segment::Integer(3));
        assert_eq!(r.outputs["tags"], Segment::ArrayString(vec!["trip".into()]));
        assert_eq!(r.outputs["__is_success"], Segment::Integer(1));
        assert_eq!(r.outputs["__reason"], Segment::None);
    }

    #[tokio::test]
    async fn test_missing_required_reports_reason() {
        let r = extract(r#"{"days": 2}"#).await;
        assert_eq!(r.outputs["__is_success"], Segment::Integer(0));
        assert_eq!(r.outputs["city"], Segment::from(""));
        assert!(r.outputs["__reason"].text().contains("city is required"));
    }

    #[tokio::test]
    async fn test_unparseable_reply_uses_empty_values() {
        let r = extract("I cannot help with that").await;
        assert_eq!(r.outputs["__is_success"], Segment::Integer(0));
        assert_eq!(r.outputs["days"], Segment::Integer(0));
    }

    #[test]
    fn test_transform_numbers() {
        assert_eq!(transform(ParamType::Number, &json!("2.5")), Some(json!(2.5)));
        assert_eq!(transform(ParamType::Number, &json!("x")), None);
        assert_eq!(
            transform(ParamType::ArrayNumber, &json!([1, "2", "no"])),
            Some(json!([1, 2]))
        );
    }
}
