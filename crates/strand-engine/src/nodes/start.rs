use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use strand_core::error::Result;
use strand_core::route::NodeRunResult;
use strand_core::variables::{Segment, SegmentType, Selector};

use super::{done, NodeError, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

/// Input widget kinds a start node may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputType {
    #[serde(alias = "string")]
    TextInput,
    Paragraph,
    Select,
    Number,
    #[serde(alias = "boolean")]
    Checkbox,
    #[serde(alias = "object")]
    Json,
    File,
    FileList,
}

impl InputType {
    fn segment_type(&self) -> SegmentType {
        match self {
            Self::TextInput | Self::Paragraph | Self::Select => SegmentType::String,
            Self::Number => SegmentType::Number,
            Self::Checkbox => SegmentType::Boolean,
            Self::Json => SegmentType::Object,
            Self::File => SegmentType::File,
            Self::FileList => SegmentType::ArrayFile,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartVariable {
    pub variable: String,
    #[serde(rename = "type", default = "default_input_type")]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub options: Vec<String>,
}

fn default_input_type() -> InputType {
    InputType::TextInput
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StartConfig {
    #[serde(default)]
    variables: Vec<StartVariable>,
}

/// Entry node. Caller inputs are seeded under the start node's id before the
/// run; this node validates and coerces them into its declared outputs.
pub struct StartNode {
    node_id: String,
    variables: Vec<StartVariable>,
}

impl StartNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        let config: StartConfig = desc.parse_config()?;
        Ok(Self {
            node_id: desc.id.clone(),
            variables: config.variables,
        })
    }

    fn coerce(&self, var: &StartVariable, raw: Segment) -> std::result::Result<Segment, NodeError> {
        let declared = var.input_type.segment_type();
        if declared.accepts(raw.segment_type()) {
            if var.input_type == InputType::Select
                && !var.options.is_empty()
                && !var.options.contains(&raw.text())
            {
                return Err(NodeError::recoverable(
                    "InputValidationError",
                    format!("{} must be one of {:?}", var.variable, var.options),
                ));
            }
            return Ok(raw);
        }
        let coerced = match (&raw, declared) {
            (Segment::String(s), SegmentType::Number) => s
                .trim()
                .parse::<i64>()
                .map(Segment::Integer)
                .ok()
                .or_else(|| s.trim().parse::<f64>().ok().map(Segment::Float)),
            (Segment::String(s), SegmentType::Boolean) => s.trim().parse::<bool>().ok().map(Segment::Boolean),
            (Segment::String(s), SegmentType::Object) => serde_json::from_str::<Value>(s)
                .ok()
                .and_then(|v| Segment::from_value_typed(v, SegmentType::Object)),
            (other, SegmentType::File | SegmentType::ArrayFile) => {
                Segment::from_value_typed(other.to_value(), declared)
            }
            _ => None,
        };
        coerced.ok_or_else(|| {
            NodeError::recoverable(
                "InputValidationError",
                format!(
                    "input {} expects {}, got {}",
                    var.variable,
                    declared,
                    raw.segment_type()
                ),
            )
        })
    }
}

impl NodeStrategy for StartNode {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    fn reads(&self) -> Vec<Selector> {
        self.variables
            .iter()
            .map(|v| Selector::new(self.node_id.clone(), &[v.variable.as_str()]))
            .collect()
    }

    fn writes(&self) -> Vec<String> {
        self.variables.iter().map(|v| v.variable.clone()).collect()
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        let mut outputs = BTreeMap::new();
        let mut inputs = serde_json::Map::new();
        // undeclared inputs pass through unchanged
        if let Some(scope) = ctx.pool.scope(&self.node_id) {
            for (name, seg) in scope {
                outputs.insert(name.clone(), seg.clone());
            }
        }
        for var in &self.variables {
            let sel = ctx.output_selector(&var.variable);
            let raw = ctx
                .pool
                .get(&sel)
                .filter(|s| !s.is_none())
                .or_else(|| var.default.clone().map(Segment::from_value));
            match raw {
                Some(raw) => match self.coerce(var, raw) {
                    Ok(seg) => {
                        inputs.insert(var.variable.clone(), seg.to_value());
                        outputs.insert(var.variable.clone(), seg);
                    }
                    Err(e) => return done(Err(e)),
                },
                None if var.required => {
                    return done(Err(NodeError::recoverable(
                        "InputValidationError",
                        format!("{} is required in input form", var.variable),
                    )))
                }
                None => {
                    outputs.insert(var.variable.clone(), Segment::None);
                }
            }
        }
        done(Ok(NodeRunResult {
            inputs,
            outputs,
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use crate::nodes::NodeResult;
    use serde_json::json;
    use strand_core::variables::VariablePool;

    fn node(vars: Value) -> Arc<StartNode> {
        let desc = NodeDescription::new("start", "start", json!({ "variables": vars }));
        Arc::new(StartNode::new(&desc).unwrap())
    }

    async fn run(node: Arc<StartNode>, pool: VariablePool) -> NodeResult {
        collect(node.run(ctx("start", pool, Default::default()))).await.1
    }

    #[tokio::test]
    async fn test_required_missing_fails() {
        let n = node(json!([{"variable": "q", "type": "text-input", "required": true}]));
        let err = run(n, VariablePool::new()).await.unwrap_err();
        assert!(err.message.contains("q is required"));
    }

    #[tokio::test]
    async fn test_number_coerced_from_string() {
        let n = node(json!([{"variable": "n", "type": "number"}]));
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["n"]), "42").unwrap();
        let result = run(n, pool).await.unwrap();
        assert_eq!(result.outputs["n"], Segment::Integer(42));
    }

    #[tokio::test]
    async fn test_default_and_optional() {
        let n = node(json!([
            {"variable": "lang", "type": "select", "default": "en", "options": ["en", "fr"]},
            {"variable": "opt", "type": "paragraph"}
        ]));
        let result = run(n, VariablePool::new()).await.unwrap();
        assert_eq!(result.outputs["lang"], Segment::from("en"));
        assert_eq!(result.outputs["opt"], Segment::None);
    }

    #[tokio::test]
    async fn test_select_rejects_unknown_option() {
        let n = node(json!([{"variable": "lang", "type": "select", "options": ["en"]}]));
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["lang"]), "de").unwrap();
        assert!(run(n, pool).await.is_err());
    }

    #[test]
    fn test_reads_declared_inputs() {
        let n = node(json!([{"variable": "q"}]));
        assert_eq!(n.reads(), vec![Selector::new("start", &["q"])]);
        assert_eq!(n.writes(), vec!["q".to_string()]);
    }
}
