use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use strand_core::error::Result;
use strand_core::route::NodeRunResult;
use strand_core::variables::{Segment, SegmentType, Selector};

use super::{
    from_future, NodeError, NodeResult, NodeRunContext, NodeStrategy, NodeStream,
    VariableSelectorMapping,
};
use crate::graph::{NodeDescription, NodeType};

#[derive(Debug, Clone, Deserialize)]
pub struct OutputDecl {
    #[serde(rename = "type")]
    pub output_type: SegmentType,
}

#[derive(Debug, Clone, Deserialize)]
struct CodeConfig {
    code_language: String,
    code: String,
    #[serde(default)]
    variables: Vec<VariableSelectorMapping>,
    #[serde(default)]
    outputs: BTreeMap<String, OutputDecl>,
}

/// Runs user code in the external sandbox and type-checks what comes back.
pub struct CodeNode {
    config: CodeConfig,
}

impl CodeNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        Ok(Self {
            config: desc.parse_config()?,
        })
    }

    async fn execute(self: Arc<Self>, ctx: NodeRunContext) -> NodeResult {
        let executor = ctx.exec.services.code()?.clone();
        let inputs: Map<String, Value> = self
            .config
            .variables
            .iter()
            .map(|m| (m.variable.clone(), ctx.pool.get_value(&m.value_selector)))
            .collect();

        debug!(
            node_id = %ctx.node_id,
            language = %self.config.code_language,
            inputs = inputs.len(),
            "Executing code"
        );
        let raw = tokio::select! {
            r = executor.execute(&self.config.code_language, &self.config.code, inputs.clone()) => r?,
            _ = ctx.exec.cancel.cancelled() => return Err(NodeError::recoverable("Cancelled", "code execution cancelled")),
        };

        let outputs = self.validate(raw)?;
        Ok(NodeRunResult {
            inputs,
            outputs,
            ..Default::default()
        })
    }

    /// Every declared output must be present with a compatible type.
    /// Undeclared keys are dropped.
    fn validate(&self, mut raw: Map<String, Value>) -> std::result::Result<BTreeMap<String, Segment>, NodeError> {
        if self.config.outputs.is_empty() {
            return Ok(raw
                .into_iter()
                .map(|(k, v)| (k, Segment::from_value(v)))
                .collect());
        }
        let mut outputs = BTreeMap::new();
        for (name, decl) in &self.config.outputs {
            let value = raw.remove(name).ok_or_else(|| {
                NodeError::recoverable("OutputValidationError", format!("output {name} is missing"))
            })?;
            let actual = Segment::from_value(value.clone()).segment_type();
            let seg = Segment::from_value_typed(value, decl.output_type).ok_or_else(|| {
                NodeError::recoverable(
                    "OutputValidationError",
                    format!("output {name} must be {}, got {actual}", decl.output_type),
                )
            })?;
            outputs.insert(name.clone(), seg);
        }
        Ok(outputs)
    }
}

impl NodeStrategy for CodeNode {
    fn node_type(&self) -> NodeType {
        NodeType::Code
    }

    fn reads(&self) -> Vec<Selector> {
        self.config
            .variables
            .iter()
            .map(|m| m.value_selector.clone())
            .collect()
    }

    fn writes(&self) -> Vec<String> {
        self.config.outputs.keys().cloned().collect()
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        from_future(self.execute(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use serde_json::json;
    use strand_core::context::Services;
    use strand_core::variables::VariablePool;
    use strand_test_utils::services::FakeCodeExecutor;

    fn node() -> Arc<CodeNode> {
        let desc = NodeDescription::new(
            "code",
            "code",
            json!({
                "code_language": "python3",
                "code": "def main(x): return {'doubled': x * 2}",
                "variables": [{"variable": "x", "value_selector": ["start", "x"]}],
                "outputs": {"doubled": {"type": "number"}}
            }),
        );
        Arc::new(CodeNode::new(&desc).unwrap())
    }

    fn pool() -> VariablePool {
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["x"]), 21).unwrap();
        pool
    }

    #[tokio::test]
    async fn test_declared_output() {
        let exec = FakeCodeExecutor::new(|inputs| {
            let x = inputs["x"].as_i64().unwrap_or_default();
            let mut out = Map::new();
            out.insert("doubled".into(), json!(x * 2));
            out.insert("extra".into(), json!("dropped"));
            Ok(out)
        });
        let services = Services::new().with_code(Arc::new(exec));
        let (_, result) = collect(node().run(ctx("code", pool(), services))).await;
        let result = result.unwrap();
        assert_eq!(result.outputs["doubled"], Segment::Integer(42));
        assert!(!result.outputs.contains_key("extra"));
        assert_eq!(result.inputs["x"], json!(21));
    }

    #[tokio::test]
    async fn test_wrong_type_rejected() {
        let exec = FakeCodeExecutor::new(|_| {
            let mut out = Map::new();
            out.insert("doubled".into(), json!("forty-two"));
            Ok(out)
        });
        let services = Services::new().with_code(Arc::new(exec));
        let (_, result) = collect(node().run(ctx("code", pool(), services))).await;
        assert_eq!(result.unwrap_err().error_type, "OutputValidationError");
    }

    #[tokio::test]
    async fn test_missing_output_rejected() {
        let exec = FakeCodeExecutor::new(|_| Ok(Map::new()));
        let services = Services::new().with_code(Arc::new(exec));
        let (_, result) = collect(node().run(ctx("code", pool(), services))).await;
        assert!(result.unwrap_err().message.contains("doubled is missing"));
    }

    #[tokio::test]
    async fn test_sandbox_failure_is_recoverable() {
        let services = Services::new().with_code(Arc::new(FakeCodeExecutor::failing("SyntaxError")));
        let (_, result) = collect(node().run(ctx("code", pool(), services))).await;
        let err = result.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.error_type, "CodeExecutionError");
    }
}
