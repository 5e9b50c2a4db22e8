use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::traits::ToolInvocation;
use strand_core::variables::{template, Segment, Selector, VariablePool};

use super::{dedup_selectors, from_future, NodeResult, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

/// How a tool parameter gets its value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ToolInput {
    /// Value read from the pool as-is.
    Variable(Selector),
    /// Template string rendered against the pool.
    Mixed(String),
    Constant(Value),
}

impl ToolInput {
    fn resolve(&self, pool: &VariablePool) -> Value {
        match self {
            Self::Variable(sel) => pool.get_value(sel),
            Self::Mixed(text) => Value::String(pool.convert_template(text)),
            Self::Constant(v) => v.clone(),
        }
    }

    fn selectors(&self) -> Vec<Selector> {
        match self {
            Self::Variable(sel) => vec![sel.clone()],
            Self::Mixed(text) => template::selectors(text),
            Self::Constant(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ToolConfig {
    #[serde(default)]
    provider_id: Option<String>,
    tool_name: String,
    #[serde(default)]
    tool_parameters: BTreeMap<String, ToolInput>,
}

/// Invokes one tool through the invocation hook.
pub struct ToolNode {
    config: ToolConfig,
}

impl ToolNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        Ok(Self {
            config: desc.parse_config()?,
        })
    }

    async fn invoke(self: Arc<Self>, ctx: NodeRunContext) -> NodeResult {
        let tools = ctx.exec.services.tools()?.clone();
        let arguments: Map<String, Value> = self
            .config
            .tool_parameters
            .iter()
            .map(|(name, input)| (name.clone(), input.resolve(&ctx.pool)))
            .collect();

        let invocation = ToolInvocation {
            call_id: uuid::Uuid::new_v4().to_string(),
            tool_name: self.config.tool_name.clone(),
            arguments: Value::Object(arguments.clone()),
            node_id: Some(ctx.node_id.clone()),
        };
        let timeout_secs = ctx.exec.agent.tool_timeout_secs;
        debug!(node_id = %ctx.node_id, tool = %self.config.tool_name, "Invoking tool");

        let output = tokio::select! {
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), tools.invoke(invocation)) => match r {
                Ok(out) => out?,
                Err(_) => {
                    return Err(StrandError::ToolTimeout {
                        tool: self.config.tool_name.clone(),
                        timeout_secs,
                    }
                    .into())
                }
            },
            _ = ctx.exec.cancel.cancelled() => return Err(StrandError::Cancelled.into()),
        };
        if let Some(error) = &output.meta.error {
            return Err(StrandError::ToolExecution {
                tool: self.config.tool_name.clone(),
                message: error.clone(),
            }
            .into());
        }
        info!(
            node_id = %ctx.node_id,
            tool = %self.config.tool_name,
            elapsed_ms = output.meta.elapsed_ms,
            "Tool finished"
        );

        let json_out = match output.json {
            Some(Value::Array(items)) => Segment::from_value(Value::Array(items)),
            Some(v) => Segment::from_value(Value::Array(vec![v])),
            None => Segment::ArrayObject(vec![]),
        };
        let mut result = NodeRunResult::default()
            .output("text", output.content)
            .output("files", Segment::ArrayFile(output.files))
            .output("json", json_out);
        result.inputs = arguments;
        result.metadata.insert(
            "tool_info".into(),
            json!({
                "provider_id": self.config.provider_id,
                "tool_name": self.config.tool_name,
                "elapsed_ms": output.meta.elapsed_ms,
            }),
        );
        Ok(result)
    }
}

impl NodeStrategy for ToolNode {
    fn node_type(&self) -> NodeType {
        NodeType::Tool
    }

    fn reads(&self) -> Vec<Selector> {
        dedup_selectors(
            self.config
                .tool_parameters
                .values()
                .flat_map(ToolInput::selectors),
        )
    }

    fn writes(&self) -> Vec<String> {
        vec!["text".into(), "files".into(), "json".into()]
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        from_future(self.invoke(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use strand_core::context::Services;
    use strand_test_utils::services::{StaticTool, StaticToolInvoker};

    fn node(tool: &str) -> Arc<ToolNode> {
        let desc = NodeDescription::new(
            "tool",
            "tool",
            json!({
                "tool_name": tool,
                "tool_parameters": {
                    "q": {"type": "mixed", "value": "weather in {{#start.city#}}"},
                    "city": {"type": "variable", "value": ["start", "city"]},
                    "units": {"type": "constant", "value": "metric"}
                }
            }),
        );
        Arc::new(ToolNode::new(&desc).unwrap())
    }

    fn pool() -> VariablePool {
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["city"]), "Oslo").unwrap();
        pool
    }

    #[tokio::test]
    async fn test_invokes_with_resolved_parameters() {
        let invoker = Arc::new(StaticToolInvoker::new(vec![StaticTool::new("weather", "sunny")]));
        let services = Services::new().with_tools(invoker.clone());
        let (_, result) = collect(node("weather").run(ctx("tool", pool(), services))).await;
        let result = result.unwrap();
        assert_eq!(result.outputs["text"], Segment::from("sunny"));

        let calls = invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].node_id.as_deref(), Some("tool"));
        assert_eq!(
            calls[0].arguments,
            json!({"q": "weather in Oslo", "city": "Oslo", "units": "metric"})
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_is_recoverable() {
        let invoker = Arc::new(StaticToolInvoker::new(vec![]));
        let services = Services::new().with_tools(invoker);
        let (_, result) = collect(node("missing").run(ctx("tool", pool(), services))).await;
        let err = result.unwrap_err();
        assert_eq!(err.error_type, "ToolInvokeError");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_reads_variables_and_templates() {
        let reads = node("weather").reads();
        assert_eq!(reads, vec![Selector::new("start", &["city"])]);
    }
}
