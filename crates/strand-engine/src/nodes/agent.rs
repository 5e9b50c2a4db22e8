use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use strand_agent::{AgentChunk, AgentLoop, AgentOutput, AgentParams};
use strand_core::config::ModelConfig;
use strand_core::error::Result;
use strand_core::route::NodeRunResult;
use strand_core::types::{AgentLog, Role};
use strand_core::variables::{template, Segment, Selector, VariablePool};

use super::llm::{render_messages, usage_value, PromptTemplate, VisionConfig};
use super::{dedup_selectors, NodeError, NodeOutput, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentToolConfig {
    pub tool_name: String,
    #[serde(default)]
    pub provider_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AgentConfig {
    model: ModelConfig,
    prompt_template: PromptTemplate,
    #[serde(default)]
    tools: Vec<AgentToolConfig>,
    /// Overrides `[agent] max_iterations` for this node.
    #[serde(default)]
    max_iterations: Option<usize>,
    #[serde(default)]
    vision: VisionConfig,
}

/// Function-calling agent: runs the think/act/observe loop against the
/// configured tools and streams its answer into `text`.
pub struct AgentNode {
    config: AgentConfig,
}

impl AgentNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        Ok(Self {
            config: desc.parse_config()?,
        })
    }

    /// System messages become the instruction, everything else the query.
    fn split_prompt(&self, pool: &VariablePool) -> (String, String) {
        let rendered = render_messages(pool, &self.config.prompt_template.messages(), None);
        let mut instruction = Vec::new();
        let mut query = Vec::new();
        for m in rendered {
            match m.role {
                Role::System => instruction.push(m.text()),
                _ => query.push(m.text()),
            }
        }
        (instruction.join("\n"), query.join("\n"))
    }

    fn image_urls(&self, pool: &VariablePool) -> Vec<String> {
        let Some(sel) = self
            .config
            .vision
            .variable_selector
            .as_ref()
            .filter(|_| self.config.vision.enabled)
        else {
            return vec![];
        };
        let files = match pool.get(sel) {
            Some(Segment::File(f)) => vec![f],
            Some(Segment::ArrayFile(fs)) => fs,
            _ => vec![],
        };
        files
            .into_iter()
            .filter(|f| f.is_image())
            .filter_map(|f| f.url)
            .collect()
    }
}

/// Keep the latest entry per log id, in first-seen order.
fn merge_log(logs: &mut Vec<AgentLog>, log: AgentLog) {
    match logs.iter_mut().find(|l| l.id == log.id) {
        Some(existing) => *existing = log,
        None => logs.push(log),
    }
}

impl NodeStrategy for AgentNode {
    fn node_type(&self) -> NodeType {
        NodeType::Agent
    }

    fn version(&self) -> &'static str {
        "2"
    }

    fn reads(&self) -> Vec<Selector> {
        let mut sels: Vec<Selector> = self
            .config
            .prompt_template
            .messages()
            .iter()
            .flat_map(|m| template::selectors(&m.text))
            .collect();
        if self.config.vision.enabled {
            sels.extend(self.config.vision.variable_selector.clone());
        }
        dedup_selectors(sels)
    }

    fn writes(&self) -> Vec<String> {
        ["text", "files", "usage", "finish_reason"].map(String::from).to_vec()
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        Box::pin(stream! {
            let services = &ctx.exec.services;
            let (llm, tools) = match (services.llm(), services.tools()) {
                (Ok(llm), Ok(tools)) => (llm.clone(), tools.clone()),
                (Err(e), _) | (_, Err(e)) => {
                    yield NodeOutput::Done(Err(e.into()));
                    return;
                }
            };

            let (instruction, query) = self.split_prompt(&ctx.pool);
            let mut params = AgentParams::new(self.config.model.clone(), query.clone());
            params.instruction = instruction;
            params.image_urls = self.image_urls(&ctx.pool);
            params.max_iterations = self
                .config
                .max_iterations
                .unwrap_or(ctx.exec.agent.max_iterations);
            params.tool_timeout = Duration::from_secs(ctx.exec.agent.tool_timeout_secs);
            params.tool_names = self.config.tools.iter().map(|t| t.tool_name.clone()).collect();
            params.node_id = Some(ctx.node_id.clone());
            debug!(
                node_id = %ctx.node_id,
                tools = params.tool_names.len(),
                max_iterations = params.max_iterations,
                "Starting agent loop"
            );

            let text_selector = ctx.output_selector("text");
            let mut logs: Vec<AgentLog> = Vec::new();
            let mut outputs = AgentLoop::new(llm, tools, params, ctx.exec.cancel.clone()).run();
            while let Some(item) = outputs.next().await {
                match item {
                    Ok(AgentOutput::Yield(AgentChunk::Text(text))) => {
                        yield NodeOutput::Chunk { selector: text_selector.clone(), text };
                    }
                    Ok(AgentOutput::Yield(AgentChunk::Log(log))) => {
                        merge_log(&mut logs, log.clone());
                        yield NodeOutput::Log(log);
                    }
                    Ok(AgentOutput::Done(result)) => {
                        info!(
                            node_id = %ctx.node_id,
                            rounds = result.rounds,
                            finish_reason = result.finish_reason.as_str(),
                            "Agent finished"
                        );
                        let mut node_result = NodeRunResult::default()
                            .output("text", result.text)
                            .output("files", Segment::ArrayFile(result.files))
                            .output("usage", usage_value(&result.usage))
                            .output("finish_reason", result.finish_reason.as_str());
                        node_result.inputs.insert("query".into(), Value::String(query));
                        node_result.usage = result.usage;
                        node_result.metadata.insert(
                            "agent_log".into(),
                            serde_json::to_value(&logs).unwrap_or(Value::Null),
                        );
                        node_result.metadata.insert("rounds".into(), json!(result.rounds));
                        yield NodeOutput::Done(Ok(node_result));
                        return;
                    }
                    Err(e) => {
                        yield NodeOutput::Done(Err(NodeError::from(e)));
                        return;
                    }
                }
            }
            yield NodeOutput::Done(Err(NodeError::fatal(
                "InternalError",
                "agent loop ended without a result",
            )));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use strand_core::context::Services;
    use strand_core::types::{AgentLogStatus, AgentLogType};
    use strand_test_utils::llm::ScriptedLlm;
    use strand_test_utils::services::{StaticTool, StaticToolInvoker};

    fn node(max_iterations: Option<usize>) -> Arc<AgentNode> {
        let desc = NodeDescription::new(
            "agent",
            "agent",
            json!({
                "model": {"name": "m"},
                "prompt_template": [
                    {"role": "system", "text": "You are helpful."},
                    {"role": "user", "text": "{{#sys.query#}}"}
                ],
                "tools": [{"tool_name": "search"}],
                "max_iterations": max_iterations,
            }),
        );
        Arc::new(AgentNode::new(&desc).unwrap())
    }

    fn pool() -> VariablePool {
        VariablePool::with_scopes(
            strand_core::variables::SystemVariables {
                query: Some("find rust".into()),
                ..Default::default()
            },
            Default::default(),
            Default::default(),
        )
    }

    fn services(llm: ScriptedLlm) -> Services {
        Services::new()
            .with_llm(Arc::new(llm))
            .with_tools(Arc::new(StaticToolInvoker::new(vec![StaticTool::new("search", "found it")])))
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let llm = ScriptedLlm::new(vec![
            ScriptedLlm::tool_call("c1", "search", json!({"q": "rust"})),
            ScriptedLlm::text("Rust is a language."),
        ]);
        let (items, result) = collect(node(None).run(ctx("agent", pool(), services(llm)))).await;
        let result = result.unwrap();
        assert_eq!(result.outputs["text"], Segment::from("Rust is a language."));
        assert_eq!(result.outputs["finish_reason"], Segment::from("stop"));

        let chunks: String = items
            .iter()
            .filter_map(|i| match i {
                NodeOutput::Chunk { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, "Rust is a language.");
        assert!(items.iter().any(|i| matches!(
            i,
            NodeOutput::Log(l) if l.log_type == AgentLogType::ToolCall && l.status == AgentLogStatus::Success
        )));
        assert!(result.metadata["agent_log"].as_array().is_some_and(|l| !l.is_empty()));
    }

    #[tokio::test]
    async fn test_iteration_limit() {
        let llm = ScriptedLlm::repeating(ScriptedLlm::tool_call("c", "search", json!({})));
        let (_, result) = collect(node(Some(1)).run(ctx("agent", pool(), services(llm)))).await;
        assert_eq!(
            result.unwrap().outputs["finish_reason"],
            Segment::from("iteration-limit")
        );
    }

    #[tokio::test]
    async fn test_requires_tool_invoker() {
        let services = Services::new().with_llm(Arc::new(ScriptedLlm::new(vec![])));
        let (_, result) = collect(node(None).run(ctx("agent", pool(), services))).await;
        assert_eq!(result.unwrap_err().error_type, "NotConfiguredError");
    }

    #[test]
    fn test_split_prompt() {
        let (instruction, query) = node(None).split_prompt(&pool());
        assert_eq!(instruction, "You are helpful.");
        assert_eq!(query, "find rust");
    }
}
