use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::route::NodeRunResult;
use strand_core::types::{ChatMessage, ContentBlock, LlmUsage, Role, StopReason, StreamDelta};
use strand_core::variables::template;
use strand_core::variables::{Segment, Selector, VariablePool};

use super::{dedup_selectors, NodeError, NodeOutput, NodeRunContext, NodeStrategy, NodeStream};
use crate::graph::{NodeDescription, NodeType};

/// Placeholder replaced by the retrieved context before template rendering.
const CONTEXT_PLACEHOLDER: &str = "{{#context#}}";

/// One templated prompt message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptMessage {
    #[serde(default = "default_role")]
    pub role: Role,
    pub text: String,
}

fn default_role() -> Role {
    Role::User
}

/// Chat models take a message list; completion models a single prompt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PromptTemplate {
    Chat(Vec<PromptMessage>),
    Completion(PromptMessage),
}

impl PromptTemplate {
    pub(crate) fn messages(&self) -> Vec<&PromptMessage> {
        match self {
            Self::Chat(m) => m.iter().collect(),
            Self::Completion(m) => vec![m],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub variable_selector: Option<Selector>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VisionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub variable_selector: Option<Selector>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmConfig {
    model: ModelConfig,
    prompt_template: PromptTemplate,
    #[serde(default)]
    context: ContextConfig,
    #[serde(default)]
    vision: VisionConfig,
}

/// Streams a single model completion into `text`.
pub struct LlmNode {
    config: LlmConfig,
}

impl LlmNode {
    pub fn new(desc: &NodeDescription) -> Result<Self> {
        Ok(Self {
            config: desc.parse_config()?,
        })
    }
}

/// Flatten a context variable (string, or retrieval results) into prompt text.
pub(crate) fn context_text(pool: &VariablePool, selector: &Selector) -> Result<Option<String>> {
    let Some(seg) = pool.get(selector) else {
        return Ok(None);
    };
    match seg {
        Segment::String(s) => Ok(Some(s)),
        other => {
            let Some(items) = other.items() else {
                return Ok(Some(other.text()));
            };
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Segment::String(s) => parts.push(s),
                    Segment::Object(map) => match map.get("content").and_then(Value::as_str) {
                        Some(c) => parts.push(c.to_string()),
                        None => {
                            return Err(StrandError::TypeMismatch {
                                selector: selector.to_string(),
                                expected: "object with content".into(),
                                actual: Value::Object(map).to_string(),
                            })
                        }
                    },
                    other => parts.push(other.text()),
                }
            }
            Ok(Some(parts.join("\n").trim().to_string()))
        }
    }
}

/// Render templated messages against the pool.
pub(crate) fn render_messages(
    pool: &VariablePool,
    messages: &[&PromptMessage],
    context: Option<&str>,
) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| {
            let text = match context {
                Some(ctx) => m.text.replace(CONTEXT_PLACEHOLDER, ctx),
                None => m.text.clone(),
            };
            ChatMessage {
                role: m.role.clone(),
                content: vec![ContentBlock::Text {
                    text: pool.convert_template(&text),
                }],
            }
        })
        .collect()
}

/// Run a non-streaming completion and return its text and usage.
pub(crate) async fn complete(
    ctx: &NodeRunContext,
    model: &ModelConfig,
    messages: Vec<ChatMessage>,
) -> Result<(String, LlmUsage)> {
    let llm = ctx.exec.services.llm()?.clone();
    let mut deltas = llm.chat_stream(model, messages, &[]).await?;
    let mut text = String::new();
    let mut usage = LlmUsage::default();
    while let Some(delta) = deltas.next().await {
        if ctx.exec.is_cancelled() {
            return Err(StrandError::Cancelled);
        }
        match delta? {
            StreamDelta::TextDelta(t) => text.push_str(&t),
            StreamDelta::Usage(u) => usage.accumulate(&u),
            _ => {}
        }
    }
    Ok((text, usage))
}

/// Pull the first JSON object out of model text, tolerating code fences and chatter.
pub(crate) fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

pub(crate) fn usage_value(usage: &LlmUsage) -> Segment {
    Segment::from_value(serde_json::to_value(usage).unwrap_or(Value::Null))
}

fn stop_reason_str(reason: &StopReason) -> String {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::ToolUse => "tool_calls",
        StopReason::MaxTokens => "length",
    }
    .to_string()
}

impl NodeStrategy for LlmNode {
    fn node_type(&self) -> NodeType {
        NodeType::Llm
    }

    fn reads(&self) -> Vec<Selector> {
        let mut sels: Vec<Selector> = self
            .config
            .prompt_template
            .messages()
            .iter()
            .flat_map(|m| template::selectors(&m.text))
            .collect();
        if self.config.context.enabled {
            sels.extend(self.config.context.variable_selector.clone());
        }
        if self.config.vision.enabled {
            sels.extend(self.config.vision.variable_selector.clone());
        }
        dedup_selectors(sels)
    }

    fn writes(&self) -> Vec<String> {
        vec!["text".into(), "usage".into(), "finish_reason".into()]
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream {
        Box::pin(stream! {
            let llm = match ctx.exec.services.llm() {
                Ok(llm) => llm.clone(),
                Err(e) => {
                    yield NodeOutput::Done(Err(e.into()));
                    return;
                }
            };
            let config = &self.config;

            let context = match (config.context.enabled, &config.context.variable_selector) {
                (true, Some(sel)) => match context_text(&ctx.pool, sel) {
                    Ok(c) => c,
                    Err(e) => {
                        yield NodeOutput::Done(Err(e.into()));
                        return;
                    }
                },
                _ => None,
            };

            let mut messages = render_messages(
                &ctx.pool,
                &config.prompt_template.messages(),
                context.as_deref(),
            );
            if let (true, Some(sel)) = (config.vision.enabled, &config.vision.variable_selector) {
                attach_images(&ctx.pool, sel, &mut messages);
            }

            let mut inputs = serde_json::Map::new();
            if let Some(c) = &context {
                inputs.insert("#context#".into(), Value::String(c.clone()));
            }
            let prompts = serde_json::to_value(&messages).unwrap_or(Value::Null);

            debug!(node_id = %ctx.node_id, model = %config.model.model_id, "Invoking model");
            let opened = tokio::select! {
                r = llm.chat_stream(&config.model, messages, &[]) => r,
                _ = ctx.exec.cancel.cancelled() => Err(StrandError::Cancelled),
            };
            let mut deltas = match opened {
                Ok(d) => d,
                Err(e) => {
                    yield NodeOutput::Done(Err(e.into()));
                    return;
                }
            };

            let text_selector = ctx.output_selector("text");
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut usage = LlmUsage::default();
            let mut finish_reason: Option<String> = None;
            while let Some(delta) = deltas.next().await {
                if ctx.exec.is_cancelled() {
                    yield NodeOutput::Done(Err(StrandError::Cancelled.into()));
                    return;
                }
                match delta {
                    Ok(StreamDelta::TextDelta(t)) => {
                        text.push_str(&t);
                        yield NodeOutput::Chunk { selector: text_selector.clone(), text: t };
                    }
                    Ok(StreamDelta::ThinkingDelta(t)) => reasoning.push_str(&t),
                    Ok(StreamDelta::Usage(u)) => usage.accumulate(&u),
                    Ok(StreamDelta::Stop(reason)) => {
                        finish_reason.get_or_insert_with(|| stop_reason_str(&reason));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield NodeOutput::Done(Err(NodeError::from(e)));
                        return;
                    }
                }
            }

            let mut result = NodeRunResult::default()
                .output("text", text)
                .output("usage", usage_value(&usage))
                .output("finish_reason", finish_reason.map(Segment::from).unwrap_or(Segment::None));
            if !reasoning.is_empty() {
                result = result.output("reasoning_content", reasoning);
            }
            result.inputs = inputs;
            result.usage = usage;
            result.process_data.insert("prompts".into(), prompts);
            result.process_data.insert("model".into(), json!({
                "provider": config.model.provider,
                "name": config.model.model_id,
            }));
            yield NodeOutput::Done(Ok(result));
        })
    }
}

/// Append image files from `selector` to the last user message.
fn attach_images(pool: &VariablePool, selector: &Selector, messages: &mut [ChatMessage]) {
    let files = match pool.get(selector) {
        Some(Segment::File(f)) => vec![f],
        Some(Segment::ArrayFile(fs)) => fs,
        _ => return,
    };
    let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == Role::User) else {
        return;
    };
    for file in files.into_iter().filter(|f| f.is_image()) {
        if let Some(url) = file.url {
            last_user.content.push(ContentBlock::Image { url });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{collect, ctx};
    use strand_core::context::Services;
    use strand_core::variables::File;
    use strand_test_utils::llm::ScriptedLlm;

    fn node(config: Value) -> Arc<LlmNode> {
        Arc::new(LlmNode::new(&NodeDescription::new("llm", "llm", config)).unwrap())
    }

    fn base_config() -> Value {
        json!({
            "model": {"provider": "test", "name": "m"},
            "prompt_template": [
                {"role": "system", "text": "Context: {{#context#}}"},
                {"role": "user", "text": "Q: {{#start.q#}}"}
            ],
            "context": {"enabled": true, "variable_selector": ["kr", "result"]}
        })
    }

    fn pool() -> VariablePool {
        let mut pool = VariablePool::new();
        pool.add(&Selector::new("start", &["q"]), "why?").unwrap();
        pool.add(
            &Selector::new("kr", &["result"]),
            json!([{"content": "doc one"}, {"content": "doc two"}]),
        )
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_streams_chunks_then_result() {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::chunked(&["Hel", "lo"])]));
        let services = Services::new().with_llm(llm.clone());
        let (items, result) = collect(node(base_config()).run(ctx("llm", pool(), services))).await;

        let chunks: Vec<String> = items
            .iter()
            .filter_map(|i| match i {
                NodeOutput::Chunk { text, selector } => {
                    assert_eq!(selector, &Selector::new("llm", &["text"]));
                    Some(text.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["Hel", "lo"]);

        let result = result.unwrap();
        assert_eq!(result.outputs["text"], Segment::from("Hello"));
        assert_eq!(result.outputs["finish_reason"], Segment::from("stop"));
        assert_eq!(result.usage.total_tokens, 15);

        let sent = &llm.requests()[0];
        assert_eq!(sent[0].text(), "Context: doc one\ndoc two");
        assert_eq!(sent[1].text(), "Q: why?");
    }

    #[tokio::test]
    async fn test_model_error_is_recoverable() {
        let services = Services::new().with_llm(Arc::new(ScriptedLlm::failing("rate limited")));
        let (_, result) = collect(node(base_config()).run(ctx("llm", pool(), services))).await;
        let err = result.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.error_type, "LLMInvokeError");
    }

    #[tokio::test]
    async fn test_missing_llm_is_not_configured() {
        let (_, result) = collect(node(base_config()).run(ctx("llm", pool(), Services::new()))).await;
        assert_eq!(result.unwrap_err().error_type, "NotConfiguredError");
    }

    #[test]
    fn test_reads_templates_and_context() {
        let reads = node(base_config()).reads();
        assert!(reads.contains(&Selector::new("start", &["q"])));
        assert!(reads.contains(&Selector::new("kr", &["result"])));
    }

    #[test]
    fn test_completion_prompt_form() {
        let n = node(json!({
            "model": {"name": "m"},
            "prompt_template": {"text": "Say {{#start.q#}}"}
        }));
        assert_eq!(n.reads(), vec![Selector::new("start", &["q"])]);
    }

    #[test]
    fn test_extract_json_object() {
        let text = "Sure!\n```json\n{\"category_id\": \"c1\"}\n```";
        let map = extract_json_object(text).unwrap();
        assert_eq!(map["category_id"], json!("c1"));
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("} backwards {").is_none());
    }

    #[test]
    fn test_attach_images_to_last_user_message() {
        let mut pool = VariablePool::new();
        pool.add(
            &Selector::new("start", &["pics"]),
            Segment::ArrayFile(vec![
                File::remote("a.png", "https://x/a.png"),
                File::remote("b.pdf", "https://x/b.pdf"),
            ]),
        )
        .unwrap();
        let mut messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        attach_images(&pool, &Selector::new("start", &["pics"]), &mut messages);
        assert!(messages[1].has_images());
        assert_eq!(messages[1].content.len(), 2);
        assert!(!messages[0].has_images());
    }
}
