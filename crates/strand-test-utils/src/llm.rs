use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;

use strand_core::config::ModelConfig;
use strand_core::error::{Result, StrandError};
use strand_core::traits::LlmClient;
use strand_core::types::*;

/// LLM stub that replays canned delta scripts, one per request.
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<StreamDelta>>>,
    repeat: Option<Vec<StreamDelta>>,
    failure: Option<String>,
    chunk_delay: Option<Duration>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    tool_counts: Mutex<Vec<usize>>,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Vec<StreamDelta>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            repeat: None,
            failure: None,
            chunk_delay: None,
            requests: Mutex::new(vec![]),
            tool_counts: Mutex::new(vec![]),
        }
    }

    /// Answer every request with the same script.
    pub fn repeating(script: Vec<StreamDelta>) -> Self {
        let mut llm = Self::new(vec![]);
        llm.repeat = Some(script);
        llm
    }

    /// Fail every request with an `LlmRequest` error.
    pub fn failing(message: &str) -> Self {
        let mut llm = Self::new(vec![]);
        llm.failure = Some(message.to_string());
        llm
    }

    /// Sleep before each delta, so tests can interleave commands with a stream.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// A plain text answer using 10 prompt + 5 completion tokens.
    pub fn text(text: &str) -> Vec<StreamDelta> {
        vec![
            StreamDelta::TextDelta(text.to_string()),
            StreamDelta::Usage(LlmUsage::new(10, 5)),
            StreamDelta::Stop(StopReason::EndTurn),
        ]
    }

    /// The same answer split into several deltas.
    pub fn chunked(chunks: &[&str]) -> Vec<StreamDelta> {
        let mut script: Vec<StreamDelta> = chunks
            .iter()
            .map(|c| StreamDelta::TextDelta(c.to_string()))
            .collect();
        script.push(StreamDelta::Usage(LlmUsage::new(10, 5)));
        script.push(StreamDelta::Stop(StopReason::EndTurn));
        script
    }

    /// A single tool call request.
    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Vec<StreamDelta> {
        vec![
            StreamDelta::ToolUseStart {
                index: 0,
                id: id.to_string(),
                name: name.to_string(),
            },
            StreamDelta::ToolInputDelta {
                index: 0,
                delta: arguments.to_string(),
            },
            StreamDelta::Usage(LlmUsage::new(10, 5)),
            StreamDelta::Stop(StopReason::ToolUse),
        ]
    }

    /// Every message list received so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of tool definitions offered on each request.
    pub fn tool_counts(&self) -> Vec<usize> {
        self.tool_counts.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_script(&self) -> Result<Vec<StreamDelta>> {
        if let Some(msg) = &self.failure {
            return Err(StrandError::LlmRequest(msg.clone()));
        }
        let next = self
            .scripts
            .lock()
            .map_err(|e| StrandError::LlmRequest(e.to_string()))?
            .pop_front();
        next.or_else(|| self.repeat.clone())
            .ok_or_else(|| StrandError::LlmRequest("script exhausted".into()))
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(messages);
        }
        if let Ok(mut t) = self.tool_counts.lock() {
            t.push(tools.len());
        }
        let script = self.next_script();
        let delay = self.chunk_delay;
        Box::pin(async move {
            let script = script?;
            let s: BoxStream<'_, Result<StreamDelta>> = match delay {
                Some(delay) => Box::pin(stream::iter(script).then(move |d| async move {
                    tokio::time::sleep(delay).await;
                    Ok(d)
                })),
                None => Box::pin(stream::iter(script.into_iter().map(Ok))),
            };
            Ok(s)
        })
    }
}
