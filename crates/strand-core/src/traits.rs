use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ModelConfig;
use crate::error::Result;
use crate::event::ShortCircuitKind;
use crate::types::*;
use crate::variables::File;

/// Streaming chat against an external model service.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// One tool call handed to the invocation hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    /// Node that issued the call, for the caller's accounting.
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Timing and provider status of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInvokeMeta {
    pub elapsed_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_config: Map<String, Value>,
}

impl ToolInvokeMeta {
    pub fn error(elapsed: Duration, message: impl Into<String>) -> Self {
        Self {
            elapsed_ms: elapsed.as_millis() as u64,
            error: Some(message.into()),
            tool_config: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    /// Files created by the tool. Storage is the caller's concern.
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub json: Option<Value>,
    #[serde(default)]
    pub meta: ToolInvokeMeta,
}

/// Tool invocation hook used by agent and tool nodes.
pub trait ToolInvoker: Send + Sync + 'static {
    /// Definitions of the tools this invoker can run.
    fn definitions(&self) -> Vec<ToolDefinition>;

    fn invoke(&self, invocation: ToolInvocation) -> BoxFuture<'_, Result<ToolOutput>>;
}

/// Sandboxed code runner for `code` nodes.
pub trait CodeExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        language: &str,
        code: &str,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'_, Result<Map<String, Value>>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Outbound HTTP for `http-request` nodes.
pub trait HttpRequester: Send + Sync + 'static {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub content: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Vector/keyword search over knowledge bases.
pub trait KnowledgeRetriever: Send + Sync + 'static {
    fn retrieve(
        &self,
        dataset_ids: &[String],
        query: &str,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<RetrievedChunk>>>;
}

/// Canned response that replaces the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortCircuit {
    pub kind: ShortCircuitKind,
    pub answer: String,
}

/// Moderation / annotation check performed before the graph starts.
pub trait InputGuard: Send + Sync + 'static {
    fn check(
        &self,
        inputs: &Map<String, Value>,
        query: Option<&str>,
    ) -> BoxFuture<'_, Result<Option<ShortCircuit>>>;
}
