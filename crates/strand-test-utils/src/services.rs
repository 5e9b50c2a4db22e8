use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use strand_core::error::{Result, StrandError};
use strand_core::event::ShortCircuitKind;
use strand_core::traits::*;
use strand_core::types::ToolDefinition;

/// Tool that always answers with the same text.
#[derive(Debug, Clone)]
pub struct StaticTool {
    pub name: String,
    pub output: String,
}

impl StaticTool {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
        }
    }
}

/// Invocation hook backed by static tools. Records every invocation.
#[derive(Default)]
pub struct StaticToolInvoker {
    tools: Vec<StaticTool>,
    calls: Mutex<Vec<ToolInvocation>>,
}

impl StaticToolInvoker {
    pub fn new(tools: Vec<StaticTool>) -> Self {
        Self {
            tools,
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ToolInvoker for StaticToolInvoker {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: format!("static tool {}", t.name),
                input_schema: json!({"type": "object"}),
            })
            .collect()
    }

    fn invoke(&self, invocation: ToolInvocation) -> BoxFuture<'_, Result<ToolOutput>> {
        let found = self
            .tools
            .iter()
            .find(|t| t.name == invocation.tool_name)
            .cloned();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        Box::pin(async move {
            let tool = found.ok_or_else(|| StrandError::ToolNotFound(invocation.tool_name))?;
            Ok(ToolOutput {
                content: tool.output,
                ..Default::default()
            })
        })
    }
}

type CodeFn = dyn Fn(&Map<String, Value>) -> Result<Map<String, Value>> + Send + Sync;

/// Code executor that runs a Rust closure instead of a sandbox.
pub struct FakeCodeExecutor {
    run: Box<CodeFn>,
}

impl FakeCodeExecutor {
    pub fn new(
        run: impl Fn(&Map<String, Value>) -> Result<Map<String, Value>> + Send + Sync + 'static,
    ) -> Self {
        Self { run: Box::new(run) }
    }

    /// Always fails with the given message.
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::new(move |_| Err(StrandError::CodeExecution(message.clone())))
    }
}

impl CodeExecutor for FakeCodeExecutor {
    fn execute(
        &self,
        _language: &str,
        _code: &str,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'_, Result<Map<String, Value>>> {
        let result = (self.run)(&inputs);
        Box::pin(async move { result })
    }
}

/// HTTP stub returning canned responses keyed by url.
#[derive(Default)]
pub struct FakeHttp {
    responses: HashMap<String, HttpResponse>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, url: &str, status_code: u16, body: &str) -> Self {
        self.responses.insert(
            url.to_string(),
            HttpResponse {
                status_code,
                headers: vec![("content-type".into(), "application/json".into())],
                body: body.to_string(),
            },
        );
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl HttpRequester for FakeHttp {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        let response = self.responses.get(&request.url).cloned();
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        Box::pin(async move {
            response.ok_or_else(|| StrandError::Http(format!("connection refused: {}", request.url)))
        })
    }
}

/// Retriever returning fixed chunks for any query.
#[derive(Default)]
pub struct FakeRetriever {
    chunks: Vec<RetrievedChunk>,
}

impl FakeRetriever {
    pub fn new(contents: &[&str]) -> Self {
        Self {
            chunks: contents
                .iter()
                .enumerate()
                .map(|(i, c)| RetrievedChunk {
                    content: c.to_string(),
                    title: Some(format!("doc-{i}")),
                    score: Some(1.0 - i as f64 * 0.1),
                    metadata: Map::new(),
                })
                .collect(),
        }
    }
}

impl KnowledgeRetriever for FakeRetriever {
    fn retrieve(
        &self,
        _dataset_ids: &[String],
        _query: &str,
        top_k: usize,
    ) -> BoxFuture<'_, Result<Vec<RetrievedChunk>>> {
        let chunks: Vec<RetrievedChunk> = self.chunks.iter().take(top_k).cloned().collect();
        Box::pin(async move { Ok(chunks) })
    }
}

/// Guard that blocks any query containing a banned word.
pub struct KeywordGuard {
    pub banned: String,
    pub answer: String,
}

impl KeywordGuard {
    pub fn new(banned: &str, answer: &str) -> Arc<Self> {
        Arc::new(Self {
            banned: banned.to_string(),
            answer: answer.to_string(),
        })
    }
}

impl InputGuard for KeywordGuard {
    fn check(
        &self,
        _inputs: &Map<String, Value>,
        query: Option<&str>,
    ) -> BoxFuture<'_, Result<Option<ShortCircuit>>> {
        let blocked = query.map(|q| q.contains(&self.banned)).unwrap_or(false);
        Box::pin(async move {
            Ok(blocked.then(|| ShortCircuit {
                kind: ShortCircuitKind::InputModerationBlocked,
                answer: self.answer.clone(),
            }))
        })
    }
}
