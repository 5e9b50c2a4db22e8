use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::traits::{ToolInvocation, ToolInvoker, ToolOutput};
use strand_core::types::ToolDefinition;

/// A single callable capability offered to the model.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in model tool calls).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Registry of available tools. Implements the invocation hook used by
/// agent and tool nodes when the caller has no richer hook of its own.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Overrides each tool's own timeout when set.
    timeout: Option<Duration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Execute a tool by name, bounded by its timeout.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> Result<ToolOutput> {
        let tool = self
            .get(name)
            .ok_or_else(|| StrandError::ToolNotFound(name.to_string()))?;

        let timeout = self
            .timeout
            .unwrap_or_else(|| Duration::from_secs(tool.timeout_secs()));

        let started = Instant::now();
        let mut output = match tokio::time::timeout(timeout, tool.execute(input)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(StrandError::ToolTimeout {
                    tool: name.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        };
        output.meta.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(tool = name, elapsed_ms = output.meta.elapsed_ms, "Tool finished");
        Ok(output)
    }
}

impl ToolInvoker for ToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    fn invoke(&self, invocation: ToolInvocation) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            self.execute(&invocation.tool_name, invocation.arguments)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase the input text"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>> {
            Box::pin(async move {
                let text = input["text"].as_str().unwrap_or_default().to_uppercase();
                Ok(ToolOutput {
                    content: text,
                    ..Default::default()
                })
            })
        }
    }

    struct Sleepy;

    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "Never finishes in time"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        fn execute(&self, _input: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ToolOutput::default())
            })
        }

        fn timeout_secs(&self) -> u64 {
            1
        }
    }

    #[tokio::test]
    async fn test_invoke_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Upper);
        let out = registry
            .invoke(ToolInvocation {
                call_id: "c1".into(),
                tool_name: "upper".into(),
                arguments: json!({"text": "hi"}),
                node_id: None,
            })
            .await
            .unwrap();
        assert_eq!(out.content, "HI");
        assert_eq!(registry.definitions()[0].name, "upper");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.execute("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, StrandError::ToolNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(Sleepy);
        let err = registry.execute("sleepy", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            StrandError::ToolTimeout { timeout_secs: 1, .. }
        ));
    }
}
