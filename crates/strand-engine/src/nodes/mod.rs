//! Node strategies, the polymorphic unit of work the scheduler drives.
//!
//! A strategy is built once per graph from its node description (see
//! [`registry::StrategyRegistry`]) and run once per dispatch. It reads the
//! variable pool through an immutable snapshot and reports back through a
//! stream of [`NodeOutput`]s ending in exactly one `Done`. Strategies never
//! write shared state; the engine commits their result.

pub mod agent;
pub mod assigner;
pub mod code;
pub mod condition;
pub mod end;
pub mod http_request;
pub mod if_else;
pub mod iteration;
pub mod knowledge_retrieval;
pub mod llm;
pub mod loop_node;
pub mod parameter_extractor;
pub mod question_classifier;
pub mod registry;
pub mod start;
pub mod tool;
pub mod variable_aggregator;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::FutureExt;
use serde::Deserialize;
use thiserror::Error;

use strand_core::config::EngineLimits;
use strand_core::context::ExecutionContext;
use strand_core::error::StrandError;
use strand_core::route::{NodeRunResult, VariableUpdate};
use strand_core::types::AgentLog;
use strand_core::variables::{Segment, Selector, VariablePool, CONVERSATION_SCOPE};

use crate::graph::Graph;

use crate::graph::NodeType;

pub use registry::StrategyRegistry;

/// Whether the scheduler may route around a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeErrorKind {
    Recoverable,
    Fatal,
}

/// Failure reported by a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_type}: {message}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub error_type: String,
    pub message: String,
}

impl NodeError {
    pub fn recoverable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: NodeErrorKind::Recoverable,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn fatal(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: NodeErrorKind::Fatal,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == NodeErrorKind::Fatal
    }
}

impl From<StrandError> for NodeError {
    fn from(e: StrandError) -> Self {
        let error_type = match &e {
            StrandError::InvalidGraph(_) => return Self::fatal("InvalidGraph", e.to_string()),
            StrandError::NodeConfig { .. } => "NodeConfigError",
            StrandError::ReservedScope(_) => "ReservedScopeError",
            StrandError::InvalidSelector(_) | StrandError::VariableNotFound(_) => {
                "VariableNotFoundError"
            }
            StrandError::TypeMismatch { .. } => "TypeMismatchError",
            StrandError::LlmRequest(_) | StrandError::LlmStream(_) => "LLMInvokeError",
            StrandError::ToolNotFound(_)
            | StrandError::ToolExecution { .. }
            | StrandError::ToolTimeout { .. } => "ToolInvokeError",
            StrandError::CodeExecution(_) => "CodeExecutionError",
            StrandError::Http(_) => "HttpRequestError",
            StrandError::Retrieval(_) => "KnowledgeRetrievalError",
            StrandError::NotConfigured(_) => "NotConfiguredError",
            StrandError::Cancelled => "Cancelled",
            _ => "InternalError",
        };
        Self::recoverable(error_type, e.to_string())
    }
}

pub type NodeResult = std::result::Result<NodeRunResult, NodeError>;

/// One item of a strategy's output stream.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Streamed text destined for `selector` once the node finishes.
    Chunk { selector: Selector, text: String },
    /// Structured agent progress.
    Log(AgentLog),
    /// Terminal result. Nothing after it is read.
    Done(NodeResult),
}

pub type NodeStream = BoxStream<'static, NodeOutput>;

/// Everything a strategy may look at while it runs.
#[derive(Debug, Clone)]
pub struct NodeRunContext {
    pub node_id: String,
    /// Snapshot of the pool at dispatch time.
    pub pool: Arc<VariablePool>,
    pub exec: ExecutionContext,
    /// Ceilings for nested runs started by containers.
    pub limits: EngineLimits,
}

impl NodeRunContext {
    /// Selector addressing one of this node's own outputs.
    pub fn output_selector(&self, name: &str) -> Selector {
        Selector::new(self.node_id.clone(), &[name])
    }
}

pub trait NodeStrategy: Send + Sync + 'static {
    fn node_type(&self) -> NodeType;

    fn version(&self) -> &'static str {
        "1"
    }

    /// Pool selectors this node reads, declared before it runs.
    fn reads(&self) -> Vec<Selector>;

    /// Output names this node writes under its own id on success.
    fn writes(&self) -> Vec<String> {
        vec![]
    }

    fn run(self: Arc<Self>, ctx: NodeRunContext) -> NodeStream;

    /// The sub-graph a container runs per pass.
    fn child_graph(&self) -> Option<&Arc<Graph>> {
        None
    }

    /// Variables a container exposes to its children on the first pass.
    /// Debug runs of a single child node are seeded from these.
    fn first_pass_scope(
        &self,
        _pool: &VariablePool,
    ) -> strand_core::error::Result<Vec<(Selector, Segment)>> {
        Ok(vec![])
    }
}

/// Stream holding a single terminal result.
pub fn done(result: NodeResult) -> NodeStream {
    Box::pin(stream::once(async move { NodeOutput::Done(result) }))
}

/// Stream resolving a future into a single terminal result.
pub fn from_future<F>(fut: F) -> NodeStream
where
    F: Future<Output = NodeResult> + Send + 'static,
{
    Box::pin(stream::once(fut.map(NodeOutput::Done)))
}

/// `(variable, value_selector)` mapping shared by end, code and template-like nodes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VariableSelectorMapping {
    pub variable: String,
    pub value_selector: Selector,
}

/// Collect the selectors referenced by mappings and templates, without duplicates.
pub(crate) fn dedup_selectors(selectors: impl IntoIterator<Item = Selector>) -> Vec<Selector> {
    let mut out: Vec<Selector> = Vec::new();
    for s in selectors {
        if !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

/// Conversation variables a nested run changed, as updates for the
/// container's own result.
pub(crate) fn conversation_updates(before: &VariablePool, after: &VariablePool) -> Vec<VariableUpdate> {
    let unchanged = BTreeMap::new();
    let old = before.scope(CONVERSATION_SCOPE).unwrap_or(&unchanged);
    after
        .scope(CONVERSATION_SCOPE)
        .into_iter()
        .flatten()
        .filter(|(name, value)| old.get(name.as_str()) != Some(*value))
        .map(|(name, value)| VariableUpdate {
            selector: Selector::new(CONVERSATION_SCOPE, &[name.as_str()]),
            value: value.clone(),
        })
        .collect()
}
