use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::RuntimeSnapshot;
use crate::types::AgentLog;
use crate::variables::{Segment, Selector};

/// Why a run terminated with failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunFailureKind {
    /// A node failed and declared no error strategy.
    NodeFailure,
    /// Unexpected internal error (strategy panic, fatal node error).
    FatalException,
    /// `max_execution_steps` or `max_execution_time` was hit.
    ResourceExhausted,
}

impl fmt::Display for RunFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeFailure => write!(f, "node-failure"),
            Self::FatalException => write!(f, "fatal-exception"),
            Self::ResourceExhausted => write!(f, "resource-exhausted"),
        }
    }
}

/// Pre-execution short-circuits that end a run before any node starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShortCircuitKind {
    InputModerationBlocked,
    AnnotationReply,
}

/// Event emitted by the graph engine, in `index` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GraphEvent {
    RunStarted {
        execution_id: String,
    },
    NodeStarted {
        node_id: String,
        node_type: String,
        state_id: String,
        index: usize,
        #[serde(default)]
        predecessor_node_id: Option<String>,
    },
    StreamChunk {
        node_id: String,
        state_id: String,
        selector: Selector,
        chunk: String,
    },
    AgentLog {
        node_id: String,
        state_id: String,
        log: AgentLog,
    },
    NodeRetry {
        node_id: String,
        state_id: String,
        attempt: u32,
        error: String,
    },
    NodeSucceeded {
        node_id: String,
        node_type: String,
        state_id: String,
        index: usize,
        outputs: BTreeMap<String, Segment>,
        #[serde(default)]
        branch: Option<String>,
        elapsed_ms: i64,
    },
    BranchSelected {
        node_id: String,
        handle: String,
    },
    /// Recovered through the default-value error strategy.
    NodeException {
        node_id: String,
        node_type: String,
        state_id: String,
        index: usize,
        error: String,
        outputs: BTreeMap<String, Segment>,
    },
    NodeFailed {
        node_id: String,
        node_type: String,
        state_id: String,
        index: usize,
        error: String,
        error_type: String,
    },
    RunSucceeded {
        outputs: BTreeMap<String, Segment>,
        #[serde(default)]
        short_circuit: Option<ShortCircuitKind>,
    },
    RunFailed {
        kind: RunFailureKind,
        error: String,
        #[serde(default)]
        exceptions_count: usize,
    },
    RunStopped {
        reason: String,
    },
    RunPaused {
        #[serde(default)]
        reason: Option<String>,
        snapshot: Box<RuntimeSnapshot>,
    },
}

impl GraphEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run-started",
            Self::NodeStarted { .. } => "node-started",
            Self::StreamChunk { .. } => "stream-chunk",
            Self::AgentLog { .. } => "agent-log",
            Self::NodeRetry { .. } => "node-retry",
            Self::NodeSucceeded { .. } => "node-succeeded",
            Self::BranchSelected { .. } => "branch-selected",
            Self::NodeException { .. } => "node-exception",
            Self::NodeFailed { .. } => "node-failed",
            Self::RunSucceeded { .. } => "run-succeeded",
            Self::RunFailed { .. } => "run-failed",
            Self::RunStopped { .. } => "run-stopped",
            Self::RunPaused { .. } => "run-paused",
        }
    }

    /// Node the event belongs to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeStarted { node_id, .. }
            | Self::StreamChunk { node_id, .. }
            | Self::AgentLog { node_id, .. }
            | Self::NodeRetry { node_id, .. }
            | Self::NodeSucceeded { node_id, .. }
            | Self::BranchSelected { node_id, .. }
            | Self::NodeException { node_id, .. }
            | Self::NodeFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunSucceeded { .. }
                | Self::RunFailed { .. }
                | Self::RunStopped { .. }
                | Self::RunPaused { .. }
        )
    }
}

/// A graph event tagged with the run it came from, as seen on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GraphEvent,
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, execution_id: &str, event: GraphEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(ExecutionEvent {
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
