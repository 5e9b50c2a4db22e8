use serde::{Deserialize, Serialize};

use strand_core::types::{AgentLog, LlmUsage};
use strand_core::variables::File;

/// Phase of the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    AwaitingModel,
    ModelResponding,
    AwaitingTool,
    ToolResponding,
    Done,
}

/// Why the loop finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// The model answered without requesting tools.
    Stop,
    /// The model hit its output token ceiling.
    Length,
    /// The round budget ran out while the model still wanted tools.
    IterationLimit,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::IterationLimit => "iteration-limit",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Terminal value of the agent loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub text: String,
    pub files: Vec<File>,
    pub usage: LlmUsage,
    pub finish_reason: FinishReason,
    pub rounds: usize,
}

/// Intermediate item produced while the loop runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentChunk {
    Text(String),
    Log(AgentLog),
}

/// Item pulled from the agent loop: chunks, then exactly one `Done`.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    Yield(AgentChunk),
    Done(AgentResult),
}
