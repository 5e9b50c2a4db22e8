pub mod agent_loop;
pub mod log;
pub mod prompt;
pub mod registry;
pub mod result;

pub use agent_loop::{AgentLoop, AgentParams};
pub use registry::{Tool, ToolRegistry};
pub use result::{AgentChunk, AgentOutput, AgentResult, AgentState, FinishReason};
