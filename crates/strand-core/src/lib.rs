pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod route;
pub mod snapshot;
pub mod traits;
pub mod types;
pub mod variables;

pub use command::{Command, CommandChannel, InMemoryCommandChannel};
#[cfg(feature = "redis")]
pub use command::RedisCommandChannel;
pub use config::{AppConfig, EngineLimits};
pub use context::{ExecutionContext, Services};
pub use error::{Result, StrandError};
pub use event::{EventBus, ExecutionEvent, GraphEvent, RunFailureKind, ShortCircuitKind};
pub use route::{NodeRunResult, NodeStatus, RouteNodeState, RuntimeRouteState, VariableUpdate};
pub use snapshot::{RuntimeSnapshot, TraversalState};
pub use types::*;
pub use variables::{Segment, SegmentType, Selector, SystemVariables, VariablePool};
