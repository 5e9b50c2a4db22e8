pub mod pool;
pub mod segment;
pub mod selector;
pub mod template;

pub use pool::{SystemVariables, VariablePool};
pub use segment::{File, Segment, SegmentType};
pub use selector::{
    Selector, CONVERSATION_SCOPE, ENVIRONMENT_SCOPE, RESERVED_SCOPES, SYSTEM_SCOPE,
};
pub use template::TemplatePart;
