use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrandError {
    // Graph errors
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unsupported node type: {node_type} (version {version})")]
    UnsupportedNodeType { node_type: String, version: String },

    #[error("Invalid config for node {node_id}: {message}")]
    NodeConfig { node_id: String, message: String },

    // Variable pool errors
    #[error("Write to reserved scope rejected: {0}")]
    ReservedScope(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error("Type mismatch for {selector}: expected {expected}, got {actual}")]
    TypeMismatch {
        selector: String,
        expected: String,
        actual: String,
    },

    // Collaborator errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Code execution failed: {0}")]
    CodeExecution(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Knowledge retrieval failed: {0}")]
    Retrieval(String),

    #[error("Collaborator not configured: {0}")]
    NotConfigured(String),

    // Run control
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Command channel error: {0}")]
    CommandChannel(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StrandError>;
