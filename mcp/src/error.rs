//! MCP error types.

use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// JSON-RPC error code for this error when surfaced through the
    /// aggregator. Follows the JSON-RPC 2.0 reserved ranges.
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            McpError::ToolNotFound(_) | McpError::InvalidArguments(_) => -32602,
            McpError::SessionNotFound(_) => -32001,
            McpError::ServerNotFound(_)
            | McpError::ServerUnavailable(_)
            | McpError::ConnectionFailed(_) => -32002,
            _ => -32000,
        }
    }
}
