//! Error types for the marlin domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`ErrorKind`] is the
//! provider-independent classification carried by outward error events.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all marlin operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Admission ---
    #[error("Rate limited on '{key}', retry after {retry_after_ms}ms")]
    RateLimited { key: String, retry_after_ms: u64 },

    #[error("Conversation {0} already has a turn in flight")]
    ConversationBusy(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The normalized kind reported to callers of the agent.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Provider(e) => e.kind(),
            Error::Tool(ToolError::MalformedArguments { .. }) => ErrorKind::MalformedToolCall,
            Error::Tool(_) => ErrorKind::ToolExecution,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::ConversationBusy(_) => ErrorKind::ConversationBusy,
            Error::Memory(_) | Error::Config { .. } | Error::Serialization(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Provider-independent error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Quota,
    InvalidRequest,
    Transport,
    Provider,
    RateLimited,
    ToolExecution,
    MalformedToolCall,
    DepthExceeded,
    ConversationBusy,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::Quota => "quota",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Transport => "transport",
            ErrorKind::Provider => "provider",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::MalformedToolCall => "malformed_tool_call",
            ErrorKind::DepthExceeded => "depth_exceeded",
            ErrorKind::ConversationBusy => "conversation_busy",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Quota exceeded at provider: {0}")]
    QuotaExceeded(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::AuthenticationFailed(_) => ErrorKind::Authentication,
            ProviderError::QuotaExceeded(_) => ErrorKind::Quota,
            ProviderError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ProviderError::Network(_)
            | ProviderError::Timeout(_)
            | ProviderError::StreamInterrupted(_) => ErrorKind::Transport,
            ProviderError::ApiError { .. } | ProviderError::NotConfigured(_) => ErrorKind::Provider,
        }
    }

    /// Pure transport flakiness, the only class worth re-opening a stream for.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Network(_) | ProviderError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Snapshot could not be decoded: {0}")]
    Corrupted(String),

    #[error("Token budget {budget} cannot hold the system prompt ({required} tokens)")]
    BudgetTooSmall { budget: usize, required: usize },

    #[error("Message batch needs {required} tokens of structure, only {available} available")]
    BatchTooLarge { required: usize, available: usize },
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    Unknown(String),

    #[error("Tool already registered: {0}")]
    Duplicate(String),

    #[error("Malformed arguments for {tool_name}: {reason}")]
    MalformedArguments { tool_name: String, reason: String },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Transport failure reaching {tool_name}: {reason}")]
    Transport { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool {tool_name} rate limited, retry after {retry_after_ms}ms")]
    RateLimited { tool_name: String, retry_after_ms: u64 },
}

impl ToolError {
    /// Whether another attempt at the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ToolError::ExecutionFailed { .. } | ToolError::Timeout { .. } | ToolError::Transport { .. }
        )
    }
}
