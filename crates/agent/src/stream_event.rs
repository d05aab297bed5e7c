//! Agent-level streaming events.
//!
//! `AgentEvent` is what a caller of [`Agent::submit`](crate::Agent::submit)
//! receives. Every turn ends with exactly one terminal event: `done` or
//! `error`.

use marlin_core::error::ErrorKind;
use marlin_core::provider::Usage;
use marlin_core::tool::ToolResult;
use serde::{Deserialize, Serialize};

/// Events emitted while a turn runs.
///
/// - `content`     partial answer text from the model
/// - `tool_invoked` the model requested a tool
/// - `tool_result` a requested tool finished
/// - `error`       the turn failed or hit the iteration bound
/// - `done`        the turn produced an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Partial text, forwarded as the model produces it.
    Content { delta: String },

    /// The model asked for a tool. `arguments` is the parsed JSON object,
    /// or the raw text when it does not parse.
    ToolInvoked {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    ToolResult {
        id: String,
        name: String,
        result: ToolResult,
    },

    Error { kind: ErrorKind, message: String },

    Done {
        conversation_id: String,
        content: String,
        usage: Option<Usage>,
        iterations: usize,
        tool_calls_made: usize,
    },
}

impl AgentEvent {
    /// SSE-style event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Content { .. } => "content",
            Self::ToolInvoked { .. } => "tool_invoked",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    /// Whether this event ends the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }
}
