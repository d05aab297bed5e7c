//! # Marlin Core
//!
//! Domain types, traits, and error definitions for the marlin agent
//! orchestration engine. Every collaborator of the agent loop (completion
//! provider, tools, snapshot persistence) is defined as a trait here and
//! implemented in its own crate, so all crates depend inward on core.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod snapshot;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ErrorKind, MemoryError, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{ConversationId, Message, Role};
pub use provider::{
    FinishReason, Provider, ProviderRequest, StreamChunk, ToolCallDelta, ToolDefinition, Usage,
};
pub use snapshot::{MemorySnapshot, SnapshotStore};
pub use tool::{Tool, ToolCallRequest, ToolRegistry, ToolResult, ToolStatus};
