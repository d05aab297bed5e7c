//! The agent loop, the heart of marlin.
//!
//! A turn follows a **complete → act → observe** cycle:
//!
//! 1. **Receive** a user message and append it to conversation memory
//! 2. **Select** the tools worth offering and stream a completion
//! 3. **If tool calls**: execute them, append the results, loop back to 2
//! 4. **If an answer**: store it and report `Done`
//!
//! The loop ends with an answer, an error, or when the iteration bound is
//! reached.

pub mod completion;
pub mod executor;
pub mod loop_runner;
pub mod selection;
pub mod session;
pub mod stats;
pub mod stream_event;

#[cfg(test)]
mod test_helpers;

pub use completion::{CompletionClient, CompletionEvent, CompletionStream};
pub use executor::{ExecutionPolicy, ToolExecutor};
pub use loop_runner::{AgentLoop, COMPLETION_KEY, TurnOutcome};
pub use selection::ToolSelector;
pub use session::Agent;
pub use stats::{ToolStats, ToolStatsRegistry};
pub use stream_event::AgentEvent;
