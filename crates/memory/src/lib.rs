//! Conversation memory for marlin.
//!
//! [`ConversationMemory`] keeps the ordered message log of one conversation
//! under a token budget. Persistence is separate: snapshots are exported and
//! imported explicitly and handed to a [`SnapshotStore`](marlin_core::SnapshotStore).

pub mod conversation;
pub mod estimator;
pub mod file_backend;
pub mod in_memory;

pub use conversation::ConversationMemory;
pub use estimator::{CharRatioEstimator, TokenEstimator, estimate_tokens};
pub use file_backend::FileSnapshotStore;
pub use in_memory::InMemorySnapshotStore;
