//! Snapshot persistence seam.
//!
//! Conversation memory only enforces ordering and budget. Saving and
//! loading it lives behind [`SnapshotStore`], connected through explicit
//! export/import calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::message::{ConversationId, Message};

/// An exported conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub saved_at: DateTime<Utc>,
}

impl MemorySnapshot {
    pub fn new(conversation_id: ConversationId, messages: Vec<Message>) -> Self {
        Self {
            conversation_id,
            messages,
            saved_at: Utc::now(),
        }
    }
}

/// Storage for conversation snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn name(&self) -> &str;

    /// The latest snapshot, or `None` if absent or expired.
    async fn load(&self, id: &ConversationId) -> std::result::Result<Option<MemorySnapshot>, MemoryError>;

    async fn save(&self, snapshot: &MemorySnapshot) -> std::result::Result<(), MemoryError>;

    /// Returns whether a snapshot existed.
    async fn delete(&self, id: &ConversationId) -> std::result::Result<bool, MemoryError>;
}
