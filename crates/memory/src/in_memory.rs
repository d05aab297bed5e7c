//! In-memory snapshot store: useful for testing and single-process deployments.

use async_trait::async_trait;
use marlin_core::{ConversationId, MemoryError, MemorySnapshot, SnapshotStore};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<ConversationId, MemorySnapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn load(&self, id: &ConversationId) -> Result<Option<MemorySnapshot>, MemoryError> {
        Ok(self.snapshots.read().await.get(id).cloned())
    }

    async fn save(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.conversation_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, MemoryError> {
        Ok(self.snapshots.write().await.remove(id).is_some())
    }
}
