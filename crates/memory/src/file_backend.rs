//! File-based snapshot store: one JSON document per conversation.
//!
//! Storage location defaults to `~/.marlin/conversations/<id>.json`. Writes
//! go to a temporary file first and are renamed into place, so a crash
//! never leaves a half-written snapshot behind.

use async_trait::async_trait;
use chrono::Utc;
use marlin_core::{ConversationId, MemoryError, MemorySnapshot, SnapshotStore};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub struct FileSnapshotStore {
    dir: PathBuf,
    ttl: Option<Duration>,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl: None,
        }
    }

    /// Treat snapshots older than `ttl` as absent. A zero TTL disables expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Percent-encodes every byte outside `[A-Za-z0-9_-]`, so distinct ids
    /// never share a file and none can escape `dir`.
    fn path_for(&self, id: &ConversationId) -> PathBuf {
        let mut name = String::with_capacity(id.as_str().len() + 5);
        for byte in id.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("%{byte:02X}"));
            }
        }
        name.push_str(".json");
        self.dir.join(name)
    }

    fn is_expired(&self, snapshot: &MemorySnapshot) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let age = Utc::now().signed_duration_since(snapshot.saved_at);
        age.to_std().is_ok_and(|age| age > ttl)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, id: &ConversationId) -> Result<Option<MemorySnapshot>, MemoryError> {
        let path = self.path_for(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MemoryError::Storage(format!(
                    "Failed to read snapshot {}: {e}",
                    path.display()
                )));
            }
        };

        let snapshot: MemorySnapshot = match serde_json::from_str(&content) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping corrupted conversation snapshot");
                return Ok(None);
            }
        };

        if self.is_expired(&snapshot) {
            debug!(conversation_id = %id, "Conversation snapshot expired");
            self.delete(id).await?;
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &MemorySnapshot) -> Result<(), MemoryError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            MemoryError::Storage(format!("Failed to create snapshot directory: {e}"))
        })?;

        let path = self.path_for(&snapshot.conversation_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize snapshot: {e}")))?;

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to write snapshot: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to move snapshot into place: {e}")))?;

        debug!(
            conversation_id = %snapshot.conversation_id,
            messages = snapshot.messages.len(),
            "Conversation snapshot saved"
        );
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, MemoryError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoryError::Storage(format!("Failed to delete snapshot: {e}"))),
        }
    }
}
