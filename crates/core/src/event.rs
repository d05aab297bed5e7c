//! Domain event system: decoupled observation of the agent runtime.
//!
//! Events are published when a turn starts or ends, when a completion is
//! requested, when a tool runs, and when admission is denied. Subscribers
//! (logging sinks, dashboards, tests) observe without coupling to the loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    TurnStarted {
        conversation_id: String,
        timestamp: DateTime<Utc>,
    },

    CompletionRequested {
        conversation_id: String,
        iteration: usize,
        tools_offered: usize,
        timestamp: DateTime<Utc>,
    },

    /// A tool call finished (after retries and fallback)
    ToolExecuted {
        tool_name: String,
        success: bool,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Admission was denied for a rate-limited resource
    RateLimited {
        key: String,
        retry_after_ms: u64,
        timestamp: DateTime<Utc>,
    },

    TurnFinished {
        conversation_id: String,
        outcome: String,
        iterations: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
