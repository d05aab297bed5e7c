//! Conversation sessions: the public face of the agent.
//!
//! [`Agent::submit`] runs one turn in the background and hands back the
//! event stream. Each conversation owns one [`ConversationMemory`]; a
//! second submit while a turn is in flight is rejected with
//! [`Error::ConversationBusy`]. When a [`SnapshotStore`] is configured,
//! history is loaded before the first turn of a conversation and saved
//! after every turn.
//!
//! Conversations left idle longer than the configured timeout are dropped
//! from the agent the next time a conversation is looked up; a store
//! brings them back on their next turn.

use marlin_config::{AppConfig, RateLimitPolicy};
use marlin_core::error::Error;
use marlin_core::event::EventBus;
use marlin_core::message::{ConversationId, Message};
use marlin_core::provider::Provider;
use marlin_core::snapshot::SnapshotStore;
use marlin_core::tool::ToolRegistry;
use marlin_memory::ConversationMemory;
use marlin_ratelimit::{BucketConfig, DenialPolicy, RateLimiter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::completion::CompletionClient;
use crate::executor::{ExecutionPolicy, ToolExecutor};
use crate::loop_runner::{AgentLoop, COMPLETION_KEY, TurnOutcome};
use crate::stats::ToolStatsRegistry;
use crate::stream_event::AgentEvent;

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Slot {
    memory: ConversationMemory,
    /// Whether the snapshot store has been consulted yet
    loaded: bool,
    last_used: Instant,
}

type SharedSlot = Arc<tokio::sync::Mutex<Slot>>;

pub struct Agent {
    inner: Arc<AgentLoop>,
    conversations: Mutex<HashMap<ConversationId, SharedSlot>>,
    token_budget: usize,
    system_prompt: String,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    event_bus: Arc<EventBus>,
    idle_timeout: Option<Duration>,
}

impl Agent {
    pub fn new(inner: AgentLoop, token_budget: usize, system_prompt: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(inner),
            conversations: Mutex::new(HashMap::new()),
            token_budget,
            system_prompt: system_prompt.into(),
            snapshots: None,
            event_bus: Arc::new(EventBus::default()),
            idle_timeout: None,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Forget conversations that have had no turn for `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Share an event bus with the loop and executor this agent was built from.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    /// Wire every collaborator from configuration.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        registry: ToolRegistry,
        snapshots: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        let bus = Arc::new(EventBus::default());
        let limits = &config.rate_limit;
        let completion_bucket = BucketConfig::per_window(
            limits.completion_limit,
            Duration::from_secs(limits.completion_window_secs),
        );
        let tool_bucket = limits
            .tool_limit
            .map(|limit| BucketConfig::per_window(limit, Duration::from_secs(limits.tool_window_secs)));
        let limiter = Arc::new(
            RateLimiter::new(tool_bucket.unwrap_or(completion_bucket)).with_bucket(COMPLETION_KEY, completion_bucket),
        );

        let mut executor = ToolExecutor::new(Arc::new(registry), Arc::new(ToolStatsRegistry::new()))
            .with_policy(ExecutionPolicy::from(&config.executor))
            .with_event_bus(bus.clone());
        if tool_bucket.is_some() {
            executor = executor.with_rate_limiter(limiter.clone());
        }

        let completion = CompletionClient::new(provider, config.provider.model.clone())
            .with_temperature(config.provider.temperature)
            .with_max_tokens(config.provider.max_tokens)
            .with_transport_retries(config.provider.transport_retries);

        let denial_policy = match config.agent.rate_limit_policy {
            RateLimitPolicy::FailFast => DenialPolicy::FailFast,
            RateLimitPolicy::Wait => DenialPolicy::Wait {
                max_wait: Duration::from_secs(config.agent.max_rate_limit_wait_secs),
            },
        };

        let inner = AgentLoop::new(completion, executor, limiter)
            .with_max_consecutive_tool_calls(config.agent.max_consecutive_tool_calls)
            .with_top_k(config.agent.top_k_tools)
            .with_denial_policy(denial_policy)
            .with_event_bus(bus.clone());

        let mut agent = Self::new(inner, config.memory.token_budget, config.agent.system_prompt.clone())
            .with_event_bus(bus);
        if let Some(store) = snapshots {
            agent = agent.with_snapshot_store(store);
        }
        if config.memory.snapshot_ttl_secs > 0 {
            agent = agent.with_idle_timeout(Duration::from_secs(config.memory.snapshot_ttl_secs));
        }
        agent
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn agent_loop(&self) -> &AgentLoop {
        &self.inner
    }

    /// Start a turn. The returned stream ends with `Done` or `Error`.
    ///
    /// Dropping the receiver cancels the turn. Must be called from within
    /// a tokio runtime.
    pub fn submit(
        &self,
        conversation_id: ConversationId,
        user_text: impl Into<String>,
    ) -> Result<mpsc::Receiver<AgentEvent>, Error> {
        let slot = self.slot(&conversation_id)?;
        let guard = slot
            .try_lock_owned()
            .map_err(|_| Error::ConversationBusy(conversation_id.to_string()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = self.inner.clone();
        let snapshots = self.snapshots.clone();
        let user_text = user_text.into();

        tokio::spawn(async move {
            let mut slot = guard;
            if let Some(store) = &snapshots {
                if !slot.loaded {
                    load_history(store.as_ref(), &mut slot.memory).await;
                    slot.loaded = true;
                }
            }

            let outcome = inner.run_turn(&mut slot.memory, &user_text, &tx).await;
            if outcome == TurnOutcome::Cancelled {
                info!(conversation_id = %slot.memory.id(), "Turn cancelled by caller");
            }

            if let Some(store) = &snapshots {
                let snapshot = slot.memory.snapshot();
                match store.save(&snapshot).await {
                    Ok(()) => debug!(conversation_id = %snapshot.conversation_id, "Snapshot saved"),
                    Err(e) => warn!(conversation_id = %snapshot.conversation_id, error = %e, "Snapshot save failed"),
                }
            }

            slot.last_used = Instant::now();
            // Unlock before the stream closes so a drained caller can resubmit.
            drop(slot);
            drop(tx);
        });

        Ok(rx)
    }

    /// Current message window of a conversation, waiting for any turn in
    /// flight. `None` for conversations this agent has not seen.
    pub async fn window(&self, conversation_id: &ConversationId) -> Option<Vec<Message>> {
        let slot = {
            let conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
            conversations.get(conversation_id).cloned()
        }?;
        let slot = slot.lock().await;
        Some(slot.memory.window())
    }

    /// Whether a turn is running for this conversation.
    pub fn is_busy(&self, conversation_id: &ConversationId) -> bool {
        let conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        conversations
            .get(conversation_id)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Drop a conversation's in-process state. Saved snapshots are kept.
    ///
    /// Returns `false` for conversations this agent does not hold, and
    /// [`Error::ConversationBusy`] while a turn is running.
    pub fn close(&self, conversation_id: &ConversationId) -> Result<bool, Error> {
        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = conversations.get(conversation_id) else {
            return Ok(false);
        };
        if slot.try_lock().is_err() {
            return Err(Error::ConversationBusy(conversation_id.to_string()));
        }
        conversations.remove(conversation_id);
        debug!(conversation_id = %conversation_id, "Conversation closed");
        Ok(true)
    }

    /// Number of conversations held in memory.
    pub fn conversation_count(&self) -> usize {
        self.conversations.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn slot(&self, conversation_id: &ConversationId) -> Result<SharedSlot, Error> {
        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timeout) = self.idle_timeout {
            evict_idle(&mut conversations, timeout);
        }
        if let Some(slot) = conversations.get(conversation_id) {
            return Ok(slot.clone());
        }

        let memory = ConversationMemory::new(conversation_id.clone(), self.token_budget)
            .with_system_prompt(self.system_prompt.clone())?;
        let slot = Arc::new(tokio::sync::Mutex::new(Slot {
            memory,
            loaded: self.snapshots.is_none(),
            last_used: Instant::now(),
        }));
        conversations.insert(conversation_id.clone(), slot.clone());
        debug!(conversation_id = %conversation_id, "Conversation created");
        Ok(slot)
    }
}

/// Remove conversations idle for longer than `timeout`. Busy ones stay.
fn evict_idle(conversations: &mut HashMap<ConversationId, SharedSlot>, timeout: Duration) {
    let before = conversations.len();
    conversations.retain(|_, slot| match slot.try_lock() {
        Ok(slot) => slot.last_used.elapsed() <= timeout,
        Err(_) => true,
    });
    let evicted = before - conversations.len();
    if evicted > 0 {
        info!(evicted, remaining = conversations.len(), "Idle conversations evicted");
    }
}

async fn load_history(store: &dyn SnapshotStore, memory: &mut ConversationMemory) {
    match store.load(memory.id()).await {
        Ok(Some(snapshot)) => {
            memory.restore(&snapshot);
            info!(
                conversation_id = %memory.id(),
                messages = snapshot.messages.len(),
                store = store.name(),
                "Conversation history loaded"
            );
        }
        Ok(None) => {}
        Err(e) => warn!(conversation_id = %memory.id(), error = %e, "Snapshot load failed, starting fresh"),
    }
}
