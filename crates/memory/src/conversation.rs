//! Token-budgeted conversation log.
//!
//! Invariants:
//! - messages are only ever appended; order is never changed
//! - the initial system message is never trimmed
//! - trimming removes whole units, oldest first, where a unit is a single
//!   message or an assistant tool-call message together with its results
//! - after every append the estimated total is within the budget

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use marlin_core::{ConversationId, MemoryError, MemorySnapshot, Message, Role};
use tracing::{debug, warn};

use crate::estimator::{CharRatioEstimator, TokenEstimator};

const TRUNCATION_MARKER: &str = "…[truncated]";

struct Entry {
    message: Message,
    tokens: usize,
}

pub struct ConversationMemory {
    id: ConversationId,
    budget: usize,
    estimator: Arc<dyn TokenEstimator>,
    system: Option<Entry>,
    entries: VecDeque<Entry>,
    /// Tokens held by `entries` (the system message is counted separately)
    used: usize,
    trimmed: usize,
}

impl ConversationMemory {
    pub fn new(id: ConversationId, budget: usize) -> Self {
        Self {
            id,
            budget,
            estimator: Arc::new(CharRatioEstimator::default()),
            system: None,
            entries: VecDeque::new(),
            used: 0,
            trimmed: 0,
        }
    }

    /// Swap the estimator, re-measuring everything already held.
    ///
    /// Fails with [`MemoryError::BudgetTooSmall`] when the system message
    /// no longer fits the budget under the new estimate.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Result<Self, MemoryError> {
        self.estimator = estimator;
        if let Some(system) = self.system.as_mut() {
            system.tokens = self.estimator.estimate(&system.message);
            if system.tokens > self.budget {
                return Err(MemoryError::BudgetTooSmall {
                    budget: self.budget,
                    required: system.tokens,
                });
            }
        }
        for entry in self.entries.iter_mut() {
            entry.tokens = self.estimator.estimate(&entry.message);
        }
        self.used = self.entries.iter().map(|e| e.tokens).sum();
        self.trim();
        Ok(self)
    }

    /// Set the system message that heads every window.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Result<Self, MemoryError> {
        let message = Message::system(prompt);
        let tokens = self.estimator.estimate(&message);
        if tokens > self.budget {
            return Err(MemoryError::BudgetTooSmall {
                budget: self.budget,
                required: tokens,
            });
        }
        self.system = Some(Entry { message, tokens });
        self.trim();
        Ok(self)
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Append one message, trimming older history as needed.
    pub fn append(&mut self, message: Message) -> Result<(), MemoryError> {
        self.append_all(vec![message])
    }

    /// Append messages as one unit.
    ///
    /// The batch is never trimmed against itself: older history goes first,
    /// and if the batch alone still exceeds the budget its message contents
    /// are truncated before they are stored. A batch whose structure alone
    /// (roles, tool-call ids and arguments) cannot fit is rejected with
    /// [`MemoryError::BatchTooLarge`] and memory is left untouched.
    pub fn append_all(&mut self, messages: Vec<Message>) -> Result<(), MemoryError> {
        if messages.is_empty() {
            return Ok(());
        }
        let available = self.budget.saturating_sub(self.system_tokens());
        let required: usize = messages.iter().map(|m| self.structure_tokens(m)).sum();
        if required > available {
            warn!(
                conversation_id = %self.id,
                required,
                available,
                "Memory budget cannot hold the structure of this batch"
            );
            return Err(MemoryError::BatchTooLarge { required, available });
        }

        let mut batch: Vec<Entry> = messages
            .into_iter()
            .map(|message| {
                let tokens = self.estimator.estimate(&message);
                Entry { message, tokens }
            })
            .collect();
        let incoming: usize = batch.iter().map(|e| e.tokens).sum();

        self.trim_for(incoming);

        if self.used + incoming > available {
            warn!(
                conversation_id = %self.id,
                incoming,
                available,
                "Message batch exceeds the memory budget on its own, truncating"
            );
            self.fit_batch(&mut batch, available.saturating_sub(self.used));
        }

        for entry in batch {
            self.used += entry.tokens;
            self.entries.push_back(entry);
        }
        Ok(())
    }

    /// Drop oldest units until the log fits the budget.
    pub fn trim(&mut self) {
        self.trim_for(0);
    }

    /// The messages to present to the provider, system message first.
    pub fn window(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.system
            .iter()
            .map(|e| &e.message)
            .chain(self.entries.iter().map(|e| &e.message))
    }

    pub fn estimated_tokens(&self) -> usize {
        self.system_tokens() + self.used
    }

    pub fn len(&self) -> usize {
        self.entries.len() + usize::from(self.system.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages removed by trimming over this memory's lifetime.
    pub fn trimmed_count(&self) -> usize {
        self.trimmed
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.message.role == Role::User)
            .map(|e| e.message.text())
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot::new(self.id.clone(), self.window())
    }

    /// Replace the history with a snapshot's.
    ///
    /// The configured system prompt stays; system messages inside the
    /// snapshot are dropped. History is re-appended unit by unit, so an
    /// old snapshot larger than the current budget is trimmed as usual.
    pub fn restore(&mut self, snapshot: &MemorySnapshot) {
        self.entries.clear();
        self.used = 0;
        let history = snapshot
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned();
        for unit in group_units(history) {
            if let Err(e) = self.append_all(unit) {
                warn!(conversation_id = %self.id, error = %e, "Skipping snapshot unit that cannot fit");
            }
        }
        debug!(
            conversation_id = %self.id,
            restored = self.entries.len(),
            "Conversation memory restored from snapshot"
        );
    }

    /// Estimate of a message with its content emptied.
    fn structure_tokens(&self, message: &Message) -> usize {
        let mut bare = message.clone();
        if bare.content.is_some() {
            bare.content = Some(String::new());
        }
        self.estimator.estimate(&bare)
    }

    fn system_tokens(&self) -> usize {
        self.system.as_ref().map_or(0, |e| e.tokens)
    }

    fn trim_for(&mut self, incoming: usize) {
        let mut removed = 0;
        while !self.entries.is_empty() && self.system_tokens() + self.used + incoming > self.budget {
            removed += self.pop_oldest_unit();
        }
        if removed > 0 {
            self.trimmed += removed;
            debug!(
                conversation_id = %self.id,
                removed,
                tokens = self.estimated_tokens(),
                budget = self.budget,
                "Trimmed conversation memory"
            );
        }
    }

    fn pop_oldest_unit(&mut self) -> usize {
        let Some(head) = self.entries.pop_front() else {
            return 0;
        };
        self.used -= head.tokens;
        let mut removed = 1;

        if head.message.has_tool_calls() {
            let ids: HashSet<&str> = head.message.tool_calls.iter().map(|c| c.id.as_str()).collect();
            while self.entries.front().is_some_and(|next| answers(&next.message, &ids)) {
                if let Some(result) = self.entries.pop_front() {
                    self.used -= result.tokens;
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Shrink message contents so the batch totals at most `available`.
    ///
    /// Structure (roles, tool-call ids and arguments) is never cut; the
    /// content budget left after structure is shared out smallest first so
    /// short messages keep their full text.
    fn fit_batch(&self, batch: &mut [Entry], available: usize) {
        let fixed: Vec<usize> = batch.iter().map(|e| self.structure_tokens(&e.message)).collect();
        let fixed_sum: usize = fixed.iter().sum();

        let mut remaining = available.saturating_sub(fixed_sum);
        let mut order: Vec<usize> = (0..batch.len()).collect();
        order.sort_by_key(|&i| batch[i].tokens.saturating_sub(fixed[i]));
        let mut left = order.len();

        for i in order {
            let share = remaining / left;
            if batch[i].tokens.saturating_sub(fixed[i]) > share {
                self.truncate_to(&mut batch[i], fixed[i] + share);
            }
            remaining = remaining.saturating_sub(batch[i].tokens.saturating_sub(fixed[i]));
            left -= 1;
        }
    }

    /// Longest content prefix (plus marker) whose estimate fits `limit`.
    fn truncate_to(&self, entry: &mut Entry, limit: usize) {
        let original = entry.message.text().to_string();
        let boundaries: Vec<usize> = original
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(original.len()))
            .collect();

        let mut candidate = entry.message.clone();
        let mut best = None;
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            candidate.content = Some(format!("{}{TRUNCATION_MARKER}", &original[..boundaries[mid]]));
            if self.estimator.estimate(&candidate) <= limit {
                best = Some(mid);
                lo = mid + 1;
            } else if mid == 0 {
                break;
            } else {
                hi = mid - 1;
            }
        }

        candidate.content = Some(match best {
            Some(k) => format!("{}{TRUNCATION_MARKER}", &original[..boundaries[k]]),
            None => String::new(),
        });
        entry.tokens = self.estimator.estimate(&candidate);
        entry.message = candidate;
    }
}

fn answers(message: &Message, call_ids: &HashSet<&str>) -> bool {
    message.role == Role::Tool
        && message
            .tool_call_id
            .as_deref()
            .is_some_and(|id| call_ids.contains(id))
}

/// Split a history into trimming units.
fn group_units(messages: impl IntoIterator<Item = Message>) -> Vec<Vec<Message>> {
    let mut units: Vec<Vec<Message>> = Vec::new();
    for message in messages {
        let joins_current = units.last().is_some_and(|unit| {
            let ids: HashSet<&str> = unit[0].tool_calls.iter().map(|c| c.id.as_str()).collect();
            answers(&message, &ids)
        });
        match units.last_mut() {
            Some(unit) if joins_current => unit.push(message),
            _ => units.push(vec![message]),
        }
    }
    units
}
