//! Token estimation.
//!
//! Memory never tokenizes; it asks a [`TokenEstimator`] for a size. The
//! default is a character heuristic (~4 characters per token), within about
//! 10% of BPE tokenizers on English text.

use marlin_core::message::Message;

/// Pluggable message-size estimate.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, message: &Message) -> usize;
}

impl<F> TokenEstimator for F
where
    F: Fn(&Message) -> usize + Send + Sync,
{
    fn estimate(&self, message: &Message) -> usize {
        self(message)
    }
}

/// Estimate the token count for a string. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Characters-per-token heuristic with a fixed per-message overhead for
/// role names and wire delimiters.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    pub per_message_overhead: usize,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self {
            per_message_overhead: 4,
        }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, message: &Message) -> usize {
        let calls: usize = message
            .tool_calls
            .iter()
            .map(|c| estimate_tokens(&c.id) + estimate_tokens(&c.name) + estimate_tokens(&c.raw_arguments))
            .sum();
        self.per_message_overhead + estimate_tokens(message.text()) + calls
    }
}
