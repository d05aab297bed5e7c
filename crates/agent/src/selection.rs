//! Tool-subset selection.
//!
//! Only the top-K tools are offered to the provider per completion call.
//! Tools are ranked by how many of their capability keywords appear in the
//! latest user message, then by success rate (higher first), then by usage
//! (lower first), then by name.

use marlin_core::provider::ToolDefinition;
use marlin_core::tool::ToolRegistry;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::stats::ToolStatsRegistry;

#[derive(Debug, Clone, Copy)]
pub struct ToolSelector {
    top_k: usize,
}

struct Candidate {
    name: String,
    score: usize,
    success_rate: f64,
    usage_count: u64,
}

impl ToolSelector {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Names of the selected tools, best first.
    pub fn rank(&self, registry: &ToolRegistry, stats: &ToolStatsRegistry, user_text: Option<&str>) -> Vec<String> {
        let words = keywords(user_text.unwrap_or_default());

        let mut candidates: Vec<Candidate> = registry
            .tools()
            .map(|tool| {
                let capabilities: HashSet<String> = tool.capabilities().into_iter().collect();
                let stats = stats.get(tool.name());
                Candidate {
                    name: tool.name().to_string(),
                    score: capabilities.iter().filter(|c| words.contains(c.as_str())).count(),
                    success_rate: stats.success_rate(),
                    usage_count: stats.usage_count,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.success_rate.partial_cmp(&a.success_rate).unwrap_or(Ordering::Equal))
                .then_with(|| a.usage_count.cmp(&b.usage_count))
                .then_with(|| a.name.cmp(&b.name))
        });

        candidates.into_iter().take(self.top_k).map(|c| c.name).collect()
    }

    /// Schemas of the selected tools, best first.
    pub fn select(
        &self,
        registry: &ToolRegistry,
        stats: &ToolStatsRegistry,
        user_text: Option<&str>,
    ) -> Vec<ToolDefinition> {
        let names = self.rank(registry, stats, user_text);
        registry.list_schemas(Some(&names))
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}
