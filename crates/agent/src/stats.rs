//! Per-tool execution statistics.
//!
//! Shared by every conversation for the lifetime of the process. The
//! executor records one outcome per call; selection reads them to order
//! tools that match a request equally well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub usage_count: u64,
    pub success_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ToolStats {
    /// Fraction of executions that succeeded.
    ///
    /// A tool that has never run gets 1.0 so it is not ranked below
    /// tools with a failure history.
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.usage_count as f64
    }

    fn record(&mut self, success: bool, at: DateTime<Utc>) {
        self.usage_count += 1;
        if success {
            self.success_count += 1;
        }
        self.last_used_at = Some(at);
    }
}

#[derive(Default)]
pub struct ToolStatsRegistry {
    stats: Mutex<HashMap<String, ToolStats>>,
}

impl ToolStatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tool_name: &str, success: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats
            .entry(tool_name.to_string())
            .or_default()
            .record(success, Utc::now());
    }

    /// Stats for one tool; all zero if it never ran.
    pub fn get(&self, tool_name: &str) -> ToolStats {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.get(tool_name).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ToolStats> {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
