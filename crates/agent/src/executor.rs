//! Tool execution with timeout, retry and alternatives.
//!
//! A batch of tool calls is dispatched concurrently, bounded by
//! [`ExecutionPolicy::max_parallel`]. Each call runs under its own timeout
//! and is retried with linear backoff while it fails transiently. When the
//! retries are exhausted, a designated alternative tool gets one attempt.
//! Whatever happens, every call yields exactly one [`ToolResult`], and the
//! results come back in call order.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use marlin_config::ExecutorConfig;
use marlin_core::error::{ErrorKind, ToolError};
use marlin_core::event::{DomainEvent, EventBus};
use marlin_core::tool::{Tool, ToolCallRequest, ToolRegistry, ToolResult};
use marlin_ratelimit::{DenialPolicy, RateLimitError, RateLimiter};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::stats::ToolStatsRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Per-attempt timeout
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Attempt `n` is followed by a sleep of `n * backoff_step`
    pub backoff_step: Duration,
    pub max_parallel: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
            max_parallel: 4,
        }
    }
}

impl From<&ExecutorConfig> for ExecutionPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_attempts: config.max_attempts,
            backoff_step: Duration::from_secs(config.backoff_secs),
            max_parallel: config.max_parallel,
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    stats: Arc<ToolStatsRegistry>,
    policy: ExecutionPolicy,
    rate_limiter: Option<Arc<RateLimiter>>,
    event_bus: Option<Arc<EventBus>>,
}

/// How a single tool ran, before it is turned into a result.
struct Run {
    outcome: Result<ToolResult, ToolError>,
    attempts: u32,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, stats: Arc<ToolStatsRegistry>) -> Self {
        Self {
            registry,
            stats,
            policy: ExecutionPolicy::default(),
            rate_limiter: None,
            event_bus: None,
        }
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Gate every tool invocation on the `tool:{name}` bucket.
    ///
    /// Admission waits up to the per-call timeout; a denial becomes an
    /// error result without running the tool.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<ToolStatsRegistry> {
        &self.stats
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Execute a batch. `results[i]` answers `calls[i]`.
    pub async fn execute(&self, calls: &[ToolCallRequest]) -> Vec<ToolResult> {
        if calls.is_empty() {
            return Vec::new();
        }
        let parallel = calls.len().min(self.policy.max_parallel.max(1));
        debug!(batch = calls.len(), parallel, "Dispatching tool batch");

        let pending: Vec<_> = calls.iter().map(|call| self.execute_one(call)).collect();
        stream::iter(pending)
            .buffered(parallel)
            .collect()
            .await
    }

    /// Execute one call. Never fails; errors become error results.
    pub async fn execute_one(&self, call: &ToolCallRequest) -> ToolResult {
        let started = Instant::now();

        let arguments = match call.parse_arguments() {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, error = %e, "Malformed tool call");
                return error_result(&e, ErrorKind::MalformedToolCall).with_metadata("tool", call.name.clone());
            }
        };

        let tool = match self.registry.get(&call.name) {
            Ok(tool) => tool,
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, "Model requested an unknown tool");
                return error_result(&e, ErrorKind::ToolExecution).with_metadata("tool", call.name.clone());
            }
        };

        if let Err(e) = self.admit(tool.name()).await {
            return error_result(&e, ErrorKind::RateLimited).with_metadata("tool", call.name.clone());
        }

        let primary = self.run_with_retry(&tool, &arguments).await;
        let mut attempts = primary.attempts;
        let mut used = tool.name().to_string();
        let mut alternative_for = None;

        let outcome = match primary.outcome {
            Err(e) if e.is_transient() => {
                self.stats.record(tool.name(), false);
                match self.registry.alternative_for(tool.name()) {
                    Some(alternative) => {
                        info!(
                            tool = %tool.name(),
                            alternative = %alternative.name(),
                            error = %e,
                            "Retries exhausted, trying alternative tool"
                        );
                        let adapted = adapt_arguments(&arguments, &alternative.parameters_schema());
                        let outcome = self.attempt(&alternative, adapted).await;
                        self.stats.record(alternative.name(), succeeded(&outcome));
                        attempts += 1;
                        alternative_for = Some(tool.name().to_string());
                        used = alternative.name().to_string();
                        outcome.map_err(|alt| ToolError::ExecutionFailed {
                            tool_name: tool.name().to_string(),
                            reason: format!("{e}; alternative '{}' failed: {alt}", alternative.name()),
                        })
                    }
                    None => Err(e),
                }
            }
            other => {
                self.stats.record(tool.name(), succeeded(&other));
                other
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %call.name, call_id = %call.id, attempts, error = %e, "Tool call failed");
                error_result(&e, ErrorKind::ToolExecution)
            }
        };

        info!(
            tool = %used,
            call_id = %call.id,
            success = result.is_success(),
            attempts,
            duration_ms,
            "Tool call finished"
        );

        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::ToolExecuted {
                tool_name: call.name.clone(),
                success: result.is_success(),
                attempts,
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        let mut result = result
            .with_metadata("tool", used)
            .with_metadata("attempts", attempts)
            .with_metadata("duration_ms", duration_ms);
        if let Some(primary) = alternative_for {
            result = result.with_metadata("alternative_for", primary);
        }
        result
    }

    async fn admit(&self, tool_name: &str) -> Result<(), ToolError> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        let key = format!("tool:{tool_name}");
        let policy = DenialPolicy::Wait {
            max_wait: self.policy.timeout,
        };
        match limiter.acquire(&key, 1, policy).await {
            Ok(()) => Ok(()),
            Err(RateLimitError::Exceeded { retry_after, .. }) => {
                let retry_after_ms = retry_after.as_millis() as u64;
                warn!(tool = %tool_name, retry_after_ms, "Tool rate limit exceeded");
                if let Some(bus) = &self.event_bus {
                    bus.publish(DomainEvent::RateLimited {
                        key,
                        retry_after_ms,
                        timestamp: Utc::now(),
                    });
                }
                Err(ToolError::RateLimited {
                    tool_name: tool_name.to_string(),
                    retry_after_ms,
                })
            }
            // A broken limiter store should not block tools
            Err(RateLimitError::Store(reason)) => {
                warn!(tool = %tool_name, reason = %reason, "Rate limit store failed, admitting");
                Ok(())
            }
        }
    }

    async fn run_with_retry(&self, tool: &Arc<dyn Tool>, arguments: &Value) -> Run {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.attempt(tool, arguments.clone()).await;
            match outcome {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.policy.backoff_step * attempt;
                    warn!(
                        tool = %tool.name(),
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Tool attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                outcome => {
                    return Run {
                        outcome,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn attempt(&self, tool: &Arc<dyn Tool>, arguments: Value) -> Result<ToolResult, ToolError> {
        match tokio::time::timeout(self.policy.timeout, tool.execute(arguments)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolError::Timeout {
                tool_name: tool.name().to_string(),
                timeout_ms: self.policy.timeout.as_millis() as u64,
            }),
        }
    }
}

fn succeeded(outcome: &Result<ToolResult, ToolError>) -> bool {
    matches!(outcome, Ok(result) if result.is_success())
}

fn error_result(error: &ToolError, kind: ErrorKind) -> ToolResult {
    ToolResult::failure(error.to_string()).with_metadata("error_kind", kind.as_str())
}

/// Map arguments meant for one tool onto an alternative's schema.
///
/// Arguments the alternative knows are kept. Each required string
/// property that is missing is filled with the primary's scalar argument
/// values joined by spaces, so `{"symbol": "BTC", "days_ago": 180}` can
/// become a search query `"BTC 180"`.
fn adapt_arguments(arguments: &Value, schema: &Value) -> Value {
    let mut adapted = arguments.as_object().cloned().unwrap_or_default();
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Value::Object(adapted);
    };

    let joined = arguments
        .as_object()
        .map(|args| {
            args.values()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();

    for field in required.iter().filter_map(Value::as_str) {
        let is_string = schema
            .pointer(&format!("/properties/{field}/type"))
            .and_then(Value::as_str)
            == Some("string");
        if is_string && !adapted.contains_key(field) && !joined.is_empty() {
            adapted.insert(field.to_string(), Value::String(joined.clone()));
        }
    }
    Value::Object(adapted)
}
