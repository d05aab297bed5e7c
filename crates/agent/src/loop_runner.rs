//! The agent turn loop.
//!
//! One turn runs as an explicit state machine:
//!
//! ```text
//! AwaitingCompletion ─▶ Streaming ─┬─▶ Terminal(Answered | Failed)
//!         ▲                        └─▶ HandlingTools ─┐
//!         └───────────────────────────────────────────┘
//! AwaitingCompletion ─▶ Terminal(DepthExceeded)   (iteration bound reached)
//! ```
//!
//! Each iteration is one completion call, optionally followed by one tool
//! batch. Every suspension point also watches the event channel; when the
//! caller drops its receiver the turn stops as `Cancelled`. Memory is
//! changed only at message granularity: a tool batch's assistant message
//! and all of its results are appended together, or not at all.

use chrono::Utc;
use marlin_core::error::ErrorKind;
use marlin_core::event::{DomainEvent, EventBus};
use marlin_core::message::{ConversationId, Message};
use marlin_core::provider::Usage;
use marlin_core::tool::ToolCallRequest;
use marlin_memory::ConversationMemory;
use marlin_ratelimit::{DenialPolicy, RateLimitError, RateLimiter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::completion::{CompletionClient, CompletionEvent, CompletionStream};
use crate::executor::ToolExecutor;
use crate::selection::ToolSelector;
use crate::stream_event::AgentEvent;

/// Rate-limit bucket key for completion calls.
pub const COMPLETION_KEY: &str = "completion";

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Answered,
    Failed(ErrorKind),
    DepthExceeded,
    /// The caller stopped listening
    Cancelled,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Answered => "answered",
            TurnOutcome::Failed(_) => "failed",
            TurnOutcome::DepthExceeded => "depth_exceeded",
            TurnOutcome::Cancelled => "cancelled",
        }
    }
}

enum LoopState<'a> {
    AwaitingCompletion,
    Streaming(CompletionStream<'a>),
    HandlingTools {
        calls: Vec<ToolCallRequest>,
        content: String,
    },
    Terminal(TurnOutcome),
}

/// Per-turn counters.
#[derive(Debug, Default)]
struct Turn {
    iterations: usize,
    tool_calls_made: usize,
    usage: Option<Usage>,
}

impl Turn {
    fn add_usage(&mut self, usage: Option<Usage>) {
        let Some(usage) = usage else { return };
        let total = self.usage.get_or_insert_with(Usage::default);
        total.prompt_tokens += usage.prompt_tokens;
        total.completion_tokens += usage.completion_tokens;
        total.total_tokens += usage.total_tokens;
    }
}

/// The core agent loop that orchestrates completions and tool execution.
pub struct AgentLoop {
    completion: CompletionClient,
    executor: ToolExecutor,
    rate_limiter: Arc<RateLimiter>,
    selector: ToolSelector,
    denial_policy: DenialPolicy,
    max_consecutive_tool_calls: usize,
    event_bus: Option<Arc<EventBus>>,
}

impl AgentLoop {
    pub fn new(completion: CompletionClient, executor: ToolExecutor, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            completion,
            executor,
            rate_limiter,
            selector: ToolSelector::new(4),
            denial_policy: DenialPolicy::Wait {
                max_wait: Duration::from_secs(30),
            },
            max_consecutive_tool_calls: 10,
            event_bus: None,
        }
    }

    /// Bound on completion iterations per turn.
    pub fn with_max_consecutive_tool_calls(mut self, max: usize) -> Self {
        self.max_consecutive_tool_calls = max;
        self
    }

    /// Number of tool schemas offered per completion call.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.selector = ToolSelector::new(top_k);
        self
    }

    /// What to do when the completion bucket is empty.
    pub fn with_denial_policy(mut self, policy: DenialPolicy) -> Self {
        self.denial_policy = policy;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    pub fn max_consecutive_tool_calls(&self) -> usize {
        self.max_consecutive_tool_calls
    }

    /// Run one user turn against `memory`, reporting through `events`.
    ///
    /// Unless the turn is cancelled, the last event sent is either
    /// `Done` or `Error`.
    pub async fn run_turn(
        &self,
        memory: &mut ConversationMemory,
        user_text: &str,
        events: &mpsc::Sender<AgentEvent>,
    ) -> TurnOutcome {
        let conversation_id = memory.id().clone();
        info!(conversation_id = %conversation_id, "Turn started");
        self.publish(DomainEvent::TurnStarted {
            conversation_id: conversation_id.to_string(),
            timestamp: Utc::now(),
        });

        let mut turn = Turn::default();
        let mut state = match memory.append(Message::user(user_text)) {
            Ok(()) => LoopState::AwaitingCompletion,
            Err(e) => {
                self.terminate(
                    memory,
                    events,
                    ErrorKind::Internal,
                    e.to_string(),
                    TurnOutcome::Failed(ErrorKind::Internal),
                )
                .await
            }
        };
        let outcome = loop {
            state = match state {
                LoopState::AwaitingCompletion => self.request_completion(memory, events, &mut turn).await,
                LoopState::Streaming(stream) => {
                    self.consume_stream(stream, &conversation_id, memory, events, &mut turn)
                        .await
                }
                LoopState::HandlingTools { calls, content } => {
                    self.handle_tools(calls, content, memory, events, &mut turn).await
                }
                LoopState::Terminal(outcome) => break outcome,
            };
        };

        info!(
            conversation_id = %conversation_id,
            outcome = outcome.as_str(),
            iterations = turn.iterations,
            tool_calls = turn.tool_calls_made,
            "Turn finished"
        );
        self.publish(DomainEvent::TurnFinished {
            conversation_id: conversation_id.to_string(),
            outcome: outcome.as_str().to_string(),
            iterations: turn.iterations,
            timestamp: Utc::now(),
        });
        outcome
    }

    async fn request_completion<'a>(
        &'a self,
        memory: &mut ConversationMemory,
        events: &mpsc::Sender<AgentEvent>,
        turn: &mut Turn,
    ) -> LoopState<'a> {
        if events.is_closed() {
            return LoopState::Terminal(TurnOutcome::Cancelled);
        }

        if turn.iterations >= self.max_consecutive_tool_calls {
            let message = format!(
                "Stopped after {} iterations without a final answer: the limit of {} consecutive tool-call rounds was reached.",
                turn.iterations, self.max_consecutive_tool_calls
            );
            warn!(conversation_id = %memory.id(), iterations = turn.iterations, "Iteration bound reached");
            return self
                .terminate(memory, events, ErrorKind::DepthExceeded, message, TurnOutcome::DepthExceeded)
                .await;
        }

        let admission = unless_cancelled(events, self.rate_limiter.acquire(COMPLETION_KEY, 1, self.denial_policy));
        match admission.await {
            None => return LoopState::Terminal(TurnOutcome::Cancelled),
            Some(Ok(())) => {}
            Some(Err(RateLimitError::Exceeded { key, retry_after })) => {
                let retry_after_ms = retry_after.as_millis() as u64;
                self.publish(DomainEvent::RateLimited {
                    key,
                    retry_after_ms,
                    timestamp: Utc::now(),
                });
                let message = format!("Completion rate limit exceeded, retry after {retry_after_ms}ms");
                return self
                    .terminate(
                        memory,
                        events,
                        ErrorKind::RateLimited,
                        message,
                        TurnOutcome::Failed(ErrorKind::RateLimited),
                    )
                    .await;
            }
            Some(Err(RateLimitError::Store(reason))) => {
                warn!(reason = %reason, "Rate limit store failed, admitting completion");
            }
        }

        turn.iterations += 1;
        let tools = self
            .selector
            .select(self.executor.registry(), self.executor.stats(), memory.last_user_text());
        let offered: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        debug!(
            conversation_id = %memory.id(),
            iteration = turn.iterations,
            tools = ?offered,
            window = memory.len(),
            "Requesting completion"
        );
        self.publish(DomainEvent::CompletionRequested {
            conversation_id: memory.id().to_string(),
            iteration: turn.iterations,
            tools_offered: tools.len(),
            timestamp: Utc::now(),
        });

        LoopState::Streaming(self.completion.complete(memory.window(), tools))
    }

    async fn consume_stream<'a>(
        &'a self,
        mut stream: CompletionStream<'a>,
        conversation_id: &ConversationId,
        memory: &mut ConversationMemory,
        events: &mpsc::Sender<AgentEvent>,
        turn: &mut Turn,
    ) -> LoopState<'a> {
        let mut calls = Vec::new();
        let mut streamed = String::new();

        loop {
            let Some(next) = unless_cancelled(events, stream.next()).await else {
                return LoopState::Terminal(TurnOutcome::Cancelled);
            };
            let Some(event) = next else { break };

            match event {
                CompletionEvent::Content(delta) => {
                    streamed.push_str(&delta);
                    if !emit(events, AgentEvent::Content { delta }).await {
                        return LoopState::Terminal(TurnOutcome::Cancelled);
                    }
                }
                CompletionEvent::ToolInvoked(call) => {
                    let arguments = call
                        .parse_arguments()
                        .unwrap_or_else(|_| serde_json::Value::String(call.raw_arguments.clone()));
                    let invoked = AgentEvent::ToolInvoked {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments,
                    };
                    if !emit(events, invoked).await {
                        return LoopState::Terminal(TurnOutcome::Cancelled);
                    }
                    calls.push(call);
                }
                CompletionEvent::Done { content, usage } => {
                    turn.add_usage(usage);
                    if let Err(e) = memory.append(Message::assistant(content.clone())) {
                        return self
                            .terminate(
                                memory,
                                events,
                                ErrorKind::Internal,
                                e.to_string(),
                                TurnOutcome::Failed(ErrorKind::Internal),
                            )
                            .await;
                    }
                    let done = AgentEvent::Done {
                        conversation_id: conversation_id.to_string(),
                        content,
                        usage: turn.usage,
                        iterations: turn.iterations,
                        tool_calls_made: turn.tool_calls_made,
                    };
                    // The answer is stored; a caller that left still got a complete turn
                    emit(events, done).await;
                    return LoopState::Terminal(TurnOutcome::Answered);
                }
                CompletionEvent::Error { kind, message } => {
                    return self
                        .terminate(memory, events, kind, message, TurnOutcome::Failed(kind))
                        .await;
                }
            }
        }

        turn.add_usage(stream.usage());
        if calls.is_empty() {
            return self
                .terminate(
                    memory,
                    events,
                    ErrorKind::Internal,
                    "completion ended without an answer".to_string(),
                    TurnOutcome::Failed(ErrorKind::Internal),
                )
                .await;
        }
        LoopState::HandlingTools {
            calls,
            content: streamed,
        }
    }

    async fn handle_tools<'a>(
        &'a self,
        calls: Vec<ToolCallRequest>,
        content: String,
        memory: &mut ConversationMemory,
        events: &mpsc::Sender<AgentEvent>,
        turn: &mut Turn,
    ) -> LoopState<'a> {
        debug!(conversation_id = %memory.id(), count = calls.len(), "Executing tool batch");
        let Some(results) = unless_cancelled(events, self.executor.execute(&calls)).await else {
            return LoopState::Terminal(TurnOutcome::Cancelled);
        };

        let mut batch = Vec::with_capacity(calls.len() + 1);
        batch.push(Message::assistant_tool_calls(content, calls.clone()));
        for (call, result) in calls.iter().zip(&results) {
            batch.push(Message::tool_result(&call.id, &call.name, result.to_content()));
        }
        if let Err(e) = memory.append_all(batch) {
            let message = format!("Tool results could not be stored: {e}");
            return self
                .terminate(memory, events, ErrorKind::Internal, message, TurnOutcome::Failed(ErrorKind::Internal))
                .await;
        }
        turn.tool_calls_made += calls.len();

        for (call, result) in calls.into_iter().zip(results) {
            let event = AgentEvent::ToolResult {
                id: call.id,
                name: call.name,
                result,
            };
            if !emit(events, event).await {
                return LoopState::Terminal(TurnOutcome::Cancelled);
            }
        }
        LoopState::AwaitingCompletion
    }

    /// Record a diagnostic note, report the error and stop.
    async fn terminate(
        &self,
        memory: &mut ConversationMemory,
        events: &mpsc::Sender<AgentEvent>,
        kind: ErrorKind,
        message: String,
        outcome: TurnOutcome,
    ) -> LoopState<'static> {
        warn!(conversation_id = %memory.id(), kind = %kind, error = %message, "Turn failed");
        if let Err(e) = memory.append(Message::system(format!("[{kind}] {message}"))) {
            warn!(conversation_id = %memory.id(), error = %e, "Failure note not stored");
        }
        emit(events, AgentEvent::Error { kind, message }).await;
        LoopState::Terminal(outcome)
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Send an event; `false` once the caller has gone.
async fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> bool {
    events.send(event).await.is_ok()
}

/// Run `fut` unless the event receiver is dropped first.
async fn unless_cancelled<F: Future>(events: &mpsc::Sender<AgentEvent>, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = events.closed() => None,
        out = fut => Some(out),
    }
}
