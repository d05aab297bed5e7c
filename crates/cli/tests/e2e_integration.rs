//! End-to-end integration tests for the marlin agent engine.
//!
//! These tests drive the public agent interface from user input to the
//! final event, with a scripted streaming provider and in-process tools.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use marlin_agent::{Agent, AgentEvent, ExecutionPolicy, ToolExecutor, ToolStatsRegistry};
use marlin_config::AppConfig;
use marlin_core::error::{Error, ErrorKind, ProviderError, ToolError};
use marlin_core::message::{ConversationId, Message, Role};
use marlin_core::provider::{FinishReason, Provider, ProviderRequest, StreamChunk, ToolCallDelta, Usage};
use marlin_core::snapshot::SnapshotStore;
use marlin_core::tool::{Tool, ToolCallRequest, ToolRegistry, ToolResult};
use marlin_memory::{CharRatioEstimator, ConversationMemory, FileSnapshotStore, TokenEstimator};
use marlin_ratelimit::{Admission, BucketConfig, ManualClock, RateLimiter};
use marlin_tools::calculator::CalculatorTool;
use serde_json::{Value, json};
use tokio::sync::mpsc;

// ── Scripted Provider ────────────────────────────────────────────────────

type Reply = Box<dyn Fn(&ProviderRequest, usize) -> Vec<StreamChunk> + Send + Sync>;

/// A streaming provider whose reply to call `n` is computed from the
/// request it receives.
struct ScriptedProvider {
    reply: Reply,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(reply: impl Fn(&ProviderRequest, usize) -> Vec<StreamChunk> + Send + Sync + 'static) -> Self {
        Self {
            reply: Box::new(reply),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_scripted"
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };
        let chunks = (self.reply)(&request, n);
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            tx.try_send(Ok(chunk)).unwrap();
        }
        Ok(rx)
    }
}

fn text(deltas: &[&str]) -> Vec<StreamChunk> {
    let mut chunks: Vec<StreamChunk> = deltas.iter().map(|d| StreamChunk::content(*d)).collect();
    chunks.push(StreamChunk {
        finish_reason: Some(FinishReason::Stop),
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        }),
        ..Default::default()
    });
    chunks
}

fn delta(index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) -> StreamChunk {
    StreamChunk {
        tool_calls: vec![ToolCallDelta {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: Some(arguments.to_string()),
        }],
        ..Default::default()
    }
}

fn tool_calls(calls: &[(&str, &str, Value)]) -> Vec<StreamChunk> {
    let mut chunks: Vec<StreamChunk> = calls
        .iter()
        .enumerate()
        .map(|(i, (id, name, args))| delta(i as u32, Some(*id), Some(*name), &args.to_string()))
        .collect();
    chunks.push(StreamChunk::finish(FinishReason::ToolCalls));
    chunks
}

// ── Stub Tools ───────────────────────────────────────────────────────────

/// Returns a fixed payload and records the arguments it saw.
struct StubTool {
    name: &'static str,
    capabilities: Vec<&'static str>,
    output: Value,
    delay: Duration,
    seen: Mutex<Vec<Value>>,
}

impl StubTool {
    fn new(name: &'static str, capabilities: &[&'static str], output: Value) -> Self {
        Self {
            name,
            capabilities: capabilities.to_vec(),
            output,
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn seen(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tool for StubTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "Stub tool"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })
    }
    fn capabilities(&self) -> Vec<String> {
        self.capabilities.iter().map(|c| c.to_string()).collect()
    }
    async fn execute(&self, arguments: Value) -> Result<ToolResult, ToolError> {
        self.seen.lock().unwrap().push(arguments);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ToolResult::success(self.output.clone()))
    }
}

/// Never answers.
struct HangingTool {
    name: &'static str,
    calls: AtomicU32,
}

impl HangingTool {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Tool for HangingTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "Never answers"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"symbol": {"type": "string"}}})
    }
    async fn execute(&self, _arguments: Value) -> Result<ToolResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

fn market_tool() -> StubTool {
    StubTool::new(
        "market_data",
        &["price", "btc", "crypto", "stock", "market", "quote"],
        json!({"symbol": "BTC", "current": 66789.23, "historical": 27891.45, "days_ago": 180}),
    )
}

fn registry(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    registry
}

async fn collect(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// ── E2E: Market Question ─────────────────────────────────────────────────

#[tokio::test]
async fn e2e_btc_price_change_answer() {
    // Call 0 asks for market data; call 1 reads the tool message and
    // states the change it computes from it.
    let provider = Arc::new(ScriptedProvider::new(|request, n| match n {
        0 => tool_calls(&[("call_0", "market_data", json!({"symbol": "BTC", "days_ago": 180}))]),
        _ => {
            let tool_message = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Tool)
                .expect("tool result in context");
            let data: Value = serde_json::from_str(tool_message.text()).unwrap();
            let from = data["historical"].as_f64().unwrap();
            let to = data["current"].as_f64().unwrap();
            let change = marlin_tools::calculator::percent_change(from, to).unwrap();
            let answer = format!("BTC moved from ${from} to ${to}, a {change:.2}% change.");
            text(&["BTC moved ", &answer["BTC moved ".len()..]])
        }
    }));
    let market = Arc::new(market_tool());
    let tools = registry(vec![
        market.clone(),
        Arc::new(CalculatorTool),
        Arc::new(StubTool::new("web_search", &["search", "news", "web"], json!("no results"))),
        Arc::new(StubTool::new("document_search", &["document", "report"], json!(""))),
        Arc::new(StubTool::new("vector_lookup", &["similar", "vector"], json!({"documents": []}))),
    ]);
    let agent = Agent::from_config(&AppConfig::default(), provider.clone(), tools, None);
    let id = ConversationId::from("btc");

    let events = collect(agent.submit(id.clone(), "BTC price 6 months ago vs now").unwrap()).await;

    // the market tool is ranked first and only top-K schemas are offered
    let first = &provider.requests()[0];
    assert_eq!(first.tools[0].name, "market_data");
    assert_eq!(first.tools.len(), 4);

    assert_eq!(market.seen(), vec![json!({"symbol": "BTC", "days_ago": 180})]);
    match events.last() {
        Some(AgentEvent::Done {
            content,
            iterations,
            tool_calls_made,
            ..
        }) => {
            assert!(content.contains("139.46%"), "{content}");
            assert_eq!(*iterations, 2);
            assert_eq!(*tool_calls_made, 1);
        }
        other => panic!("expected done, got {other:?}"),
    }

    let window = agent.window(&id).await.unwrap();
    let roles: Vec<Role> = window.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(window[2].tool_calls.len(), 1);
    assert_eq!(window[3].tool_call_id.as_deref(), Some("call_0"));
    assert_eq!(window.iter().filter(|m| m.role == Role::Tool).count(), 1);
    assert!(window[4].text().contains("139.46%"));
}

// ── E2E: Loop Safety ─────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_depth_exceeded_after_exactly_two_iterations() {
    let provider = Arc::new(ScriptedProvider::new(|_, n| {
        let id = format!("call_{n}");
        tool_calls(&[(id.as_str(), "calculator", json!({"expression": "1 + 1"}))])
    }));
    let mut config = AppConfig::default();
    config.agent.max_consecutive_tool_calls = 2;
    let agent = Agent::from_config(&config, provider.clone(), registry(vec![Arc::new(CalculatorTool)]), None);
    let id = ConversationId::from("loop");

    let events = collect(agent.submit(id.clone(), "keep calculating").unwrap()).await;

    assert_eq!(provider.calls(), 2);
    match events.last() {
        Some(AgentEvent::Error { kind, message }) => {
            assert_eq!(*kind, ErrorKind::DepthExceeded);
            assert!(message.contains("limit of 2"));
        }
        other => panic!("expected depth error, got {other:?}"),
    }
    let results = events.iter().filter(|e| e.event_type() == "tool_result").count();
    assert_eq!(results, 2);
}

// ── E2E: Stream Reconstruction ───────────────────────────────────────────

#[tokio::test]
async fn e2e_three_fragment_arguments_match_single_fragment() {
    let arguments = r#"{"query": "bitcoin halving 2024 price impact"}"#;
    let (a, b) = arguments.split_at(12);
    let (b, c) = b.split_at(15);

    let split = Arc::new(ScriptedProvider::new(move |_, n| match n {
        0 => vec![
            delta(0, Some("call_0"), Some("web_search"), a),
            delta(0, None, None, b),
            delta(0, None, None, c),
            StreamChunk::finish(FinishReason::ToolCalls),
        ],
        _ => text(&["done"]),
    }));
    let whole = Arc::new(ScriptedProvider::new(move |_, n| match n {
        0 => vec![
            delta(0, Some("call_0"), Some("web_search"), arguments),
            StreamChunk::finish(FinishReason::ToolCalls),
        ],
        _ => text(&["done"]),
    }));

    let mut observed = Vec::new();
    for provider in [split, whole] {
        let search = Arc::new(StubTool::new("web_search", &["search"], json!("ok")));
        let agent = Agent::from_config(&AppConfig::default(), provider, registry(vec![search.clone()]), None);
        let events = collect(agent.submit(ConversationId::new(), "search it").unwrap()).await;
        let invoked = events
            .into_iter()
            .find(|e| e.event_type() == "tool_invoked")
            .unwrap();
        observed.push((invoked, search.seen()));
    }

    assert_eq!(observed[0], observed[1]);
    assert_eq!(observed[0].1, vec![json!({"query": "bitcoin halving 2024 price impact"})]);
}

// ── E2E: Tool Batches ────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_batch_results_are_stored_in_call_order() {
    let provider = Arc::new(ScriptedProvider::new(|_, n| match n {
        0 => tool_calls(&[
            ("call_0", "slow", json!({"query": "a"})),
            ("call_1", "fast", json!({"query": "b"})),
            ("call_2", "medium", json!({"query": "c"})),
        ]),
        _ => text(&["All three answered."]),
    }));
    let tools = registry(vec![
        Arc::new(StubTool::new("slow", &[], json!("slow")).with_delay(Duration::from_millis(60))),
        Arc::new(StubTool::new("fast", &[], json!("fast"))),
        Arc::new(StubTool::new("medium", &[], json!("medium")).with_delay(Duration::from_millis(30))),
    ]);
    let agent = Agent::from_config(&AppConfig::default(), provider, tools, None);
    let id = ConversationId::from("batch");

    let events = collect(agent.submit(id.clone(), "run all three").unwrap()).await;
    assert!(events.last().unwrap().event_type() == "done");

    let window = agent.window(&id).await.unwrap();
    let results: Vec<(&str, &str)> = window
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| (m.tool_call_id.as_deref().unwrap(), m.text()))
        .collect();
    assert_eq!(
        results,
        vec![("call_0", "slow"), ("call_1", "fast"), ("call_2", "medium")]
    );
}

#[tokio::test(start_paused = true)]
async fn e2e_timeouts_retry_then_fall_back_to_alternative() {
    let hanging = Arc::new(HangingTool::new("market_data"));
    let search = Arc::new(StubTool::new("web_search", &["search"], json!("BTC trades near 66789")));
    let mut tools = registry(vec![hanging.clone(), search.clone()]);
    tools.set_alternative("market_data", "web_search").unwrap();
    let executor = ToolExecutor::new(Arc::new(tools), Arc::new(ToolStatsRegistry::new()))
        .with_policy(ExecutionPolicy::default());

    let results = executor
        .execute(&[ToolCallRequest::new("call_0", "market_data", r#"{"symbol":"BTC"}"#)])
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(hanging.calls.load(Ordering::SeqCst), 3);
    assert!(results[0].is_success());
    assert_eq!(results[0].metadata["alternative_for"], "market_data");
    assert_eq!(search.seen(), vec![json!({"symbol": "BTC", "query": "BTC"})]);

    let stats = executor.stats().snapshot();
    assert_eq!(stats["market_data"].success_rate(), 0.0);
    assert_eq!(stats["web_search"].success_rate(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn e2e_timeouts_without_alternative_become_error_result() {
    let hanging = Arc::new(HangingTool::new("market_data"));
    let executor = ToolExecutor::new(
        Arc::new(registry(vec![hanging.clone()])),
        Arc::new(ToolStatsRegistry::new()),
    );

    let results = executor
        .execute(&[ToolCallRequest::new("call_0", "market_data", "{}")])
        .await;

    assert_eq!(hanging.calls.load(Ordering::SeqCst), 3);
    assert!(!results[0].is_success());
    assert_eq!(results[0].metadata["error_kind"], "tool_execution");
}

// ── E2E: Memory Budget ───────────────────────────────────────────────────

#[tokio::test]
async fn e2e_window_never_exceeds_budget() {
    let budget = 300;
    let estimator = CharRatioEstimator::default();
    let mut memory = ConversationMemory::new(ConversationId::from("budget"), budget)
        .with_system_prompt("You are a concise assistant.")
        .unwrap();

    for i in 0..60 {
        let filler = "x".repeat((i * 37) % 400);
        if i % 3 == 0 {
            let call = ToolCallRequest::new(format!("call_{i}"), "web_search", r#"{"query":"q"}"#);
            memory.append_all(vec![
                Message::assistant_tool_calls("", vec![call]),
                Message::tool_result(format!("call_{i}"), "web_search", filler),
            ])
            .unwrap();
        } else {
            memory.append(Message::user(format!("question {i} {filler}"))).unwrap();
        }

        let window = memory.window();
        let total: usize = window.iter().map(|m| estimator.estimate(m)).sum();
        assert!(total <= budget, "turn {i}: {total} > {budget}");
        assert_eq!(window[0].role, Role::System);

        // no orphaned tool results
        for (pos, message) in window.iter().enumerate() {
            if message.role == Role::Tool {
                let id = message.tool_call_id.as_deref().unwrap();
                assert!(window[..pos].iter().any(|m| m.tool_calls.iter().any(|c| c.id == id)));
            }
        }
    }
    assert!(memory.trimmed_count() > 0);
}

// ── E2E: Sessions ────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_concurrent_turn_on_same_conversation_is_busy() {
    let provider = Arc::new(ScriptedProvider::new(|_, n| match n {
        0 => tool_calls(&[("call_0", "market_data", json!({"symbol": "BTC"}))]),
        _ => text(&["hello"]),
    }));
    let agent = Agent::from_config(
        &AppConfig::default(),
        provider,
        registry(vec![Arc::new(HangingTool::new("market_data"))]),
        None,
    );
    let id = ConversationId::from("shared");

    let mut first = agent.submit(id.clone(), "BTC?").unwrap();
    assert_eq!(first.recv().await.unwrap().event_type(), "tool_invoked");

    match agent.submit(id.clone(), "still there?") {
        Err(Error::ConversationBusy(busy)) => assert_eq!(busy, "shared"),
        other => panic!("expected busy, got {other:?}"),
    }

    // a different conversation runs independently
    let events = collect(agent.submit(ConversationId::from("other"), "hi").unwrap()).await;
    assert!(matches!(events.last(), Some(AgentEvent::Done { content, .. }) if content == "hello"));

    drop(first);
}

#[tokio::test]
async fn e2e_history_survives_restart_through_file_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let id = ConversationId::from("persisted");

    for (turn, question) in ["my name is Ada", "what is my name?"].into_iter().enumerate() {
        let provider = Arc::new(ScriptedProvider::new(move |request, _| {
            let users = request.messages.iter().filter(|m| m.role == Role::User).count();
            let reply = format!("turn {turn} sees {users} user messages");
            text(&[reply.as_str()])
        }));
        let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(dir.path()));
        let agent = Agent::from_config(&AppConfig::default(), provider, ToolRegistry::new(), Some(store));

        let events = collect(agent.submit(id.clone(), question).unwrap()).await;
        match events.last() {
            Some(AgentEvent::Done { content, .. }) => {
                assert_eq!(content, &format!("turn {turn} sees {} user messages", turn + 1));
            }
            other => panic!("expected done, got {other:?}"),
        }
        // let the background save finish before the agent is dropped
        agent.window(&id).await.unwrap();
    }
}

// ── E2E: Rate Limiting ───────────────────────────────────────────────────

#[tokio::test]
async fn e2e_token_bucket_refills_after_window() {
    let clock = Arc::new(ManualClock::new());
    let limiter = RateLimiter::new(BucketConfig::new(1, 1.0 / 60.0)).with_clock(clock.clone());

    assert!(limiter.try_acquire("completion", 1).await.unwrap().is_admitted());
    assert!(matches!(
        limiter.try_acquire("completion", 1).await.unwrap(),
        Admission::Denied { .. }
    ));

    clock.advance(Duration::from_secs(60));
    assert!(limiter.try_acquire("completion", 1).await.unwrap().is_admitted());
}

#[tokio::test]
async fn e2e_fail_fast_rate_limit_is_reported_to_the_caller() {
    let provider = Arc::new(ScriptedProvider::new(|_, _| text(&["ok"])));
    let mut config = AppConfig::default();
    config.rate_limit.completion_limit = 1;
    config.rate_limit.completion_window_secs = 3600;
    config.agent.rate_limit_policy = marlin_config::RateLimitPolicy::FailFast;
    let agent = Agent::from_config(&config, provider.clone(), ToolRegistry::new(), None);
    let id = ConversationId::from("limited");

    let first = collect(agent.submit(id.clone(), "one").unwrap()).await;
    assert_eq!(first.last().unwrap().event_type(), "done");

    let second = collect(agent.submit(id.clone(), "two").unwrap()).await;
    assert!(matches!(
        second.last(),
        Some(AgentEvent::Error { kind: ErrorKind::RateLimited, .. })
    ));
    assert_eq!(provider.calls(), 1);
}
