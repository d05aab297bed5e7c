//! Scripted providers and stub tools shared by the agent tests.

use async_trait::async_trait;
use marlin_core::error::{ProviderError, ToolError};
use marlin_core::provider::{
    FinishReason, Provider, ProviderRequest, StreamChunk, ToolCallDelta, Usage,
};
use marlin_core::tool::{Tool, ToolResult};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// One scripted item inside an opened stream.
#[derive(Clone)]
pub enum Step {
    Chunk(StreamChunk),
    Fail(ProviderError),
}

/// What a single `stream()` call does.
#[derive(Clone)]
pub enum Script {
    Open(Vec<Step>),
    Refuse(ProviderError),
}

/// A provider that replays scripts in order.
///
/// With `repeat_last`, the final script is replayed forever.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    last: Mutex<Option<Script>>,
    repeat_last: bool,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            last: Mutex::new(None),
            repeat_last: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(script: Script) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(vec![script])
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        self.requests.lock().unwrap().push(request);

        let next = self.scripts.lock().unwrap().pop_front();
        let script = match next {
            Some(script) => {
                *self.last.lock().unwrap() = Some(script.clone());
                script
            }
            None if self.repeat_last => self.last.lock().unwrap().clone().expect("no script to repeat"),
            None => panic!("ScriptedProvider: no script left for call #{}", self.calls()),
        };

        match script {
            Script::Refuse(e) => Err(e),
            Script::Open(steps) => {
                let (tx, rx) = mpsc::channel(steps.len().max(1));
                for step in steps {
                    let item = match step {
                        Step::Chunk(chunk) => Ok(chunk),
                        Step::Fail(e) => Err(e),
                    };
                    tx.try_send(item).unwrap();
                }
                Ok(rx)
            }
        }
    }
}

/// A plain text answer streamed as the given deltas, then `stop`.
pub fn text_reply(deltas: &[&str]) -> Script {
    let mut steps: Vec<Step> = deltas.iter().map(|d| Step::Chunk(StreamChunk::content(*d))).collect();
    steps.push(Step::Chunk(StreamChunk {
        finish_reason: Some(FinishReason::Stop),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        ..Default::default()
    }));
    Script::Open(steps)
}

/// A tool-call batch, one whole call per delta, then `tool_calls`.
pub fn tool_calls_reply(calls: &[(&str, &str, &str)]) -> Script {
    let mut steps: Vec<Step> = calls
        .iter()
        .enumerate()
        .map(|(index, (id, name, args))| {
            Step::Chunk(tool_delta(index as u32, Some(*id), Some(*name), args))
        })
        .collect();
    steps.push(Step::Chunk(StreamChunk::finish(FinishReason::ToolCalls)));
    Script::Open(steps)
}

pub fn tool_delta(index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) -> StreamChunk {
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

/// A tool that returns a fixed value.
pub struct StaticTool {
    name: String,
    output: serde_json::Value,
    capabilities: Vec<String>,
    delay: Duration,
}

impl StaticTool {
    pub fn new(name: &str, output: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            output,
            capabilities: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "Returns a fixed value"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    fn capabilities(&self) -> Vec<String> {
        if self.capabilities.is_empty() {
            vec![self.name.clone()]
        } else {
            self.capabilities.clone()
        }
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ToolResult::success(self.output.clone()))
    }
}

/// A tool that never answers.
pub struct HangingTool {
    pub name: &'static str,
    pub calls: AtomicU32,
}

impl HangingTool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for HangingTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "Never returns"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// A tool that fails with the given error a number of times, then succeeds.
pub struct FlakyTool {
    pub name: &'static str,
    pub failures: u32,
    pub error: ToolError,
    pub calls: AtomicU32,
}

impl FlakyTool {
    pub fn new(name: &'static str, failures: u32, error: ToolError) -> Self {
        Self {
            name,
            failures,
            error,
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "Fails before succeeding"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(self.error.clone())
        } else {
            Ok(ToolResult::success(serde_json::json!({"attempt": n + 1})))
        }
    }
}
