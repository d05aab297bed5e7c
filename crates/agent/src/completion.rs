//! Completion client: turns a provider stream into normalized events.
//!
//! Content deltas are forwarded as soon as they arrive. Tool-call
//! fragments are accumulated per call index until the stream ends, then
//! released as whole [`ToolCallRequest`]s in index order. Provider errors
//! are reduced to an [`ErrorKind`] and a message.
//!
//! A stream that fails to open (or breaks before its first chunk) with a
//! transport error or timeout is re-opened up to `transport_retries`
//! times with linear backoff. Once output has been seen nothing is retried.

use marlin_core::error::{ErrorKind, ProviderError};
use marlin_core::message::Message;
use marlin_core::provider::{
    FinishReason, Provider, ProviderRequest, StreamChunk, ToolCallDelta, ToolDefinition, Usage,
};
use marlin_core::tool::ToolCallRequest;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// One normalized event from a completion call.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    Content(String),
    ToolInvoked(ToolCallRequest),
    Done { content: String, usage: Option<Usage> },
    Error { kind: ErrorKind, message: String },
}

pub struct CompletionClient {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    transport_retries: u32,
    retry_backoff: Duration,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            transport_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Re-open attempts for transport failures before any output.
    pub fn with_transport_retries(mut self, retries: u32) -> Self {
        self.transport_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, step: Duration) -> Self {
        self.retry_backoff = step;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Start a completion over `messages`, offering `tools`.
    ///
    /// Nothing is sent until the returned stream is polled.
    pub fn complete(&self, messages: Vec<Message>, tools: Vec<ToolDefinition>) -> CompletionStream<'_> {
        let request = ProviderRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools,
            stream: true,
        };
        CompletionStream {
            client: self,
            request,
            receiver: None,
            retries_used: 0,
            received_any: false,
            calls: ToolCallAccumulator::default(),
            content: String::new(),
            usage: None,
            finish: None,
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

/// The event sequence of one completion call.
pub struct CompletionStream<'a> {
    client: &'a CompletionClient,
    request: ProviderRequest,
    receiver: Option<ChunkReceiver>,
    retries_used: u32,
    received_any: bool,
    calls: ToolCallAccumulator,
    content: String,
    usage: Option<Usage>,
    finish: Option<FinishReason>,
    pending: VecDeque<CompletionEvent>,
    finished: bool,
}

impl CompletionStream<'_> {
    /// The next event, or `None` once the call has ended.
    pub async fn next(&mut self) -> Option<CompletionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            if self.receiver.is_none() {
                match self.open().await {
                    Ok(receiver) => self.receiver = Some(receiver),
                    Err(e) => self.fail(e),
                }
                continue;
            }

            let item = match self.receiver.as_mut() {
                Some(receiver) => receiver.recv().await,
                None => continue,
            };
            match item {
                Some(Ok(chunk)) => {
                    self.received_any = true;
                    self.absorb(chunk);
                }
                Some(Err(e)) if !self.received_any && self.may_retry(&e) => {
                    self.receiver = None;
                    self.backoff(&e).await;
                }
                Some(Err(e)) => self.fail(e),
                None => self.close(),
            }
        }
    }

    /// Drain the stream into a vector.
    pub async fn collect(mut self) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Usage reported by the provider, once it has been seen.
    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    async fn open(&mut self) -> Result<ChunkReceiver, ProviderError> {
        loop {
            let opened = self.client.provider.stream(self.request.clone()).await;
            match opened {
                Ok(receiver) => return Ok(receiver),
                Err(e) if self.may_retry(&e) => self.backoff(&e).await,
                Err(e) => return Err(e),
            }
        }
    }

    fn may_retry(&self, e: &ProviderError) -> bool {
        e.is_transient() && self.retries_used < self.client.transport_retries
    }

    async fn backoff(&mut self, e: &ProviderError) {
        self.retries_used += 1;
        let delay = self.client.retry_backoff * self.retries_used;
        warn!(
            provider = %self.client.provider.name(),
            attempt = self.retries_used,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "Completion stream failed before any output, re-opening"
        );
        tokio::time::sleep(delay).await;
    }

    fn absorb(&mut self, chunk: StreamChunk) {
        if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
            self.content.push_str(&delta);
            self.pending.push_back(CompletionEvent::Content(delta));
        }
        for delta in chunk.tool_calls {
            self.calls.push(delta);
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if let Some(reason) = chunk.finish_reason {
            self.finish = Some(reason);
        }
    }

    fn fail(&mut self, e: ProviderError) {
        warn!(provider = %self.client.provider.name(), error = %e, "Completion failed");
        self.pending.push_back(CompletionEvent::Error {
            kind: e.kind(),
            message: e.to_string(),
        });
        self.end();
    }

    /// The provider closed the stream; release what was accumulated.
    fn close(&mut self) {
        let finish = self.finish.take();
        if !self.calls.is_empty() {
            let calls = std::mem::take(&mut self.calls).finish();
            debug!(count = calls.len(), finish = ?finish, "Tool-call batch reconstructed");
            self.pending.extend(calls.into_iter().map(CompletionEvent::ToolInvoked));
        } else if finish == Some(FinishReason::ToolCalls) {
            self.pending.push_back(CompletionEvent::Error {
                kind: ErrorKind::Provider,
                message: "provider signalled tool calls but sent none".into(),
            });
        } else if finish.is_some() || !self.content.is_empty() {
            if finish == Some(FinishReason::Length) {
                warn!("Completion stopped at the token limit");
            }
            self.pending.push_back(CompletionEvent::Done {
                content: std::mem::take(&mut self.content),
                usage: self.usage,
            });
        } else {
            self.pending.push_back(CompletionEvent::Error {
                kind: ErrorKind::Transport,
                message: "stream closed before any output".into(),
            });
        }
        self.end();
    }

    fn end(&mut self) {
        self.receiver = None;
        self.finished = true;
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Tool-call fragments keyed by call index.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    fn push(&mut self, delta: ToolCallDelta) {
        let call = self.calls.entry(delta.index).or_default();
        if call.id.is_none() {
            call.id = delta.id.filter(|id| !id.is_empty());
        }
        if call.name.is_none() {
            call.name = delta.name.filter(|name| !name.is_empty());
        }
        if let Some(fragment) = delta.arguments {
            call.arguments.push_str(&fragment);
        }
    }

    fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Whole calls in index order. A call whose id never arrived gets a
    /// synthetic one so its result can still be paired.
    fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_iter()
            .map(|(index, call)| ToolCallRequest {
                id: call.id.unwrap_or_else(|| format!("call_{index}")),
                name: call.name.unwrap_or_default(),
                raw_arguments: call.arguments,
            })
            .collect()
    }
}
