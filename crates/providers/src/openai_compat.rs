//! OpenAI-compatible streaming provider.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, Together AI, and any
//! endpoint exposing `/chat/completions` with SSE streaming.
//!
//! The provider forwards deltas as they arrive, tool-call fragments
//! included. Reassembling fragmented tool calls is the completion
//! client's job, not this module's.

use async_trait::async_trait;
use futures::StreamExt;
use marlin_core::error::ProviderError;
use marlin_core::message::{Message, Role};
use marlin_core::provider::*;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible completion provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Ollama needs no real key.
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new("ollama", base_url.unwrap_or("http://localhost:11434/v1"), "ollama")
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                    Role::Tool => "tool".into(),
                },
                content: m.content.clone(),
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.raw_arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.clone(),
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn request_body(request: &ProviderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        body
    }
}

/// Map a non-success HTTP status to the provider error taxonomy.
fn status_error(status: u16, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ),
        429 => ProviderError::QuotaExceeded(body),
        400 | 404 | 422 => ProviderError::InvalidRequest(body),
        408 | 504 => ProviderError::Timeout(format!("provider returned {status}")),
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

fn send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(
            provider = %self.name,
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending streaming request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status().as_u16();
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(status_error(status, error_body));
        }

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();
        tokio::spawn(pump(response.bytes_stream(), tx, provider_name));

        Ok(rx)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(send_error)?;

        Ok(response.status().is_success())
    }
}

/// Forward decoded SSE chunks to `tx` until `[DONE]`, an error, or the
/// receiver goes away.
///
/// A body that breaks before anything was forwarded reports a network
/// error, so the caller may reopen; once output has flowed it is an
/// interruption.
async fn pump<S, B, E>(
    body: S,
    tx: mpsc::Sender<std::result::Result<StreamChunk, ProviderError>>,
    provider_name: String,
) where
    S: futures::Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::default();
    let mut forwarded = false;

    while let Some(chunk_result) = body.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let error = if forwarded {
                    ProviderError::StreamInterrupted(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                };
                warn!(provider = %provider_name, error = %error, "SSE body failed");
                let _ = tx.send(Err(error)).await;
                return;
            }
        };

        for event in decoder.push(bytes.as_ref()) {
            let data = match event {
                SseEvent::Done => return,
                SseEvent::Data(data) => data,
            };
            let mut resp = match serde_json::from_str::<StreamResponse>(&data) {
                Ok(resp) => resp,
                Err(e) => {
                    trace!(
                        provider = %provider_name,
                        data = %data,
                        error = %e,
                        "Ignoring unparseable SSE chunk"
                    );
                    continue;
                }
            };
            if let Some(reported) = resp.error.take() {
                let error = reported.into_provider_error();
                warn!(provider = %provider_name, error = %error, "Provider reported an error mid-stream");
                let _ = tx.send(Err(error)).await;
                return;
            }
            let Some(chunk) = translate(resp) else { continue };
            if tx.send(Ok(chunk)).await.is_err() {
                return; // receiver dropped
            }
            forwarded = true;
        }
    }
    // Stream ended without [DONE]; the consumer decides what the
    // accumulated state means.
    debug!(provider = %provider_name, "SSE stream closed without [DONE]");
}

/// Convert one parsed SSE payload to a chunk; `None` when it carries nothing.
fn translate(resp: StreamResponse) -> Option<StreamChunk> {
    let mut chunk = StreamChunk::default();

    if let Some(choice) = resp.choices.into_iter().next() {
        chunk.content = choice.delta.content.filter(|c| !c.is_empty());
        chunk.tool_calls = choice
            .delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                ToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name,
                    arguments,
                }
            })
            .collect();
        chunk.finish_reason = choice.finish_reason.as_deref().map(FinishReason::parse);
    }

    chunk.usage = resp.usage.map(|u| Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    });

    let empty = chunk.content.is_none()
        && chunk.tool_calls.is_empty()
        && chunk.finish_reason.is_none()
        && chunk.usage.is_none();
    (!empty).then_some(chunk)
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into SSE `data:` payloads across chunk boundaries.
///
/// Bytes are held until a full line arrives, so a UTF-8 sequence split
/// between network reads is decoded intact.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    events.push(SseEvent::Done);
                } else {
                    events.push(SseEvent::Data(data.to_string()));
                }
            }
        }
        events
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

/// `{"error": {...}}` sent in place of a delta when generation fails upstream.
#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl StreamErrorBody {
    fn into_provider_error(self) -> ProviderError {
        let message = self.message.unwrap_or_else(|| "provider reported an error".into());
        match self.code.as_ref().and_then(serde_json::Value::as_u64) {
            Some(status @ 400..=599) => status_error(status as u16, message),
            _ => ProviderError::ApiError {
                status_code: 500,
                message,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
