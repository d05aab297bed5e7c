//! HTTP client shared by the service-backed tools.
//!
//! Each tool talks to one backing service (search, vector, market data).
//! Failures are mapped onto [`ToolError`] so the executor can tell a
//! transient outage from a bad request.

use marlin_core::error::ToolError;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ServiceClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl ServiceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        tool_name: &str,
        path: &str,
        body: &B,
    ) -> Result<serde_json::Value, ToolError> {
        let url = format!("{}{path}", self.base_url);
        debug!(tool = tool_name, url = %url, "POST to backing service");
        let request = self.http.post(&url).json(body);
        self.send(tool_name, path, request).await
    }

    pub async fn get_json(
        &self,
        tool_name: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, ToolError> {
        let url = format!("{}{path}", self.base_url);
        debug!(tool = tool_name, url = %url, "GET from backing service");
        let request = self.http.get(&url).query(query);
        self.send(tool_name, path, request).await
    }

    async fn send(
        &self,
        tool_name: &str,
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, ToolError> {
        let response = request.send().await.map_err(|e| self.map_error(tool_name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(tool = tool_name, status = status.as_u16(), "Backing service returned an error");
            return Err(ToolError::ExecutionFailed {
                tool_name: tool_name.to_string(),
                reason: format!("{path} returned {status}: {}", truncate(&body, 200)),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| self.map_error(tool_name, e))
    }

    fn map_error(&self, tool_name: &str, e: reqwest::Error) -> ToolError {
        if e.is_timeout() {
            ToolError::Timeout {
                tool_name: tool_name.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if e.is_connect() || e.is_request() {
            ToolError::Transport {
                tool_name: tool_name.to_string(),
                reason: e.to_string(),
            }
        } else {
            ToolError::ExecutionFailed {
                tool_name: tool_name.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
