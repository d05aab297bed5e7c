//! Web search tool: queries the search service.
//!
//! `POST {search_service_url}/search {"query": ...}` returns
//! `{"results": "..."}`, pre-formatted result text.

use async_trait::async_trait;
use marlin_core::error::ToolError;
use marlin_core::tool::{Tool, ToolResult};
use tracing::info;

use crate::client::ServiceClient;
use crate::validation::{check_limits, required_str};

pub struct WebSearchTool {
    client: ServiceClient,
}

impl WebSearchTool {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information, news, market data and investment opportunities."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    fn capabilities(&self) -> Vec<String> {
        [
            "web", "search", "internet", "news", "current", "latest", "today", "recent", "online",
            "opportunities",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        check_limits(&arguments)?;
        let query = required_str(&arguments, "query")?;

        info!(query, "Querying search service");
        let response = self
            .client
            .post_json(self.name(), "/search", &serde_json::json!({ "query": query }))
            .await?;

        let results = match response.get("results") {
            Some(serde_json::Value::String(text)) => serde_json::Value::String(text.clone()),
            Some(other) => other.clone(),
            None => serde_json::Value::String(String::new()),
        };
        Ok(ToolResult::success(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::respond_once;
    use std::time::Duration;

    #[tokio::test]
    async fn returns_results_text() {
        let (url, request) = respond_once(200, r#"{"results":"Title: BTC\nSnippet: up"}"#).await;
        let tool = WebSearchTool::new(ServiceClient::new(url, Duration::from_secs(5)));

        let result = tool
            .execute(serde_json::json!({"query": "bitcoin news"}))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.to_content(), "Title: BTC\nSnippet: up");
        assert!(request.await.unwrap().contains(r#""query":"bitcoin news""#));
    }

    #[tokio::test]
    async fn missing_results_field_is_empty_text() {
        let (url, _) = respond_once(200, "{}").await;
        let tool = WebSearchTool::new(ServiceClient::new(url, Duration::from_secs(5)));
        let result = tool.execute(serde_json::json!({"query": "x"})).await.unwrap();
        assert_eq!(result.to_content(), "");
    }

    #[tokio::test]
    async fn missing_query_is_invalid() {
        let tool = WebSearchTool::new(ServiceClient::new("http://unused", Duration::from_secs(1)));
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn tool_definition() {
        let tool = WebSearchTool::new(ServiceClient::new("http://unused", Duration::from_secs(1)));
        let def = tool.to_definition();
        assert_eq!(def.name, "web_search");
        assert!(!def.description.is_empty());
    }
}
