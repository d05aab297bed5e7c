//! Document search tool: retrieves passages from the vector service.
//!
//! `POST {vector_service_url}/query {"query", "k"}` returns
//! `{"documents": [{"content", "score", ...}]}`; the passages are
//! joined with a blank line.

use async_trait::async_trait;
use marlin_core::error::ToolError;
use marlin_core::tool::{Tool, ToolResult};
use tracing::info;

use crate::client::ServiceClient;
use crate::validation::{check_limits, required_str};

pub struct DocumentSearchTool {
    client: ServiceClient,
    k: u32,
}

impl DocumentSearchTool {
    pub fn new(client: ServiceClient, k: u32) -> Self {
        Self { client, k }
    }
}

#[async_trait]
impl Tool for DocumentSearchTool {
    fn name(&self) -> &str {
        "document_search"
    }

    fn description(&self) -> &str {
        "Search through financial documents for investment options, strategy and historical data."
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
            "document", "documents", "report", "reports", "financial", "investment", "strategy",
            "historical", "portfolio", "policy",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        check_limits(&arguments)?;
        let query = required_str(&arguments, "query")?;

        info!(query, k = self.k, "Querying vector service");
        let response = self
            .client
            .post_json(
                self.name(),
                "/query",
                &serde_json::json!({ "query": query, "k": self.k }),
            )
            .await?;

        let passages: Vec<&str> = response["documents"]
            .as_array()
            .map(|docs| docs.iter().filter_map(|d| d["content"].as_str()).collect())
            .unwrap_or_default();

        Ok(ToolResult::success(passages.join("\n\n")).with_metadata("documents", passages.len()))
    }
}
