//! Vector lookup tool: raw similarity search with scores.

use async_trait::async_trait;
use marlin_core::error::ToolError;
use marlin_core::tool::{Tool, ToolResult};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::client::ServiceClient;
use crate::validation::{check_limits, optional_u64, required_str};

const DEFAULT_K: u64 = 5;
const MAX_K: u64 = 20;

pub struct VectorLookupTool {
    client: ServiceClient,
}

impl VectorLookupTool {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ScoredDocument {
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    metadata: serde_json::Value,
}

#[async_trait]
impl Tool for VectorLookupTool {
    fn name(&self) -> &str {
        "vector_lookup"
    }

    fn description(&self) -> &str {
        "Find the stored passages most similar to a query, with similarity scores."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Text to find similar passages for"
                },
                "k": {
                    "type": "integer",
                    "description": "Number of passages to return (default 5, max 20)",
                    "default": DEFAULT_K,
                    "minimum": 1,
                    "maximum": MAX_K
                }
            },
            "required": ["query"]
        })
    }

    fn capabilities(&self) -> Vec<String> {
        ["vector", "similar", "similarity", "semantic", "lookup", "knowledge", "passages", "documents"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        check_limits(&arguments)?;
        let query = required_str(&arguments, "query")?;
        let k = optional_u64(&arguments, "k", DEFAULT_K, 1..=MAX_K)?;

        info!(query, k, "Vector lookup");
        let response = self
            .client
            .post_json(self.name(), "/query", &serde_json::json!({ "query": query, "k": k }))
            .await?;

        let documents: Vec<ScoredDocument> = serde_json::from_value(response["documents"].clone())
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: self.name().to_string(),
                reason: format!("unexpected vector service response: {e}"),
            })?;

        Ok(ToolResult::success(serde_json::json!({ "documents": documents })))
    }
}
