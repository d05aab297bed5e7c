//! Tool trait: the abstraction over agent capabilities.
//!
//! A tool is a named capability with a parameter schema and an async
//! execution contract. New tools are added by registering another
//! implementer in the [`ToolRegistry`], never by branching on type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A provider-emitted request to invoke a tool.
///
/// `raw_arguments` is the argument text exactly as accumulated from the
/// stream; it is only parsed right before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique call ID (matches the provider's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Accumulated JSON argument text
    pub raw_arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, raw_arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments: raw_arguments.into(),
        }
    }

    /// Parse the accumulated argument text into a JSON object.
    ///
    /// Empty text is an empty object (models omit arguments for
    /// parameterless tools). Anything else must be a JSON object.
    pub fn parse_arguments(&self) -> std::result::Result<serde_json::Value, ToolError> {
        let raw = self.raw_arguments.trim();
        if raw.is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ToolError::MalformedArguments {
                tool_name: self.name.clone(),
                reason: e.to_string(),
            })?;
        if !value.is_object() {
            return Err(ToolError::MalformedArguments {
                tool_name: self.name.clone(),
                reason: "arguments must be a JSON object".into(),
            });
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// The result of a tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,

    /// Tool-defined payload; `Null` on failure
    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Execution details (attempts, duration, which tool actually ran)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ToolResult {
    pub fn success(data: impl Into<serde_json::Value>) -> Self {
        Self {
            status: ToolStatus::Success,
            data: data.into(),
            error: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// The text stored in the `tool` message that answers the call.
    pub fn to_content(&self) -> String {
        match self.status {
            ToolStatus::Success => match &self.data {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolStatus::Error => serde_json::json!({
                "error": self.error.as_deref().unwrap_or("tool failed"),
            })
            .to_string(),
        }
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "web_search", "calculator").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Lowercase keywords describing what this tool is good for.
    ///
    /// Used to rank tools against the user's request. Defaults to the
    /// words of the tool name.
    fn capabilities(&self) -> Vec<String> {
        self.name()
            .split(['_', '-'])
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect()
    }

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// Populated at startup, then shared read-only as `Arc<ToolRegistry>`.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    alternatives: HashMap<String, String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            alternatives: HashMap::new(),
        }
    }

    /// Register a tool. Fails if the name is already taken.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> std::result::Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> std::result::Result<Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::Unknown(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Designate `alternative` as the fallback for `primary` once its
    /// retries are exhausted. Both must already be registered.
    pub fn set_alternative(&mut self, primary: &str, alternative: &str) -> std::result::Result<(), ToolError> {
        for name in [primary, alternative] {
            if !self.tools.contains_key(name) {
                return Err(ToolError::Unknown(name.to_string()));
            }
        }
        if primary == alternative {
            return Err(ToolError::InvalidArguments(format!(
                "tool '{primary}' cannot be its own alternative"
            )));
        }
        self.alternatives.insert(primary.to_string(), alternative.to_string());
        Ok(())
    }

    pub fn alternative_for(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.alternatives
            .get(name)
            .and_then(|alt| self.tools.get(alt))
            .cloned()
    }

    /// Schemas for the provider; all tools, or only the named subset
    /// in the order given. Names not registered are skipped.
    pub fn list_schemas(&self, subset: Option<&[String]>) -> Vec<ToolDefinition> {
        match subset {
            None => self.tools.values().map(|t| t.to_definition()).collect(),
            Some(names) => names
                .iter()
                .filter_map(|n| self.tools.get(n))
                .map(|t| t.to_definition())
                .collect(),
        }
    }

    /// Registered tools in name order.
    pub fn tools(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool(&'static str);

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "Echoes back the input"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string" }
                },
                "required": ["text"]
            })
        }
        async fn execute(&self, arguments: serde_json::Value) -> std::result::Result<ToolResult, ToolError> {
            let text = arguments["text"].as_str().unwrap_or("").to_string();
            Ok(ToolResult::success(text))
        }
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool("echo"))).unwrap();
        assert!(registry.get("echo").is_ok());
        assert!(matches!(registry.get("nonexistent"), Err(ToolError::Unknown(_))));
    }

    #[test]
    fn registry_rejects_duplicate_names() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool("echo"))).unwrap();
        let err = registry.register(Arc::new(EchoTool("echo"))).unwrap_err();
        assert!(matches!(err, ToolError::Duplicate(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_schemas_respects_subset_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool("alpha"))).unwrap();
        registry.register(Arc::new(EchoTool("beta"))).unwrap();
        registry.register(Arc::new(EchoTool("gamma"))).unwrap();

        assert_eq!(registry.list_schemas(None).len(), 3);

        let subset = vec!["gamma".to_string(), "missing".to_string(), "alpha".to_string()];
        let defs = registry.list_schemas(Some(&subset));
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["gamma", "alpha"]);
    }

    #[test]
    fn alternatives_require_registered_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool("primary"))).unwrap();
        assert!(matches!(
            registry.set_alternative("primary", "backup"),
            Err(ToolError::Unknown(name)) if name == "backup"
        ));
        registry.register(Arc::new(EchoTool("backup"))).unwrap();
        registry.set_alternative("primary", "backup").unwrap();
        assert_eq!(registry.alternative_for("primary").unwrap().name(), "backup");
        assert!(registry.alternative_for("backup").is_none());
        assert!(registry.set_alternative("backup", "backup").is_err());
    }

    #[test]
    fn default_capabilities_split_the_name() {
        let tool = EchoTool("market_data");
        assert_eq!(tool.capabilities(), vec!["market", "data"]);
    }

    #[test]
    fn parse_arguments_accepts_objects_only() {
        let ok = ToolCallRequest::new("c1", "echo", r#"{"text":"hi"}"#);
        assert_eq!(ok.parse_arguments().unwrap()["text"], "hi");

        let empty = ToolCallRequest::new("c2", "echo", "  ");
        assert!(empty.parse_arguments().unwrap().as_object().unwrap().is_empty());

        let truncated = ToolCallRequest::new("c3", "echo", r#"{"text":"#);
        assert!(matches!(
            truncated.parse_arguments(),
            Err(ToolError::MalformedArguments { .. })
        ));

        let array = ToolCallRequest::new("c4", "echo", "[1,2]");
        assert!(matches!(
            array.parse_arguments(),
            Err(ToolError::MalformedArguments { .. })
        ));
    }

    #[test]
    fn tool_result_content_serialization() {
        assert_eq!(ToolResult::success("plain text").to_content(), "plain text");
        let structured = ToolResult::success(serde_json::json!({"current": 1.5}));
        assert_eq!(structured.to_content(), r#"{"current":1.5}"#);
        let failed = ToolResult::failure("timed out");
        assert_eq!(failed.to_content(), r#"{"error":"timed out"}"#);
        assert!(!failed.is_success());
    }

    #[tokio::test]
    async fn registered_tool_executes() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool("echo"))).unwrap();
        let tool = registry.get("echo").unwrap();
        let result = tool.execute(serde_json::json!({"text": "hello world"})).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.data, "hello world");
    }
}
