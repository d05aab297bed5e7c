//! Configuration loading, validation, and management for marlin.
//!
//! Loads configuration from `~/.marlin/config.toml` (or the file named by
//! `MARLIN_CONFIG`) with environment variable overrides. Validates all
//! settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the completion provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider", &self.provider)
            .field("agent", &self.agent)
            .field("executor", &self.executor)
            .field("memory", &self.memory)
            .field("rate_limit", &self.rate_limit)
            .field("tools", &self.tools)
            .field("logging", &self.logging)
            .finish()
    }
}

/// Completion provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name ("openai", "openrouter", "ollama", ...)
    #[serde(default = "default_provider")]
    pub name: String,

    /// Overrides the well-known base URL for `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Re-open attempts when the stream fails to open on a transport error
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_transport_retries() -> u32 {
    2
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider(),
            base_url: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            transport_retries: default_transport_retries(),
        }
    }
}

/// What the agent loop does when the completion bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    Wait,
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Completion iterations per turn before giving up
    #[serde(default = "default_max_consecutive_tool_calls")]
    pub max_consecutive_tool_calls: usize,

    /// Tool schemas offered to the provider per call
    #[serde(default = "default_top_k_tools")]
    pub top_k_tools: usize,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_rate_limit_policy")]
    pub rate_limit_policy: RateLimitPolicy,

    #[serde(default = "default_max_rate_limit_wait_secs")]
    pub max_rate_limit_wait_secs: u64,
}

fn default_max_consecutive_tool_calls() -> usize {
    10
}
fn default_top_k_tools() -> usize {
    4
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Use the available tools when they help answer the question, \
     and show your arithmetic when you compute figures from tool results."
        .into()
}
fn default_rate_limit_policy() -> RateLimitPolicy {
    RateLimitPolicy::Wait
}
fn default_max_rate_limit_wait_secs() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_consecutive_tool_calls: default_max_consecutive_tool_calls(),
            top_k_tools: default_top_k_tools(),
            system_prompt: default_system_prompt(),
            rate_limit_policy: default_rate_limit_policy(),
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
        }
    }
}

/// Tool execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Linear backoff step; attempt `n` waits `n * backoff_secs`
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    1
}
fn default_max_parallel() -> usize {
    4
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceKind {
    /// History lives only as long as the process
    None,
    /// One JSON snapshot per conversation under `snapshot_dir`
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    #[serde(default = "default_persistence")]
    pub persistence: PersistenceKind,

    /// Defaults to `~/.marlin/conversations`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,

    /// Snapshots older than this are treated as absent; 0 disables expiry
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,
}

fn default_token_budget() -> usize {
    8000
}
fn default_persistence() -> PersistenceKind {
    PersistenceKind::None
}
fn default_snapshot_ttl_secs() -> u64 {
    1800
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            persistence: default_persistence(),
            snapshot_dir: None,
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
        }
    }
}

impl MemoryConfig {
    pub fn resolved_snapshot_dir(&self) -> PathBuf {
        self.snapshot_dir
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("conversations"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Completion calls admitted per window
    #[serde(default = "default_completion_limit")]
    pub completion_limit: u32,

    #[serde(default = "default_window_secs")]
    pub completion_window_secs: u64,

    /// Per-tool limit; tools are unlimited when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_limit: Option<u32>,

    #[serde(default = "default_window_secs")]
    pub tool_window_secs: u64,
}

fn default_completion_limit() -> u32 {
    10
}
fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            completion_limit: default_completion_limit(),
            completion_window_secs: default_window_secs(),
            tool_limit: None,
            tool_window_secs: default_window_secs(),
        }
    }
}

/// Endpoints of the tool services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_search_service_url")]
    pub search_service_url: String,

    #[serde(default = "default_vector_service_url")]
    pub vector_service_url: String,

    #[serde(default = "default_market_data_url")]
    pub market_data_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Documents returned by `document_search`
    #[serde(default = "default_document_k")]
    pub document_k: u32,

    /// primary tool → alternative tried once the primary is exhausted
    #[serde(default = "default_alternatives")]
    pub alternatives: BTreeMap<String, String>,
}

fn default_search_service_url() -> String {
    "http://search-service:8002".into()
}
fn default_vector_service_url() -> String {
    "http://vector-service:8004".into()
}
fn default_market_data_url() -> String {
    "http://market-data-service:8006".into()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_document_k() -> u32 {
    3
}
fn default_alternatives() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("market_data".to_string(), "web_search".to_string()),
        ("document_search".to_string(), "vector_lookup".to_string()),
    ])
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            search_service_url: default_search_service_url(),
            vector_service_url: default_vector_service_url(),
            market_data_url: default_market_data_url(),
            request_timeout_secs: default_request_timeout_secs(),
            document_k: default_document_k(),
            alternatives: default_alternatives(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "marlin_agent=debug"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from `MARLIN_CONFIG` or `~/.marlin/config.toml`,
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("MARLIN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// API key precedence: `MARLIN_API_KEY`, then `OPENAI_API_KEY`, and
    /// only when the file set none.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("MARLIN_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(provider) = lookup("MARLIN_PROVIDER") {
            self.provider.name = provider;
        }
        if let Some(model) = lookup("MARLIN_MODEL") {
            self.provider.model = model;
        }
        if let Some(url) = lookup("SEARCH_SERVICE_URL") {
            self.tools.search_service_url = url;
        }
        if let Some(url) = lookup("VECTOR_SERVICE_URL") {
            self.tools.vector_service_url = url;
        }
        if let Some(url) = lookup("MARKET_DATA_URL") {
            self.tools.market_data_url = url;
        }
        if let Some(limit) = lookup("RATE_LIMIT_CHAT_COMPLETION").and_then(|v| v.parse().ok()) {
            self.rate_limit.completion_limit = limit;
        }
        if let Some(window) = lookup("WINDOW_CHAT_COMPLETION").and_then(|v| v.parse().ok()) {
            self.rate_limit.completion_window_secs = window;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if lookup("APP_ENV").is_some_and(|env| env.eq_ignore_ascii_case("production")) {
            self.logging.json = true;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".marlin")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.agent.max_consecutive_tool_calls == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_consecutive_tool_calls must be at least 1".into(),
            ));
        }
        if self.agent.top_k_tools == 0 {
            return Err(ConfigError::ValidationError("agent.top_k_tools must be at least 1".into()));
        }
        if self.executor.max_attempts == 0 || self.executor.max_parallel == 0 {
            return Err(ConfigError::ValidationError(
                "executor.max_attempts and executor.max_parallel must be at least 1".into(),
            ));
        }
        if self.executor.timeout_secs == 0 {
            return Err(ConfigError::ValidationError("executor.timeout_secs must be > 0".into()));
        }
        if self.memory.token_budget == 0 {
            return Err(ConfigError::ValidationError("memory.token_budget must be > 0".into()));
        }
        if self.rate_limit.completion_limit == 0 || self.rate_limit.completion_window_secs == 0 {
            return Err(ConfigError::ValidationError(
                "rate_limit.completion_limit and completion_window_secs must be > 0".into(),
            ));
        }
        if self.rate_limit.tool_limit == Some(0) || self.rate_limit.tool_window_secs == 0 {
            return Err(ConfigError::ValidationError(
                "rate_limit.tool_limit and tool_window_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: ProviderConfig::default(),
            agent: AgentConfig::default(),
            executor: ExecutorConfig::default(),
            memory: MemoryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            tools: ToolsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.max_consecutive_tool_calls, 10);
        assert_eq!(config.executor.timeout_secs, 10);
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.rate_limit.completion_limit, 10);
        assert_eq!(config.rate_limit.completion_window_secs, 60);
        assert_eq!(config.tools.alternatives["market_data"], "web_search");
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.provider.name, config.provider.name);
        assert_eq!(parsed.memory.token_budget, config.memory.token_budget);
        assert_eq!(parsed.agent.rate_limit_policy, RateLimitPolicy::Wait);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.provider.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_budgets_rejected() {
        let mut config = AppConfig::default();
        config.memory.token_budget = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = AppConfig::default();
        config.agent.max_consecutive_tool_calls = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rate_limit.tool_limit = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.provider.name, "openai");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[agent]
max_consecutive_tool_calls = 2
rate_limit_policy = "fail_fast"

[memory]
persistence = "file"
token_budget = 500
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.agent.max_consecutive_tool_calls, 2);
        assert_eq!(config.agent.rate_limit_policy, RateLimitPolicy::FailFast);
        assert_eq!(config.agent.top_k_tools, 4);
        assert_eq!(config.memory.persistence, PersistenceKind::File);
        assert_eq!(config.memory.token_budget, 500);
        assert_eq!(config.executor.max_parallel, 4);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent\nmax = ").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-env"),
            ("MARLIN_MODEL", "gpt-4o"),
            ("SEARCH_SERVICE_URL", "http://localhost:9002"),
            ("RATE_LIMIT_CHAT_COMPLETION", "25"),
            ("WINDOW_CHAT_COMPLETION", "not-a-number"),
            ("LOG_LEVEL", "DEBUG"),
            ("APP_ENV", "production"),
        ]);
        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.provider.model, "gpt-4o");
        assert_eq!(config.tools.search_service_url, "http://localhost:9002");
        assert_eq!(config.rate_limit.completion_limit, 25);
        assert_eq!(config.rate_limit.completion_window_secs, 60);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn file_api_key_wins_over_env() {
        let mut config = AppConfig {
            api_key: Some("sk-file".into()),
            ..AppConfig::default()
        };
        config.apply_env(|k| (k == "MARLIN_API_KEY").then(|| "sk-env".to_string()));
        assert_eq!(config.api_key.as_deref(), Some("sk-file"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
