//! Completion provider implementations for marlin.
//!
//! All providers implement the `marlin_core::Provider` trait.
//! [`build_from_config`] picks the implementation for the configured name.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use marlin_config::AppConfig;
use marlin_core::Provider;
use marlin_core::error::ProviderError;
use std::sync::Arc;

/// Providers that run locally and accept any key.
pub const KEYLESS: &[&str] = &["ollama", "vllm", "llamacpp", "llama.cpp"];

/// Build the configured provider.
pub fn build_from_config(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = config.provider.name.as_str();
    let base_url = config
        .provider
        .base_url
        .clone()
        .unwrap_or_else(|| default_base_url(name));

    let api_key = match (&config.api_key, KEYLESS.contains(&name)) {
        (Some(key), _) => key.clone(),
        (None, true) => name.to_string(),
        (None, false) => {
            return Err(ProviderError::NotConfigured(format!(
                "no API key for provider '{name}' (set MARLIN_API_KEY or OPENAI_API_KEY)"
            )));
        }
    };

    Ok(Arc::new(OpenAiCompatProvider::new(name, base_url, api_key)))
}

/// Get the default base URL for well-known providers.
pub fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openai" => "https://api.openai.com/v1".into(),
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}
