//! `marlin config`: configuration management commands.

use marlin_config::{AppConfig, PersistenceKind};

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   Config parsed and validated");

            let warnings = warnings(&config);
            if warnings.is_empty() {
                println!("   All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   warning: {w}");
                }
            }

            println!();
            println!("   Provider:     {} ({})", config.provider.name, config.provider.model);
            println!("   Iterations:   {}", config.agent.max_consecutive_tool_calls);
            println!("   Top-K tools:  {}", config.agent.top_k_tools);
            println!("   Token budget: {}", config.memory.token_budget);
            println!(
                "   Completions:  {} per {}s",
                config.rate_limit.completion_limit, config.rate_limit.completion_window_secs
            );
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Settings that load fine but are probably not what the user wants.
fn warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.api_key.is_none() && !marlin_providers::KEYLESS.contains(&config.provider.name.as_str()) {
        warnings.push("No API key set (set MARLIN_API_KEY or OPENAI_API_KEY)".to_string());
    }
    if config.agent.top_k_tools > 5 {
        warnings.push(format!(
            "agent.top_k_tools = {} offers every built-in tool on each call",
            config.agent.top_k_tools
        ));
    }
    if config.memory.persistence == PersistenceKind::File && config.memory.snapshot_ttl_secs == 0 {
        warnings.push("Conversation snapshots never expire (memory.snapshot_ttl_secs = 0)".to_string());
    }
    for (primary, alternative) in &config.tools.alternatives {
        if primary == alternative {
            warnings.push(format!("Tool '{primary}' is configured as its own alternative"));
        }
    }
    warnings
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.api_key.is_some() {
        config.api_key = Some("[REDACTED]".into());
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("MARLIN_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| AppConfig::config_dir().join("config.toml"));
    println!("{}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_valid() {
        let path = AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains("config.toml"));
    }

    #[test]
    fn missing_key_is_a_warning_unless_keyless() {
        let mut config = AppConfig::default();
        assert!(warnings(&config).iter().any(|w| w.contains("API key")));

        config.provider.name = "ollama".into();
        assert!(warnings(&config).is_empty());
    }

    #[test]
    fn self_alternative_is_flagged() {
        let mut config = AppConfig::default();
        config.api_key = Some("k".into());
        config.tools.alternatives.insert("calculator".into(), "calculator".into());
        let warnings = warnings(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("own alternative"));
    }
}
