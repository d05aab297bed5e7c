//! `marlin tools`: list registered tools.

use marlin_config::AppConfig;
use marlin_core::tool::ToolRegistry;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let registry = marlin_tools::default_registry(&config.tools)?;
    print!("{}", render(&registry));
    Ok(())
}

fn render(registry: &ToolRegistry) -> String {
    let mut out = format!("Registered tools ({})\n\n", registry.len());
    for tool in registry.tools() {
        out.push_str(&format!("  {}\n", tool.name()));
        out.push_str(&format!("    {}\n", tool.description()));
        out.push_str(&format!("    capabilities: {}\n", tool.capabilities().join(", ")));
        if let Some(alternative) = registry.alternative_for(tool.name()) {
            out.push_str(&format!("    alternative:  {}\n", alternative.name()));
        }
        out.push('\n');
    }
    out
}
