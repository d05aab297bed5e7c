//! Built-in tool implementations for marlin.
//!
//! Tools give the agent access to the outside world: web search,
//! document retrieval, vector similarity lookup, market prices and
//! arithmetic. The service-backed tools share one [`ServiceClient`]
//! per backing service.

pub mod calculator;
pub mod client;
pub mod document_search;
pub mod market_data;
pub mod validation;
pub mod vector_lookup;
pub mod web_search;

#[cfg(test)]
mod test_support;

pub use client::ServiceClient;

use marlin_config::ToolsConfig;
use marlin_core::error::ToolError;
use marlin_core::tool::ToolRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Create the default tool registry from configuration.
///
/// Registers every built-in tool, then the configured alternatives.
/// Fails if an alternative names a tool that is not registered.
pub fn default_registry(config: &ToolsConfig) -> Result<ToolRegistry, ToolError> {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    let search = ServiceClient::new(&config.search_service_url, timeout);
    let vector = ServiceClient::new(&config.vector_service_url, timeout);
    let market = ServiceClient::new(&config.market_data_url, timeout);

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(calculator::CalculatorTool))?;
    registry.register(Arc::new(web_search::WebSearchTool::new(search)))?;
    registry.register(Arc::new(document_search::DocumentSearchTool::new(
        vector.clone(),
        config.document_k,
    )))?;
    registry.register(Arc::new(vector_lookup::VectorLookupTool::new(vector)))?;
    registry.register(Arc::new(market_data::MarketDataTool::new(market)))?;

    for (primary, alternative) in &config.alternatives {
        registry.set_alternative(primary, alternative)?;
        debug!(primary = %primary, alternative = %alternative, "Tool alternative registered");
    }

    Ok(registry)
}
