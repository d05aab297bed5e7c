//! Market data tool: current and historical prices for a symbol.
//!
//! `GET {market_data_url}/price?symbol=BTC&days_ago=180` returns
//! `{"symbol", "current", "historical"}`.

use async_trait::async_trait;
use marlin_core::error::ToolError;
use marlin_core::tool::{Tool, ToolResult};
use serde::Deserialize;
use tracing::info;

use crate::client::ServiceClient;
use crate::validation::{check_limits, optional_u64, required_str};

const MAX_DAYS_AGO: u64 = 3650;
const MAX_SYMBOL_LEN: usize = 15;

pub struct MarketDataTool {
    client: ServiceClient,
}

impl MarketDataTool {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    symbol: Option<String>,
    current: f64,
    #[serde(default)]
    historical: Option<f64>,
}

fn normalize_symbol(raw: &str) -> Result<String, ToolError> {
    let symbol = raw.trim().to_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
    if !valid {
        return Err(ToolError::InvalidArguments(format!("'{raw}' is not a valid ticker symbol")));
    }
    Ok(symbol)
}

#[async_trait]
impl Tool for MarketDataTool {
    fn name(&self) -> &str {
        "market_data"
    }

    fn description(&self) -> &str {
        "Get the current price of a stock or crypto symbol and, optionally, its price a number \
         of days ago."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "Ticker symbol, e.g. 'BTC' or 'AAPL'"
                },
                "days_ago": {
                    "type": "integer",
                    "description": "Also return the price this many days ago (0 for current only)",
                    "default": 0,
                    "minimum": 0,
                    "maximum": MAX_DAYS_AGO
                }
            },
            "required": ["symbol"]
        })
    }

    fn capabilities(&self) -> Vec<String> {
        [
            "market", "price", "prices", "stock", "stocks", "crypto", "btc", "bitcoin", "eth",
            "quote", "ticker", "months", "ago", "now",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        check_limits(&arguments)?;
        let symbol = normalize_symbol(required_str(&arguments, "symbol")?)?;
        let days_ago = optional_u64(&arguments, "days_ago", 0, 0..=MAX_DAYS_AGO)?;

        info!(symbol = %symbol, days_ago, "Fetching market data");
        let response = self
            .client
            .get_json(
                self.name(),
                "/price",
                &[("symbol", symbol.clone()), ("days_ago", days_ago.to_string())],
            )
            .await?;

        let quote: Quote = serde_json::from_value(response).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().to_string(),
            reason: format!("unexpected market data response: {e}"),
        })?;

        Ok(ToolResult::success(serde_json::json!({
            "symbol": quote.symbol.unwrap_or(symbol),
            "current": quote.current,
            "historical": quote.historical,
            "days_ago": days_ago,
        })))
    }
}
