//! Yahoo Finance chart client: the live price oracle.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::oracle::{OracleError, PriceOracle, Quote};
use super::types::ChartEnvelope;

const QUOTE_API_BASE: &str = "https://query1.finance.yahoo.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the chart endpoint (read-only).
pub struct QuoteClient {
    client: Client,
    base_url: String,
}

impl QuoteClient {
    /// Create a new quote client with default settings.
    pub fn new() -> Result<Self> {
        Self::with_base_url(QUOTE_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing or a proxy).
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent("Mozilla/5.0 (compatible; propdesk/0.1)")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn unavailable(symbol: &str, reason: impl ToString) -> OracleError {
        OracleError::Unavailable {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl PriceOracle for QuoteClient {
    async fn get_price(&self, symbol: &str) -> Result<Quote, OracleError> {
        let url = format!(
            "{}/v8/finance/chart/{}?range=5d&interval=1d",
            self.base_url, symbol
        );

        debug!(url = %url, "Fetching quote");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::unavailable(symbol, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(OracleError::NotFound {
                symbol: symbol.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(symbol = %symbol, status = %status, "Quote request failed");
            return Err(Self::unavailable(symbol, format!("{} - {}", status, body)));
        }

        let envelope: ChartEnvelope = response
            .json()
            .await
            .map_err(|e| Self::unavailable(symbol, format!("bad response: {}", e)))?;

        if let Some(err) = envelope.chart.error {
            debug!(
                symbol = %symbol,
                code = %err.code,
                description = %err.description,
                "Quote source reported an error"
            );
            return Err(OracleError::NotFound {
                symbol: symbol.to_string(),
            });
        }

        let meta = envelope
            .chart
            .result
            .and_then(|r| r.into_iter().next())
            .map(|r| r.meta)
            .ok_or_else(|| OracleError::NotFound {
                symbol: symbol.to_string(),
            })?;

        let price = meta
            .regular_market_price
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| OracleError::NotFound {
                symbol: symbol.to_string(),
            })?;

        let change_pct = meta
            .chart_previous_close
            .filter(|prev| !prev.is_zero())
            .map(|prev| ((price - prev) / prev * Decimal::ONE_HUNDRED).round_dp(2));

        let symbol = if meta.symbol.is_empty() {
            symbol.to_string()
        } else {
            meta.symbol
        };

        Ok(Quote {
            symbol,
            price: price.round_dp(2),
            change_pct,
            source: "yahoo".to_string(),
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_source_is_unavailable() {
        // Port 9 (discard) on localhost is not an HTTP server.
        let client = QuoteClient::with_base_url("http://127.0.0.1:9".to_string()).unwrap();

        let err = client.get_price("AAPL").await.unwrap_err();
        assert!(matches!(err, OracleError::Unavailable { .. }));
    }
}
