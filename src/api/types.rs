//! API response types for the Yahoo Finance chart endpoint.

use rust_decimal::Decimal;
use serde::Deserialize;

/// Envelope of /v8/finance/chart/{symbol}.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartEnvelope {
    pub chart: ChartResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartResponse {
    #[serde(default)]
    pub result: Option<Vec<ChartResult>>,
    #[serde(default)]
    pub error: Option<ChartError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartResult {
    pub meta: ChartMeta,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMeta {
    #[serde(default)]
    pub symbol: String,
    pub regular_market_price: Option<Decimal>,
    #[serde(default)]
    pub chart_previous_close: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
}
