//! Price oracle capability injected into the challenge engine.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

/// A price observation for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,
    /// Change versus previous close, in percent
    pub change_pct: Option<Decimal>,
    /// Where the price came from ("yahoo", "simulated", ...)
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// The source answered but does not know the symbol
    #[error("no price available for {symbol}")]
    NotFound { symbol: String },

    /// The source could not be reached or returned garbage
    #[error("price source unavailable for {symbol}: {reason}")]
    Unavailable { symbol: String, reason: String },
}

/// Looks up current prices. No ordering guarantees between calls; callers
/// never hold a transaction open across a lookup.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<Quote, OracleError>;
}

/// Base prices for the simulated market.
const SIMULATED_PRICES: &[(&str, Decimal)] = &[
    ("AAPL", dec!(178.50)),
    ("TSLA", dec!(248.75)),
    ("MSFT", dec!(378.20)),
    ("GOOGL", dec!(141.80)),
    ("AMZN", dec!(185.60)),
    ("META", dec!(505.40)),
    ("NVDA", dec!(495.30)),
    ("BTC-USD", dec!(43500.00)),
    ("ETH-USD", dec!(2280.00)),
    ("IAM", dec!(120.50)),
    ("ATW", dec!(485.00)),
    ("BCP", dec!(268.00)),
    ("BOA", dec!(185.50)),
    ("CIH", dec!(320.00)),
    ("CDM", dec!(445.00)),
    ("LBV", dec!(4200.00)),
    ("MNG", dec!(1850.00)),
    ("TQM", dec!(1120.00)),
    ("WAA", dec!(3950.00)),
];

/// Fixed price table. Deterministic: used for tests and the simulated mode.
pub struct StaticPriceOracle {
    prices: RwLock<HashMap<String, Decimal>>,
    source: &'static str,
}

impl StaticPriceOracle {
    pub fn new(prices: HashMap<String, Decimal>) -> Self {
        Self {
            prices: RwLock::new(prices),
            source: "static",
        }
    }

    /// The built-in simulated market.
    pub fn simulated() -> Self {
        let prices = SIMULATED_PRICES
            .iter()
            .map(|(symbol, price)| (symbol.to_string(), *price))
            .collect();

        Self {
            source: "simulated",
            ..Self::new(prices)
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    #[cfg(test)]
    pub async fn remove(&self, symbol: &str) {
        self.prices.write().await.remove(symbol);
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn get_price(&self, symbol: &str) -> Result<Quote, OracleError> {
        let prices = self.prices.read().await;
        let price = prices.get(symbol).copied().ok_or_else(|| OracleError::NotFound {
            symbol: symbol.to_string(),
        })?;

        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            change_pct: None,
            source: self.source.to_string(),
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_prices() {
        let oracle = StaticPriceOracle::simulated();

        let quote = oracle.get_price("AAPL").await.unwrap();
        assert_eq!(quote.price, dec!(178.50));
        assert_eq!(quote.source, "simulated");

        let err = oracle.get_price("NOPE").await.unwrap_err();
        assert_eq!(err, OracleError::NotFound { symbol: "NOPE".to_string() });
    }

    #[tokio::test]
    async fn test_set_price_overrides() {
        let oracle = StaticPriceOracle::new(HashMap::new());
        oracle.set_price("XYZ", dec!(12.5)).await;
        assert_eq!(oracle.get_price("XYZ").await.unwrap().price, dec!(12.5));

        oracle.remove("XYZ").await;
        assert!(oracle.get_price("XYZ").await.is_err());
    }
}
