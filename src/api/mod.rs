//! Market data: the price oracle capability and its implementations.

mod oracle;
mod quote_client;
mod types;

pub use oracle::{OracleError, PriceOracle, Quote, StaticPriceOracle};
pub use quote_client::QuoteClient;
