//! Trade model: immutable execution records appended per challenge.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Some(TradeSide::Buy),
            "sell" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Whether a trade lot is still open (buys) or closed (sells).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(TradeStatus::Open),
            "closed" => Some(TradeStatus::Closed),
            _ => None,
        }
    }
}

/// One execution against a challenge. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Row id (0 until persisted)
    pub id: i64,

    pub challenge_id: i64,

    pub symbol: String,

    pub side: TradeSide,

    pub quantity: Decimal,

    /// Fill price for buys; pre-trade average entry for sells
    pub entry_price: Decimal,

    /// Fill price, sells only
    pub exit_price: Option<Decimal>,

    /// Realized P&L, sells only
    pub pnl: Option<Decimal>,

    pub status: TradeStatus,

    pub opened_at: DateTime<Utc>,

    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Record a buy as an open lot.
    pub fn buy(challenge_id: i64, symbol: String, quantity: Decimal, price: Decimal) -> Self {
        Self {
            id: 0,
            challenge_id,
            symbol,
            side: TradeSide::Buy,
            quantity,
            entry_price: price,
            exit_price: None,
            pnl: None,
            status: TradeStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    /// Record a sell as a closed lot against the position's average entry.
    pub fn sell(
        challenge_id: i64,
        symbol: String,
        quantity: Decimal,
        avg_entry_price: Decimal,
        exit_price: Decimal,
        realized_pnl: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            challenge_id,
            symbol,
            side: TradeSide::Sell,
            quantity,
            entry_price: avg_entry_price,
            exit_price: Some(exit_price),
            pnl: Some(realized_pnl),
            status: TradeStatus::Closed,
            opened_at: now,
            closed_at: Some(now),
        }
    }

    /// Cash moved by this trade (always positive).
    pub fn notional(&self) -> Decimal {
        self.quantity * self.exit_price.unwrap_or(self.entry_price)
    }

    /// Realized P&L, zero for open lots.
    pub fn realized_pnl(&self) -> Decimal {
        self.pnl.unwrap_or(Decimal::ZERO)
    }
}
