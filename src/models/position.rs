//! Position model representing a challenge's open holding in one symbol.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Open position for a (challenge, symbol) pair.
///
/// A position only exists while `quantity > 0`; a fully sold position is
/// deleted rather than stored at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Row id (0 until persisted)
    pub id: i64,

    /// Owning challenge
    pub challenge_id: i64,

    /// Ticker symbol, upper-case
    pub symbol: String,

    /// Units held
    pub quantity: Decimal,

    /// Volume-weighted average entry price
    pub avg_entry_price: Decimal,

    /// Last observed mark price
    pub current_price: Decimal,

    /// (mark - avg entry) * quantity
    #[serde(default)]
    pub unrealized_pnl: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Open a new position from a first buy. Average entry and mark both
    /// start at the fill price.
    pub fn open(challenge_id: i64, symbol: String, quantity: Decimal, price: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            challenge_id,
            symbol,
            quantity,
            avg_entry_price: price,
            current_price: price,
            unrealized_pnl: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add to position (averaging in). The fill price becomes the new mark.
    /// Returns `None` and leaves the position untouched if the result does
    /// not fit a `Decimal`.
    #[must_use]
    pub fn add(&mut self, quantity: Decimal, price: Decimal) -> Option<()> {
        let total_quantity = self.quantity.checked_add(quantity)?;
        let total_cost = self
            .avg_entry_price
            .checked_mul(self.quantity)?
            .checked_add(price.checked_mul(quantity)?)?;

        let avg_entry_price = if total_quantity.is_zero() {
            self.avg_entry_price
        } else {
            total_cost.checked_div(total_quantity)?
        };
        let unrealized_pnl = unrealized(avg_entry_price, price, total_quantity)?;

        self.quantity = total_quantity;
        self.avg_entry_price = avg_entry_price;
        self.set_mark(price, unrealized_pnl);
        Some(())
    }

    /// Reduce the position at `price`, returning the realized P&L against
    /// the average entry. Callers check `quantity <= self.quantity` first.
    /// `None` on overflow, with the position untouched.
    #[must_use]
    pub fn reduce(&mut self, quantity: Decimal, price: Decimal) -> Option<Decimal> {
        let reduce_quantity = quantity.min(self.quantity);
        let realized_pnl = unrealized(self.avg_entry_price, price, reduce_quantity)?;
        let remaining = self.quantity - reduce_quantity;
        let unrealized_pnl = unrealized(self.avg_entry_price, price, remaining)?;

        self.quantity = remaining;
        self.set_mark(price, unrealized_pnl);
        Some(realized_pnl)
    }

    /// Update the mark price and recompute unrealized P&L. `None` on
    /// overflow, with the old mark kept.
    #[must_use]
    pub fn mark(&mut self, price: Decimal) -> Option<()> {
        let unrealized_pnl = unrealized(self.avg_entry_price, price, self.quantity)?;
        self.set_mark(price, unrealized_pnl);
        Some(())
    }

    fn set_mark(&mut self, price: Decimal, unrealized_pnl: Decimal) {
        self.current_price = price;
        self.unrealized_pnl = unrealized_pnl;
        self.updated_at = Utc::now();
    }

    /// Check if this position is closed.
    pub fn is_closed(&self) -> bool {
        self.quantity <= Decimal::ZERO
    }

    /// Cost basis at average entry.
    pub fn cost_basis(&self) -> Decimal {
        self.avg_entry_price.saturating_mul(self.quantity)
    }

    /// Current market value at the mark.
    pub fn market_value(&self) -> Decimal {
        self.current_price.saturating_mul(self.quantity)
    }
}

fn unrealized(avg_entry_price: Decimal, price: Decimal, quantity: Decimal) -> Option<Decimal> {
    price.checked_sub(avg_entry_price)?.checked_mul(quantity)
}
