use rust_decimal::Decimal;

use crate::models::Position;

/// Cash balance plus the stored unrealized P&L of every open position.
/// Never fetches prices; marks are whatever was last written. Saturates at
/// the `Decimal` range.
pub fn calculate_equity(balance: Decimal, positions: &[Position]) -> Decimal {
    positions
        .iter()
        .fold(balance, |equity, p| equity.saturating_add(p.unrealized_pnl))
}
