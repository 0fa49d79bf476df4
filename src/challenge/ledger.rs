//! Applying fills to a challenge's cash balance and position ledger.
//!
//! Everything here is pure: the engine loads the challenge and position
//! inside its transaction, calls into this module, then writes the results
//! back. A rejected order leaves both arguments untouched.

use rust_decimal::Decimal;

use super::error::EngineError;
use crate::models::{Challenge, Position, Trade};

const MAX_SYMBOL_LEN: usize = 20;

/// Outcome of a buy.
#[derive(Debug, Clone)]
pub struct BuyFill {
    pub trade: Trade,
    pub position: Position,
}

/// Outcome of a sell. The position may now be empty, in which case the
/// caller removes it instead of saving it.
#[derive(Debug, Clone)]
pub struct SellFill {
    pub trade: Trade,
    pub position: Position,
    pub realized_pnl: Decimal,
}

/// Upper-case and check a ticker symbol.
pub fn normalize_symbol(symbol: &str) -> Result<String, EngineError> {
    let symbol = symbol.trim().to_uppercase();

    let valid = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '=' | '^'));

    if valid {
        Ok(symbol)
    } else {
        Err(EngineError::InvalidSymbol(symbol))
    }
}

pub fn validate_quantity(quantity: Decimal) -> Result<(), EngineError> {
    if quantity <= Decimal::ZERO {
        return Err(EngineError::InvalidQuantity(quantity));
    }
    Ok(())
}

pub fn validate_price(price: Decimal) -> Result<(), EngineError> {
    if price <= Decimal::ZERO {
        return Err(EngineError::InvalidPrice(price));
    }
    Ok(())
}

fn ensure_active(challenge: &Challenge) -> Result<(), EngineError> {
    if !challenge.is_active() {
        return Err(EngineError::ChallengeNotActive {
            challenge_id: challenge.id,
            status: challenge.status,
        });
    }
    Ok(())
}

/// Debit the cost and average into (or open) the position.
pub fn apply_buy(
    challenge: &mut Challenge,
    existing: Option<Position>,
    symbol: &str,
    quantity: Decimal,
    price: Decimal,
) -> Result<BuyFill, EngineError> {
    ensure_active(challenge)?;
    validate_quantity(quantity)?;
    validate_price(price)?;

    let cost = quantity
        .checked_mul(price)
        .ok_or(EngineError::InvalidQuantity(quantity))?;
    if cost > challenge.current_balance {
        return Err(EngineError::InsufficientBalance {
            required: cost,
            available: challenge.current_balance,
        });
    }

    let position = match existing {
        Some(mut position) => {
            position
                .add(quantity, price)
                .ok_or(EngineError::InvalidQuantity(quantity))?;
            position
        }
        None => Position::open(challenge.id, symbol.to_string(), quantity, price),
    };

    challenge.current_balance -= cost;

    Ok(BuyFill {
        trade: Trade::buy(challenge.id, symbol.to_string(), quantity, price),
        position,
    })
}

/// Realize P&L against the average entry and credit the proceeds.
pub fn apply_sell(
    challenge: &mut Challenge,
    existing: Option<Position>,
    symbol: &str,
    quantity: Decimal,
    price: Decimal,
) -> Result<SellFill, EngineError> {
    ensure_active(challenge)?;
    validate_quantity(quantity)?;
    validate_price(price)?;

    let mut position = existing.ok_or_else(|| EngineError::NoPosition {
        symbol: symbol.to_string(),
    })?;

    if quantity > position.quantity {
        return Err(EngineError::InsufficientPosition {
            symbol: symbol.to_string(),
            requested: quantity,
            held: position.quantity,
        });
    }

    let balance = quantity
        .checked_mul(price)
        .and_then(|proceeds| challenge.current_balance.checked_add(proceeds))
        .ok_or(EngineError::InvalidPrice(price))?;

    let entry_price = position.avg_entry_price;
    let realized_pnl = position
        .reduce(quantity, price)
        .ok_or(EngineError::InvalidPrice(price))?;
    challenge.current_balance = balance;

    Ok(SellFill {
        trade: Trade::sell(
            challenge.id,
            symbol.to_string(),
            quantity,
            entry_price,
            price,
            realized_pnl,
        ),
        position,
        realized_pnl,
    })
}
