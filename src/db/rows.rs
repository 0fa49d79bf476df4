//! Raw row shapes and their conversion into domain models.
//!
//! SQLite has no exact decimal type, so every money/quantity column is
//! stored as canonical decimal TEXT and parsed back here.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{
    Challenge, ChallengeStatus, Plan, Position, RuleThresholds, Trade, TradeSide, TradeStatus,
};

pub(crate) fn parse_decimal(value: &str, column: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal in {}: {:?}", column, value))
}

pub(crate) fn decimal_text(value: Decimal) -> String {
    value.normalize().to_string()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PlanRow {
    pub id: i64,
    pub name: String,
    pub price: String,
    pub initial_balance: String,
    pub max_daily_loss_pct: String,
    pub max_total_loss_pct: String,
    pub profit_target_pct: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PlanRow> for Plan {
    type Error = anyhow::Error;

    fn try_from(row: PlanRow) -> Result<Self> {
        Ok(Plan {
            id: row.id,
            name: row.name,
            price: parse_decimal(&row.price, "plans.price")?,
            initial_balance: parse_decimal(&row.initial_balance, "plans.initial_balance")?,
            thresholds: RuleThresholds {
                max_daily_loss_pct: parse_decimal(&row.max_daily_loss_pct, "plans.max_daily_loss_pct")?,
                max_total_loss_pct: parse_decimal(&row.max_total_loss_pct, "plans.max_total_loss_pct")?,
                profit_target_pct: parse_decimal(&row.profit_target_pct, "plans.profit_target_pct")?,
            },
            description: row.description.unwrap_or_default(),
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ChallengeRow {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    pub initial_balance: String,
    pub current_balance: String,
    pub equity: String,
    pub daily_start_equity: String,
    pub max_daily_loss_pct: String,
    pub max_total_loss_pct: String,
    pub profit_target_pct: String,
    pub status: String,
    pub failure_reason: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub daily_reset_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ChallengeRow> for Challenge {
    type Error = anyhow::Error;

    fn try_from(row: ChallengeRow) -> Result<Self> {
        let status = ChallengeStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("Invalid challenge status {:?} on challenge {}", row.status, row.id))?;

        Ok(Challenge {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            initial_balance: parse_decimal(&row.initial_balance, "challenges.initial_balance")?,
            current_balance: parse_decimal(&row.current_balance, "challenges.current_balance")?,
            equity: parse_decimal(&row.equity, "challenges.equity")?,
            daily_start_equity: parse_decimal(&row.daily_start_equity, "challenges.daily_start_equity")?,
            thresholds: RuleThresholds {
                max_daily_loss_pct: parse_decimal(&row.max_daily_loss_pct, "challenges.max_daily_loss_pct")?,
                max_total_loss_pct: parse_decimal(&row.max_total_loss_pct, "challenges.max_total_loss_pct")?,
                profit_target_pct: parse_decimal(&row.profit_target_pct, "challenges.profit_target_pct")?,
            },
            status,
            failure_reason: row.failure_reason,
            start_date: row.start_date,
            end_date: row.end_date,
            daily_reset_at: row.daily_reset_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct PositionRow {
    pub id: i64,
    pub challenge_id: i64,
    pub symbol: String,
    pub quantity: String,
    pub avg_entry_price: String,
    pub current_price: String,
    pub unrealized_pnl: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PositionRow> for Position {
    type Error = anyhow::Error;

    fn try_from(row: PositionRow) -> Result<Self> {
        Ok(Position {
            id: row.id,
            challenge_id: row.challenge_id,
            symbol: row.symbol,
            quantity: parse_decimal(&row.quantity, "positions.quantity")?,
            avg_entry_price: parse_decimal(&row.avg_entry_price, "positions.avg_entry_price")?,
            current_price: parse_decimal(&row.current_price, "positions.current_price")?,
            unrealized_pnl: parse_decimal(&row.unrealized_pnl, "positions.unrealized_pnl")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TradeRow {
    pub id: i64,
    pub challenge_id: i64,
    pub symbol: String,
    pub side: String,
    pub quantity: String,
    pub entry_price: String,
    pub exit_price: Option<String>,
    pub pnl: Option<String>,
    pub status: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TradeRow> for Trade {
    type Error = anyhow::Error;

    fn try_from(row: TradeRow) -> Result<Self> {
        let side = TradeSide::parse(&row.side)
            .ok_or_else(|| anyhow!("Invalid trade side {:?} on trade {}", row.side, row.id))?;
        let status = TradeStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("Invalid trade status {:?} on trade {}", row.status, row.id))?;

        Ok(Trade {
            id: row.id,
            challenge_id: row.challenge_id,
            symbol: row.symbol,
            side,
            quantity: parse_decimal(&row.quantity, "trades.quantity")?,
            entry_price: parse_decimal(&row.entry_price, "trades.entry_price")?,
            exit_price: row
                .exit_price
                .as_deref()
                .map(|v| parse_decimal(v, "trades.exit_price"))
                .transpose()?,
            pnl: row
                .pnl
                .as_deref()
                .map(|v| parse_decimal(v, "trades.pnl"))
                .transpose()?,
            status,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
        })
    }
}

/// A challenge joined with its owner, for rankings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeStanding {
    pub challenge_id: i64,
    pub user_id: i64,
    pub username: String,
    pub initial_balance: Decimal,
    pub equity: Decimal,
    pub status: ChallengeStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct StandingRow {
    pub challenge_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub email: String,
    pub initial_balance: String,
    pub equity: String,
    pub status: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

impl TryFrom<StandingRow> for ChallengeStanding {
    type Error = anyhow::Error;

    fn try_from(row: StandingRow) -> Result<Self> {
        let status = ChallengeStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("Invalid challenge status {:?}", row.status))?;
        let username = match row.username {
            Some(name) if !name.is_empty() => name,
            _ => row.email.split('@').next().unwrap_or(&row.email).to_string(),
        };

        Ok(ChallengeStanding {
            challenge_id: row.challenge_id,
            user_id: row.user_id,
            username,
            initial_balance: parse_decimal(&row.initial_balance, "challenges.initial_balance")?,
            equity: parse_decimal(&row.equity, "challenges.equity")?,
            status,
            start_date: row.start_date,
            end_date: row.end_date,
        })
    }
}
