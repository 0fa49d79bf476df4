//! Plan model: a challenge template (capital grant + risk thresholds).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Percentage thresholds the rule evaluator checks, in percent (5 = 5%).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleThresholds {
    /// Max loss from the daily-start equity before the challenge fails
    pub max_daily_loss_pct: Decimal,

    /// Max loss from the initial balance before the challenge fails
    pub max_total_loss_pct: Decimal,

    /// Gain over the initial balance that passes the challenge
    pub profit_target_pct: Decimal,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: dec!(5),
            max_total_loss_pct: dec!(10),
            profit_target_pct: dec!(10),
        }
    }
}

impl RuleThresholds {
    /// Each threshold must lie in (0, 100].
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("max_daily_loss_pct", self.max_daily_loss_pct),
            ("max_total_loss_pct", self.max_total_loss_pct),
            ("profit_target_pct", self.profit_target_pct),
        ] {
            if value <= Decimal::ZERO || value > dec!(100) {
                return Err(format!("{} must be within (0, 100], got {}", name, value));
            }
        }
        Ok(())
    }
}

/// Challenge plan offered to users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,

    /// Display name, unique
    pub name: String,

    /// Entry fee (informational, no payment handling here)
    pub price: Decimal,

    /// Virtual capital granted at challenge start
    pub initial_balance: Decimal,

    #[serde(flatten)]
    pub thresholds: RuleThresholds,

    #[serde(default)]
    pub description: String,

    pub created_at: DateTime<Utc>,
}

/// Fields for creating or replacing a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanSpec {
    pub name: String,
    pub price: Decimal,
    pub initial_balance: Decimal,
    pub thresholds: RuleThresholds,
    pub description: String,
}

impl PlanSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("plan name must not be empty".to_string());
        }
        if self.initial_balance <= Decimal::ZERO {
            return Err(format!(
                "initial balance must be positive, got {}",
                self.initial_balance
            ));
        }
        if self.price < Decimal::ZERO {
            return Err(format!("price must not be negative, got {}", self.price));
        }
        self.thresholds.validate()
    }

    /// Plans seeded into a fresh database.
    pub fn defaults() -> Vec<PlanSpec> {
        vec![
            PlanSpec {
                name: "Starter".to_string(),
                price: dec!(200),
                initial_balance: dec!(5000),
                thresholds: RuleThresholds::default(),
                description: "Perfect for beginners - Start your trading journey".to_string(),
            },
            PlanSpec {
                name: "Pro".to_string(),
                price: dec!(500),
                initial_balance: dec!(15000),
                thresholds: RuleThresholds::default(),
                description: "For experienced traders - Higher capital, bigger opportunities"
                    .to_string(),
            },
            PlanSpec {
                name: "Elite".to_string(),
                price: dec!(1000),
                initial_balance: dec!(50000),
                thresholds: RuleThresholds::default(),
                description: "For professional traders - Maximum capital and prestige".to_string(),
            },
        ]
    }
}
