//! Challenge model and its status state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::RuleThresholds;

/// Lifecycle status. `Passed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    #[default]
    Active,
    Passed,
    Failed,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeStatus::Active => "active",
            ChallengeStatus::Passed => "passed",
            ChallengeStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ChallengeStatus::Active),
            "passed" => Some(ChallengeStatus::Passed),
            "failed" => Some(ChallengeStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChallengeStatus::Active)
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Terminal outcome decided by the rule evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conclusion {
    Failed { reason: String },
    Passed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("challenge is already {0}")]
pub struct AlreadyConcluded(pub ChallengeStatus);

/// One user's attempt at one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,

    /// Capital grant, fixed at creation
    pub initial_balance: Decimal,

    /// Cash balance, moved by every trade
    pub current_balance: Decimal,

    /// Last persisted mark-to-market equity
    pub equity: Decimal,

    /// Baseline for the daily loss check
    pub daily_start_equity: Decimal,

    /// Thresholds copied from the plan at creation
    #[serde(flatten)]
    pub thresholds: RuleThresholds,

    pub status: ChallengeStatus,

    /// Set iff status is failed
    pub failure_reason: Option<String>,

    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,

    /// Last time the daily baseline was rebased
    pub daily_reset_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency counter, bumped on every write
    #[serde(skip)]
    pub version: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Challenge {
    /// New active challenge funded with the plan's capital.
    pub fn new(user_id: i64, plan_id: i64, initial_balance: Decimal, thresholds: RuleThresholds) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            plan_id,
            initial_balance,
            current_balance: initial_balance,
            equity: initial_balance,
            daily_start_equity: initial_balance,
            thresholds,
            status: ChallengeStatus::Active,
            failure_reason: None,
            start_date: now,
            end_date: None,
            daily_reset_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ChallengeStatus::Active
    }

    /// Profit over initial balance in percent.
    pub fn profit_pct(&self, equity: Decimal) -> Decimal {
        if self.initial_balance <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let profit = equity.saturating_sub(self.initial_balance);
        profit
            .checked_div(self.initial_balance)
            .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
            .unwrap_or(if profit.is_sign_negative() {
                Decimal::MIN
            } else {
                Decimal::MAX
            })
    }

    /// Move an active challenge into its terminal state, stamping the final
    /// equity and end date. Terminal challenges never move again.
    pub fn conclude(
        &mut self,
        conclusion: Conclusion,
        equity: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ChallengeStatus, AlreadyConcluded> {
        if self.status.is_terminal() {
            return Err(AlreadyConcluded(self.status));
        }

        self.status = match conclusion {
            Conclusion::Failed { reason } => {
                self.failure_reason = Some(reason);
                ChallengeStatus::Failed
            }
            Conclusion::Passed => ChallengeStatus::Passed,
        };
        self.equity = equity;
        self.end_date = Some(now);
        self.updated_at = now;

        Ok(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_new_challenge_is_funded() {
        let c = Challenge::new(1, 2, dec!(5000), RuleThresholds::default());
        assert!(c.is_active());
        assert_eq!(c.current_balance, dec!(5000));
        assert_eq!(c.equity, dec!(5000));
        assert_eq!(c.daily_start_equity, dec!(5000));
        assert_eq!(c.profit_pct(dec!(5500)), dec!(10));
    }

    #[test]
    fn test_conclude_is_one_way() {
        let mut c = Challenge::new(1, 2, dec!(5000), RuleThresholds::default());
        let now = Utc::now();

        let status = c
            .conclude(Conclusion::Failed { reason: "boom".to_string() }, dec!(4400), now)
            .unwrap();
        assert_eq!(status, ChallengeStatus::Failed);
        assert_eq!(c.failure_reason.as_deref(), Some("boom"));
        assert_eq!(c.equity, dec!(4400));
        assert_eq!(c.end_date, Some(now));

        let err = c.conclude(Conclusion::Passed, dec!(6000), Utc::now()).unwrap_err();
        assert_eq!(err, AlreadyConcluded(ChallengeStatus::Failed));
        assert_eq!(c.status, ChallengeStatus::Failed);
        assert_eq!(c.equity, dec!(4400));
    }

    #[test]
    fn test_pass_leaves_no_failure_reason() {
        let mut c = Challenge::new(1, 2, dec!(5000), RuleThresholds::default());
        c.conclude(Conclusion::Passed, dec!(5500), Utc::now()).unwrap();
        assert_eq!(c.status, ChallengeStatus::Passed);
        assert!(c.failure_reason.is_none());
    }
}
