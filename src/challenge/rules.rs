//! Killer rules: daily loss, total loss, profit target.
//!
//! Checks run in that order and the first match wins, so a mark that breaches
//! both loss limits is reported as a daily-loss failure.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::{Challenge, ChallengeStatus, Conclusion, RuleThresholds};

/// What the rules say about a challenge at a given equity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Fail(String),
    Pass(String),
    Hold,
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub challenge_id: i64,
    pub status: ChallengeStatus,
    /// Failure or pass reason; the stored failure reason for terminal challenges
    pub reason: Option<String>,
    pub equity: Decimal,
    /// Profit over initial balance in percent, absent when nothing was evaluated
    pub profit_pct: Option<Decimal>,
    /// True only for the evaluation that moved the challenge out of active
    pub changed: bool,
}

impl EvaluationResult {
    /// The answer for a challenge that is already passed or failed.
    pub fn unchanged(challenge: &Challenge) -> Self {
        Self {
            challenge_id: challenge.id,
            status: challenge.status,
            reason: challenge.failure_reason.clone(),
            equity: challenge.equity,
            profit_pct: None,
            changed: false,
        }
    }
}

fn pct(value: Decimal) -> Decimal {
    value.saturating_mul(Decimal::ONE_HUNDRED).round_dp(2)
}

/// `num / den` for a positive `den`, clamped to the `Decimal` range.
fn ratio(num: Decimal, den: Decimal) -> Decimal {
    num.checked_div(den).unwrap_or(if num.is_sign_negative() {
        Decimal::MIN
    } else {
        Decimal::MAX
    })
}

/// Run the ordered checks.
pub fn check(
    thresholds: &RuleThresholds,
    initial_balance: Decimal,
    daily_start_equity: Decimal,
    equity: Decimal,
) -> Verdict {
    let hundred = Decimal::ONE_HUNDRED;

    // A non-positive baseline has no meaningful daily drawdown.
    if daily_start_equity > Decimal::ZERO {
        let daily_loss = ratio(daily_start_equity.saturating_sub(equity), daily_start_equity);
        if daily_loss >= thresholds.max_daily_loss_pct / hundred {
            return Verdict::Fail(format!(
                "Daily loss limit exceeded: {:.2}% (max: {}%)",
                pct(daily_loss),
                thresholds.max_daily_loss_pct.normalize()
            ));
        }
    }

    if initial_balance > Decimal::ZERO {
        let total_loss = ratio(initial_balance.saturating_sub(equity), initial_balance);
        if total_loss >= thresholds.max_total_loss_pct / hundred {
            return Verdict::Fail(format!(
                "Total loss limit exceeded: {:.2}% (max: {}%)",
                pct(total_loss),
                thresholds.max_total_loss_pct.normalize()
            ));
        }

        let profit = ratio(equity.saturating_sub(initial_balance), initial_balance);
        if profit >= thresholds.profit_target_pct / hundred {
            return Verdict::Pass(format!(
                "Profit target reached: {:.2}% (target: {}%)",
                pct(profit),
                thresholds.profit_target_pct.normalize()
            ));
        }
    }

    Verdict::Hold
}

/// Evaluate `challenge` at `equity` and apply the outcome to it in memory:
/// either conclude it or refresh its equity snapshot. Terminal challenges
/// are returned untouched.
pub fn apply(challenge: &mut Challenge, equity: Decimal, now: DateTime<Utc>) -> EvaluationResult {
    if !challenge.is_active() {
        return EvaluationResult::unchanged(challenge);
    }

    let profit_pct = Some(challenge.profit_pct(equity).round_dp(2));
    let verdict = check(
        &challenge.thresholds,
        challenge.initial_balance,
        challenge.daily_start_equity,
        equity,
    );

    let (conclusion, reason) = match verdict {
        Verdict::Hold => {
            challenge.equity = equity;
            return EvaluationResult {
                challenge_id: challenge.id,
                status: challenge.status,
                reason: None,
                equity,
                profit_pct,
                changed: false,
            };
        }
        Verdict::Fail(reason) => (Conclusion::Failed { reason: reason.clone() }, reason),
        Verdict::Pass(reason) => (Conclusion::Passed, reason),
    };

    // Only reachable for active challenges, so this cannot be refused.
    let status = challenge
        .conclude(conclusion, equity, now)
        .unwrap_or(challenge.status);

    EvaluationResult {
        challenge_id: challenge.id,
        status,
        reason: Some(reason),
        equity,
        profit_pct,
        changed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn thresholds(daily: Decimal, total: Decimal, target: Decimal) -> RuleThresholds {
        RuleThresholds {
            max_daily_loss_pct: daily,
            max_total_loss_pct: total,
            profit_target_pct: target,
        }
    }

    #[test]
    fn test_daily_loss_at_limit_fails() {
        let verdict = check(&thresholds(dec!(5), dec!(10), dec!(10)), dec!(10000), dec!(10000), dec!(9500));

        match verdict {
            Verdict::Fail(reason) => {
                assert!(reason.starts_with("Daily loss limit exceeded"));
                assert!(reason.contains("5.00"));
                assert!(reason.contains("(max: 5%)"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_just_under_daily_limit_holds() {
        let verdict = check(&thresholds(dec!(5), dec!(10), dec!(10)), dec!(10000), dec!(10000), dec!(9500.01));
        assert_eq!(verdict, Verdict::Hold);
    }

    #[test]
    fn test_profit_target_passes() {
        let verdict = check(&thresholds(dec!(5), dec!(10), dec!(10)), dec!(5000), dec!(5000), dec!(5500));
        assert_eq!(
            verdict,
            Verdict::Pass("Profit target reached: 10.00% (target: 10%)".to_string())
        );
    }

    #[test]
    fn test_daily_checked_before_total() {
        // 12% down on both baselines breaches both limits.
        let verdict = check(&thresholds(dec!(5), dec!(10), dec!(10)), dec!(10000), dec!(10000), dec!(8800));
        match verdict {
            Verdict::Fail(reason) => assert!(reason.starts_with("Daily loss")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_total_loss_after_daily_rebase() {
        // Down 3% today but 11% overall.
        let verdict = check(&thresholds(dec!(5), dec!(10), dec!(10)), dec!(10000), dec!(9175), dec!(8900));
        assert_eq!(
            verdict,
            Verdict::Fail("Total loss limit exceeded: 11.00% (max: 10%)".to_string())
        );
    }

    #[test]
    fn test_non_positive_baseline_skips_daily_check() {
        let verdict = check(&thresholds(dec!(5), dec!(10), dec!(10)), dec!(10000), dec!(0), dec!(9600));
        assert_eq!(verdict, Verdict::Hold);
    }

    #[test]
    fn test_extreme_equity_saturates() {
        let t = thresholds(dec!(5), dec!(10), dec!(10));
        let verdict = check(&t, dec!(0.01), dec!(0.01), Decimal::MAX);
        assert!(matches!(verdict, Verdict::Pass(_)));

        let mut challenge = Challenge::new(1, 1, dec!(0.01), t);
        let result = apply(&mut challenge, Decimal::MAX, Utc::now());
        assert_eq!(result.status, ChallengeStatus::Passed);
        assert_eq!(result.profit_pct, Some(Decimal::MAX.round_dp(2)));
    }

    #[test]
    fn test_apply_concludes_once() {
        let mut c = Challenge::new(1, 1, dec!(10000), RuleThresholds::default());
        c.id = 3;

        let first = apply(&mut c, dec!(9400), Utc::now());
        assert!(first.changed);
        assert_eq!(first.status, ChallengeStatus::Failed);
        assert_eq!(first.profit_pct, Some(dec!(-6)));
        assert_eq!(c.failure_reason, first.reason);
        assert_eq!(c.equity, dec!(9400));

        let second = apply(&mut c, dec!(12000), Utc::now());
        assert!(!second.changed);
        assert_eq!(second.status, ChallengeStatus::Failed);
        assert_eq!(second.equity, dec!(9400));
        assert_eq!(second.reason, first.reason);
    }

    #[test]
    fn test_apply_hold_refreshes_snapshot() {
        let mut c = Challenge::new(1, 1, dec!(10000), RuleThresholds::default());

        let result = apply(&mut c, dec!(10250), Utc::now());
        assert!(!result.changed);
        assert_eq!(result.status, ChallengeStatus::Active);
        assert_eq!(result.reason, None);
        assert_eq!(c.equity, dec!(10250));
        assert!(c.end_date.is_none());
    }
}
