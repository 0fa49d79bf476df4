//! Calculator for challenge reports: status, leaderboard, platform stats, trade P&L.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::db::{ChallengeStanding, StatusCounts};
use crate::models::{Challenge, ChallengeStatus, Position, RuleThresholds, Trade, TradeSide};

/// Leaderboard size (passed challenges only).
pub const LEADERBOARD_SIZE: usize = 10;

/// Rankings size (all challenges).
pub const RANKINGS_SIZE: usize = 50;

/// Live view of one challenge against its thresholds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChallengeStatusReport {
    pub challenge_id: i64,
    pub status: ChallengeStatus,
    pub failure_reason: Option<String>,
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub current_equity: Decimal,
    pub daily_start_equity: Decimal,
    pub open_positions: usize,

    pub total_pnl: Decimal,
    pub total_pnl_pct: Decimal,
    pub daily_pnl: Decimal,
    pub daily_pnl_pct: Decimal,

    pub thresholds: RuleThresholds,

    /// Percentage points still needed to pass
    pub to_profit_target: Decimal,
    /// Percentage points of daily loss left before failing
    pub daily_loss_remaining: Decimal,
    /// Percentage points of total loss left before failing
    pub total_loss_remaining: Decimal,
}

/// One row of the leaderboard or rankings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: i64,
    pub username: String,
    pub challenge_id: i64,
    pub status: ChallengeStatus,
    pub initial_balance: Decimal,
    pub equity: Decimal,
    pub profit: Decimal,
    pub profit_pct: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformStats {
    pub total_challenges: i64,
    pub active_challenges: i64,
    pub passed_challenges: i64,
    pub failed_challenges: i64,
    /// Passed over concluded, in percent to one decimal
    pub pass_rate: Decimal,
    /// Sum of profit over all passed challenges
    pub total_profit: Decimal,
}

/// Trade P&L for one challenge. Realized and unrealized are kept apart:
/// buys stay open in the trade log forever, so the unrealized part comes
/// from the open positions instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeSummary {
    pub total_trades: usize,
    pub buys: usize,
    pub sells: usize,
    pub winning_sells: usize,
    pub losing_sells: usize,
    pub volume: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
}

fn percent_of(part: Decimal, whole: Decimal) -> Decimal {
    if whole <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    part.checked_div(whole)
        .and_then(|r| r.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(if part.is_sign_negative() {
            Decimal::MIN
        } else {
            Decimal::MAX
        })
}

/// Stateless report builder.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Status report at the given live equity. Amounts round to two places.
    pub fn status_report(
        challenge: &Challenge,
        equity: Decimal,
        open_positions: usize,
    ) -> ChallengeStatusReport {
        let total_pnl = equity.saturating_sub(challenge.initial_balance);
        let total_pnl_pct = percent_of(total_pnl, challenge.initial_balance);
        let daily_pnl = equity.saturating_sub(challenge.daily_start_equity);
        let daily_pnl_pct = percent_of(daily_pnl, challenge.daily_start_equity);
        let t = challenge.thresholds;

        ChallengeStatusReport {
            challenge_id: challenge.id,
            status: challenge.status,
            failure_reason: challenge.failure_reason.clone(),
            initial_balance: challenge.initial_balance,
            current_balance: challenge.current_balance.round_dp(2),
            current_equity: equity.round_dp(2),
            daily_start_equity: challenge.daily_start_equity.round_dp(2),
            open_positions,
            total_pnl: total_pnl.round_dp(2),
            total_pnl_pct: total_pnl_pct.round_dp(2),
            daily_pnl: daily_pnl.round_dp(2),
            daily_pnl_pct: daily_pnl_pct.round_dp(2),
            thresholds: t,
            to_profit_target: t.profit_target_pct.saturating_sub(total_pnl_pct).round_dp(2),
            daily_loss_remaining: t.max_daily_loss_pct.saturating_add(daily_pnl_pct).round_dp(2),
            total_loss_remaining: t.max_total_loss_pct.saturating_add(total_pnl_pct).round_dp(2),
        }
    }

    /// Rank challenges by profit percentage, best first, keeping `limit`.
    pub fn rank(mut standings: Vec<ChallengeStanding>, limit: usize) -> Vec<LeaderboardEntry> {
        let profit_pct = |s: &ChallengeStanding| percent_of(s.equity.saturating_sub(s.initial_balance), s.initial_balance);

        // Stable: ties keep challenge id order.
        standings.sort_by(|a, b| profit_pct(b).cmp(&profit_pct(a)));

        standings
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, s)| {
                let profit = s.equity.saturating_sub(s.initial_balance);
                LeaderboardEntry {
                    rank: i + 1,
                    user_id: s.user_id,
                    profit_pct: percent_of(profit, s.initial_balance).round_dp(2),
                    profit: profit.round_dp(2),
                    username: s.username,
                    challenge_id: s.challenge_id,
                    status: s.status,
                    initial_balance: s.initial_balance,
                    equity: s.equity,
                    start_date: s.start_date,
                    end_date: s.end_date,
                }
            })
            .collect()
    }

    pub fn platform_stats(counts: StatusCounts, passed: &[ChallengeStanding]) -> PlatformStats {
        let concluded = counts.passed + counts.failed;
        let pass_rate = if concluded > 0 {
            (Decimal::from(counts.passed) / Decimal::from(concluded) * Decimal::ONE_HUNDRED).round_dp(1)
        } else {
            Decimal::ZERO
        };

        let total_profit = passed
            .iter()
            .filter(|s| s.status == ChallengeStatus::Passed)
            .map(|s| s.equity - s.initial_balance)
            .sum::<Decimal>();

        PlatformStats {
            total_challenges: counts.total(),
            active_challenges: counts.active,
            passed_challenges: counts.passed,
            failed_challenges: counts.failed,
            pass_rate,
            total_profit: total_profit.round_dp(2),
        }
    }

    pub fn trade_summary(trades: &[Trade], positions: &[Position]) -> TradeSummary {
        let mut summary = TradeSummary {
            total_trades: trades.len(),
            ..Default::default()
        };

        for trade in trades {
            summary.volume += trade.notional();
            match trade.side {
                TradeSide::Buy => summary.buys += 1,
                TradeSide::Sell => {
                    summary.sells += 1;
                    let pnl = trade.realized_pnl();
                    if pnl > Decimal::ZERO {
                        summary.winning_sells += 1;
                    } else if pnl < Decimal::ZERO {
                        summary.losing_sells += 1;
                    }
                    summary.realized_pnl += pnl;
                }
            }
        }

        summary.unrealized_pnl = positions.iter().map(|p| p.unrealized_pnl).sum();
        summary.total_pnl = summary.realized_pnl + summary.unrealized_pnl;
        summary
    }
}
