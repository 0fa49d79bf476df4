//! Challenge engine: trade execution, rule evaluation and daily resets.
//!
//! Every operation on a challenge runs as one SQLite transaction, serialized
//! per challenge by an in-process lock, a row claim and a version check. A
//! lost race is retried with backoff before it is reported.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backoff::future::retry_notify;
use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::equity::calculate_equity;
use super::error::EngineError;
use super::ledger::{self, BuyFill, SellFill};
use super::locks::ChallengeLocks;
use super::rules::{self, EvaluationResult};
use crate::api::PriceOracle;
use crate::db::{self, tx, Database};
use crate::metrics::{ChallengeStatusReport, MetricsCalculator};
use crate::models::{Challenge, Plan, PlanSpec, Position, Trade, TradeSide};

/// Outcome of a buy or sell.
#[derive(Debug, Clone, Serialize)]
pub struct TradeResult {
    pub trade: Trade,
    /// The position after the fill; `None` once a sell closes it
    pub position: Option<Position>,
    /// Set for sells
    pub realized_pnl: Option<Decimal>,
    pub evaluation: EvaluationResult,
}

/// Outcome of re-marking a challenge's positions.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub positions: Vec<Position>,
    /// Symbols whose price could not be fetched; they keep their old mark
    pub stale: Vec<String>,
    pub evaluation: EvaluationResult,
}

/// Outcome of one daily reset pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResetReport {
    pub reset_count: usize,
    /// Challenges that concluded or vanished between listing and reset
    pub skipped: usize,
    pub failures: Vec<(i64, String)>,
}

/// The challenge evaluation engine.
pub struct ChallengeEngine {
    db: Database,
    oracle: Arc<dyn PriceOracle>,
    config: EngineConfig,
    locks: ChallengeLocks,
}

impl ChallengeEngine {
    pub fn new(db: Database, oracle: Arc<dyn PriceOracle>, config: EngineConfig) -> Self {
        Self {
            db,
            oracle,
            config,
            locks: ChallengeLocks::new(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ==================== Reads ====================

    /// Current equity from the stored marks.
    pub async fn calculate_equity(&self, challenge_id: i64) -> Result<Decimal, EngineError> {
        let (challenge, positions) = self.snapshot(challenge_id).await?;
        Ok(calculate_equity(challenge.current_balance, &positions))
    }

    /// Live status report: P&L against thresholds at the current equity.
    pub async fn status_report(&self, challenge_id: i64) -> Result<ChallengeStatusReport, EngineError> {
        let (challenge, positions) = self.snapshot(challenge_id).await?;
        let equity = if challenge.is_active() {
            calculate_equity(challenge.current_balance, &positions)
        } else {
            challenge.equity
        };

        Ok(MetricsCalculator::status_report(&challenge, equity, positions.len()))
    }

    /// Challenge and positions read in one transaction.
    async fn snapshot(&self, challenge_id: i64) -> Result<(Challenge, Vec<Position>), EngineError> {
        let mut tx = self.db.begin().await?;
        let challenge = tx::fetch_challenge(&mut tx, challenge_id)
            .await?
            .ok_or(EngineError::ChallengeNotFound(challenge_id))?;
        let positions = tx::fetch_positions(&mut tx, challenge_id).await?;

        Ok((challenge, positions))
    }

    // ==================== Evaluation ====================

    /// Apply the killer rules at the current equity. A no-op for challenges
    /// that already passed or failed.
    pub async fn evaluate(&self, challenge_id: i64) -> Result<EvaluationResult, EngineError> {
        let _guard = self.locks.acquire(challenge_id).await;
        self.with_retry(challenge_id, || self.try_evaluate(challenge_id)).await
    }

    async fn try_evaluate(&self, challenge_id: i64) -> Result<EvaluationResult, EngineError> {
        let mut tx = self.db.begin().await?;
        let mut challenge = claim(&mut tx, challenge_id).await?;

        if !challenge.is_active() {
            return Ok(EvaluationResult::unchanged(&challenge));
        }

        let result = evaluate_in(&mut tx, &mut challenge).await?;
        tx.commit().await.context("Failed to commit evaluation")?;

        Ok(result)
    }

    // ==================== Trades ====================

    /// Buy `quantity` of `symbol` at `price`, then evaluate.
    pub async fn execute_buy(
        &self,
        challenge_id: i64,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<TradeResult, EngineError> {
        let symbol = ledger::normalize_symbol(symbol)?;
        ledger::validate_quantity(quantity)?;
        ledger::validate_price(price)?;

        let _guard = self.locks.acquire(challenge_id).await;
        let symbol = symbol.as_str();
        let result = self
            .with_retry(challenge_id, || self.try_buy(challenge_id, symbol, quantity, price))
            .await?;

        info!(
            challenge_id,
            symbol = %symbol,
            quantity = %quantity,
            price = %price,
            status = %result.evaluation.status,
            "Buy executed"
        );

        Ok(result)
    }

    async fn try_buy(
        &self,
        challenge_id: i64,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<TradeResult, EngineError> {
        let mut tx = self.db.begin().await?;
        let mut challenge = claim(&mut tx, challenge_id).await?;
        let existing = tx::fetch_position(&mut tx, challenge_id, symbol).await?;

        let BuyFill { mut trade, mut position } =
            ledger::apply_buy(&mut challenge, existing, symbol, quantity, price)?;

        position.id = tx::upsert_position(&mut tx, &position).await?;
        trade.id = tx::insert_trade(&mut tx, &trade).await?;

        let evaluation = evaluate_in(&mut tx, &mut challenge).await?;
        tx.commit().await.context("Failed to commit buy")?;

        Ok(TradeResult {
            trade,
            position: Some(position),
            realized_pnl: None,
            evaluation,
        })
    }

    /// Sell `quantity` of `symbol` at `price`, then evaluate. Selling the
    /// whole position removes it.
    pub async fn execute_sell(
        &self,
        challenge_id: i64,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<TradeResult, EngineError> {
        let symbol = ledger::normalize_symbol(symbol)?;
        ledger::validate_quantity(quantity)?;
        ledger::validate_price(price)?;

        let _guard = self.locks.acquire(challenge_id).await;
        let symbol = symbol.as_str();
        let result = self
            .with_retry(challenge_id, || self.try_sell(challenge_id, symbol, quantity, price))
            .await?;

        info!(
            challenge_id,
            symbol = %symbol,
            quantity = %quantity,
            price = %price,
            realized_pnl = %result.realized_pnl.unwrap_or_default(),
            status = %result.evaluation.status,
            "Sell executed"
        );

        Ok(result)
    }

    async fn try_sell(
        &self,
        challenge_id: i64,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<TradeResult, EngineError> {
        let mut tx = self.db.begin().await?;
        let mut challenge = claim(&mut tx, challenge_id).await?;
        let existing = tx::fetch_position(&mut tx, challenge_id, symbol).await?;

        let SellFill {
            mut trade,
            mut position,
            realized_pnl,
        } = ledger::apply_sell(&mut challenge, existing, symbol, quantity, price)?;

        let position = if position.is_closed() {
            tx::delete_position(&mut tx, challenge_id, symbol).await?;
            None
        } else {
            position.id = tx::upsert_position(&mut tx, &position).await?;
            Some(position)
        };
        trade.id = tx::insert_trade(&mut tx, &trade).await?;

        let evaluation = evaluate_in(&mut tx, &mut challenge).await?;
        tx.commit().await.context("Failed to commit sell")?;

        Ok(TradeResult {
            trade,
            position,
            realized_pnl: Some(realized_pnl),
            evaluation,
        })
    }

    /// Market order against the user's active challenge at the oracle's
    /// current price. The price is fetched before any transaction opens.
    pub async fn place_order(
        &self,
        user_id: i64,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<TradeResult, EngineError> {
        let symbol = ledger::normalize_symbol(symbol)?;
        ledger::validate_quantity(quantity)?;

        if self.db.get_user(user_id).await?.is_none() {
            return Err(EngineError::UserNotFound(user_id));
        }
        let challenge = self
            .db
            .get_active_challenge(user_id)
            .await?
            .ok_or(EngineError::NoActiveChallenge(user_id))?;

        let quote = self.oracle.get_price(&symbol).await?;
        debug!(symbol = %symbol, price = %quote.price, source = %quote.source, "Priced order");

        match side {
            TradeSide::Buy => self.execute_buy(challenge.id, &symbol, quantity, quote.price).await,
            TradeSide::Sell => self.execute_sell(challenge.id, &symbol, quantity, quote.price).await,
        }
    }

    /// Re-mark every open position at the oracle's price, then evaluate.
    pub async fn refresh_positions(&self, challenge_id: i64) -> Result<RefreshReport, EngineError> {
        let challenge = self
            .db
            .get_challenge(challenge_id)
            .await?
            .ok_or(EngineError::ChallengeNotFound(challenge_id))?;
        if !challenge.is_active() {
            return Err(EngineError::ChallengeNotActive {
                challenge_id,
                status: challenge.status,
            });
        }

        let positions = self.db.list_positions(challenge_id).await?;
        let quotes = join_all(positions.iter().map(|p| self.oracle.get_price(&p.symbol))).await;

        let mut prices = HashMap::new();
        for (position, quote) in positions.iter().zip(quotes) {
            match quote {
                Ok(quote) => {
                    prices.insert(position.symbol.clone(), quote.price);
                }
                Err(e) => {
                    warn!(challenge_id, symbol = %position.symbol, error = %e, "Keeping previous mark");
                }
            }
        }

        let _guard = self.locks.acquire(challenge_id).await;
        let prices = &prices;
        self.with_retry(challenge_id, || self.try_refresh(challenge_id, prices))
            .await
    }

    async fn try_refresh(
        &self,
        challenge_id: i64,
        prices: &HashMap<String, Decimal>,
    ) -> Result<RefreshReport, EngineError> {
        let mut tx = self.db.begin().await?;
        let mut challenge = claim(&mut tx, challenge_id).await?;
        if !challenge.is_active() {
            return Err(EngineError::ChallengeNotActive {
                challenge_id,
                status: challenge.status,
            });
        }

        let mut positions = tx::fetch_positions(&mut tx, challenge_id).await?;
        let mut stale = Vec::new();
        for position in positions.iter_mut() {
            let marked = match prices.get(&position.symbol) {
                Some(price) if *price > Decimal::ZERO => position.mark(*price).is_some(),
                _ => false,
            };
            if marked {
                tx::upsert_position(&mut tx, position).await?;
            } else {
                stale.push(position.symbol.clone());
            }
        }

        let evaluation = evaluate_in(&mut tx, &mut challenge).await?;
        tx.commit().await.context("Failed to commit position refresh")?;

        Ok(RefreshReport {
            positions,
            stale,
            evaluation,
        })
    }

    // ==================== Daily reset ====================

    /// Rebase every active challenge's daily baseline to its current equity.
    /// Each challenge is its own transaction; failures are collected.
    pub async fn reset_daily_equity(&self) -> Result<ResetReport, EngineError> {
        let ids = self.db.active_challenge_ids().await?;
        let mut report = ResetReport::default();

        for challenge_id in ids {
            let _guard = self.locks.acquire(challenge_id).await;
            match self.with_retry(challenge_id, || self.try_reset(challenge_id)).await {
                Ok(true) => report.reset_count += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(challenge_id, error = %e, "Daily reset failed");
                    report.failures.push((challenge_id, e.to_string()));
                }
            }
        }

        info!(
            reset = report.reset_count,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Daily equity reset complete"
        );

        Ok(report)
    }

    async fn try_reset(&self, challenge_id: i64) -> Result<bool, EngineError> {
        let mut tx = self.db.begin().await?;
        if !tx::claim_challenge(&mut tx, challenge_id).await? {
            return Ok(false);
        }
        let mut challenge = match tx::fetch_challenge(&mut tx, challenge_id).await? {
            Some(challenge) if challenge.is_active() => challenge,
            _ => return Ok(false),
        };

        let positions = tx::fetch_positions(&mut tx, challenge_id).await?;
        let equity = calculate_equity(challenge.current_balance, &positions);

        challenge.daily_start_equity = equity;
        challenge.daily_reset_at = Some(Utc::now());
        save(&mut tx, &mut challenge).await?;
        tx.commit().await.context("Failed to commit daily reset")?;

        debug!(challenge_id, equity = %equity, "Daily baseline reset");
        Ok(true)
    }

    // ==================== Lifecycle ====================

    /// Start a challenge on `plan_id`, copying the plan's capital and
    /// thresholds. A user holds at most one active challenge.
    pub async fn start_challenge(&self, user_id: i64, plan_id: i64) -> Result<Challenge, EngineError> {
        if self.db.get_user(user_id).await?.is_none() {
            return Err(EngineError::UserNotFound(user_id));
        }
        let plan = self
            .db
            .get_plan(plan_id)
            .await?
            .ok_or(EngineError::PlanNotFound(plan_id))?;

        if self.db.get_active_challenge(user_id).await?.is_some() {
            return Err(EngineError::ActiveChallengeExists(user_id));
        }

        let mut challenge = Challenge::new(user_id, plan.id, plan.initial_balance, plan.thresholds);
        challenge.id = match self.db.insert_challenge(&challenge).await {
            Ok(id) => id,
            Err(e) if db::is_unique_violation(&e) => {
                return Err(EngineError::ActiveChallengeExists(user_id));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            challenge_id = challenge.id,
            user_id,
            plan = %plan.name,
            balance = %plan.initial_balance,
            "Challenge started"
        );

        Ok(challenge)
    }

    pub async fn create_plan(&self, spec: &PlanSpec) -> Result<Plan, EngineError> {
        spec.validate().map_err(EngineError::InvalidPlan)?;
        let plan = self
            .db
            .create_plan(spec)
            .await
            .map_err(|e| plan_write_error(e, spec))?;
        info!(plan_id = plan.id, name = %plan.name, "Plan created");
        Ok(plan)
    }

    /// Replace a plan's terms. Running challenges keep their thresholds.
    pub async fn update_plan(&self, plan_id: i64, spec: &PlanSpec) -> Result<Plan, EngineError> {
        spec.validate().map_err(EngineError::InvalidPlan)?;
        let plan = self
            .db
            .update_plan(plan_id, spec)
            .await
            .map_err(|e| plan_write_error(e, spec))?
            .ok_or(EngineError::PlanNotFound(plan_id))?;
        info!(plan_id, name = %plan.name, "Plan updated");
        Ok(plan)
    }

    // ==================== Retry ====================

    /// Run `op` until it succeeds, fails for a non-retryable reason, or the
    /// backoff budget runs out.
    async fn with_retry<T, F, Fut>(&self, challenge_id: i64, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        retry_notify(
            self.config.backoff(),
            || {
                let attempt = op();
                async move {
                    attempt.await.map_err(|e| {
                        if e.is_retryable() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: EngineError, wait: Duration| {
                debug!(challenge_id, error = %e, wait_ms = wait.as_millis() as u64, "Retrying");
            },
        )
        .await
    }
}

/// Plan names are unique; a clash is the caller's input, not a storage fault.
fn plan_write_error(err: anyhow::Error, spec: &PlanSpec) -> EngineError {
    if db::is_unique_violation(&err) {
        EngineError::InvalidPlan(format!("a plan named {:?} already exists", spec.name))
    } else {
        err.into()
    }
}

/// Claim the challenge row for this transaction and read it.
async fn claim(conn: &mut SqliteConnection, challenge_id: i64) -> Result<Challenge, EngineError> {
    if !tx::claim_challenge(conn, challenge_id).await? {
        return Err(EngineError::ChallengeNotFound(challenge_id));
    }

    tx::fetch_challenge(conn, challenge_id)
        .await?
        .ok_or(EngineError::ChallengeNotFound(challenge_id))
}

/// Version-checked write of the challenge row.
async fn save(conn: &mut SqliteConnection, challenge: &mut Challenge) -> Result<(), EngineError> {
    if !tx::save_challenge(conn, challenge).await? {
        return Err(EngineError::Conflict(format!(
            "challenge {} changed since it was read",
            challenge.id
        )));
    }
    Ok(())
}

/// Evaluate against the ledger as it stands in this transaction and persist
/// the challenge, including any balance change the caller made.
async fn evaluate_in(
    conn: &mut SqliteConnection,
    challenge: &mut Challenge,
) -> Result<EvaluationResult, EngineError> {
    let positions = tx::fetch_positions(conn, challenge.id).await?;
    let equity = calculate_equity(challenge.current_balance, &positions);
    let result = rules::apply(challenge, equity, Utc::now());

    save(conn, challenge).await?;

    if result.changed {
        info!(
            challenge_id = challenge.id,
            status = %result.status,
            equity = %equity,
            reason = result.reason.as_deref().unwrap_or(""),
            "Challenge concluded"
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StaticPriceOracle;
    use crate::challenge::ErrorKind;
    use crate::models::{ChallengeStatus, RuleThresholds, TradeStatus};
    use rust_decimal_macros::dec;

    struct Harness {
        engine: ChallengeEngine,
        oracle: Arc<StaticPriceOracle>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_db(Database::in_memory().await.unwrap())
        }

        fn with_db(db: Database) -> Self {
            let oracle = Arc::new(StaticPriceOracle::simulated());
            let engine = ChallengeEngine::new(db, oracle.clone(), EngineConfig::default());
            Self { engine, oracle }
        }

        /// 10 000 of capital and limits loose enough that ordinary buys
        /// never conclude the challenge.
        async fn sandbox_plan(&self) -> Plan {
            self.engine
                .create_plan(&PlanSpec {
                    name: "Sandbox".to_string(),
                    price: dec!(0),
                    initial_balance: dec!(10000),
                    thresholds: RuleThresholds {
                        max_daily_loss_pct: dec!(100),
                        max_total_loss_pct: dec!(100),
                        profit_target_pct: dec!(100),
                    },
                    description: String::new(),
                })
                .await
                .unwrap()
        }

        async fn plan(&self, balance: Decimal) -> Plan {
            self.engine
                .create_plan(&PlanSpec {
                    name: format!("Plan {}", balance),
                    price: dec!(100),
                    initial_balance: balance,
                    thresholds: RuleThresholds::default(),
                    description: String::new(),
                })
                .await
                .unwrap()
        }

        async fn start(&self, email: &str, plan: &Plan) -> Challenge {
            let user = self.engine.db().create_user(email, None, false).await.unwrap();
            self.engine.start_challenge(user.id, plan.id).await.unwrap()
        }

        async fn challenge(&self, id: i64) -> Challenge {
            self.engine.db().get_challenge(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_buys_average_entry_and_debit_balance() {
        let h = Harness::new().await;
        let plan = h.sandbox_plan().await;
        let c = h.start("a@example.com", &plan).await;

        h.engine.execute_buy(c.id, "AAPL", dec!(10), dec!(100)).await.unwrap();
        h.engine.execute_buy(c.id, "aapl", dec!(20), dec!(130)).await.unwrap();
        let result = h.engine.execute_buy(c.id, "AAPL", dec!(10), dec!(90)).await.unwrap();

        // (1000 + 2600 + 900) / 40
        let position = result.position.unwrap();
        assert_eq!(position.quantity, dec!(40));
        assert_eq!(position.avg_entry_price, dec!(112.5));
        assert_eq!(position.current_price, dec!(90));
        assert_eq!(result.trade.status, TradeStatus::Open);

        let stored = h.challenge(c.id).await;
        assert_eq!(stored.current_balance, dec!(10000) - dec!(4500));
        assert_eq!(h.engine.db().list_trades(c.id).await.unwrap().len(), 3);
        assert_eq!(h.engine.db().list_positions(c.id).await.unwrap().len(), 1);

        // Equity is cash plus unrealized: 5500 + (90 - 112.5) * 40
        assert_eq!(h.engine.calculate_equity(c.id).await.unwrap(), dec!(4600));
    }

    #[tokio::test]
    async fn test_full_sell_removes_position() {
        let h = Harness::new().await;
        let plan = h.sandbox_plan().await;
        let c = h.start("b@example.com", &plan).await;

        h.engine.execute_buy(c.id, "TSLA", dec!(5), dec!(200)).await.unwrap();
        let partial = h.engine.execute_sell(c.id, "TSLA", dec!(2), dec!(210)).await.unwrap();
        assert_eq!(partial.realized_pnl, Some(dec!(20)));
        assert_eq!(partial.position.unwrap().quantity, dec!(3));

        let closing = h.engine.execute_sell(c.id, "TSLA", dec!(3), dec!(190)).await.unwrap();
        assert_eq!(closing.realized_pnl, Some(dec!(-30)));
        assert!(closing.position.is_none());
        assert_eq!(closing.trade.entry_price, dec!(200));
        assert_eq!(closing.trade.exit_price, Some(dec!(190)));

        assert!(h.engine.db().list_positions(c.id).await.unwrap().is_empty());
        assert_eq!(h.challenge(c.id).await.current_balance, dec!(9990));

        let err = h.engine.execute_sell(c.id, "TSLA", dec!(1), dec!(190)).await.unwrap_err();
        assert!(matches!(err, EngineError::NoPosition { .. }));
    }

    #[tokio::test]
    async fn test_rejected_buy_mutates_nothing() {
        let h = Harness::new().await;
        let plan = h.sandbox_plan().await;
        let c = h.start("c@example.com", &plan).await;
        h.engine.execute_buy(c.id, "AAPL", dec!(1), dec!(100)).await.unwrap();
        let before = h.challenge(c.id).await;

        let err = h.engine.execute_buy(c.id, "AAPL", dec!(100), dec!(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert_eq!(err.kind(), ErrorKind::Precondition);

        assert_eq!(h.challenge(c.id).await, before);
        let positions = h.engine.db().list_positions(c.id).await.unwrap();
        assert_eq!(positions[0].quantity, dec!(1));
        assert_eq!(h.engine.db().list_trades(c.id).await.unwrap().len(), 1);

        let err = h.engine.execute_sell(c.id, "AAPL", dec!(2), dec!(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientPosition { .. }));
        assert_eq!(h.challenge(c.id).await, before);
    }

    #[tokio::test]
    async fn test_validation_and_missing_challenge() {
        let h = Harness::new().await;

        let err = h.engine.execute_buy(1, "AAPL", dec!(0), dec!(100)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = h.engine.execute_buy(1, "", dec!(1), dec!(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSymbol(_)));

        let err = h.engine.evaluate(999).await.unwrap_err();
        assert!(matches!(err, EngineError::ChallengeNotFound(999)));
        let err = h.engine.execute_buy(999, "AAPL", dec!(1), dec!(100)).await.unwrap_err();
        assert!(matches!(err, EngineError::ChallengeNotFound(999)));
    }

    #[tokio::test]
    async fn test_daily_loss_fails_once() {
        let h = Harness::new().await;
        let plan = h.plan(dec!(10000)).await;
        let c = h.start("d@example.com", &plan).await;

        // 4% of cash into AAPL keeps the challenge alive.
        let bought = h.engine.execute_buy(c.id, "AAPL", dec!(4), dec!(100)).await.unwrap();
        assert_eq!(bought.evaluation.status, ChallengeStatus::Active);
        assert_eq!(bought.evaluation.equity, dec!(9600));

        // Marking down 100 puts equity at exactly 9500: 5% off the baseline.
        h.oracle.set_price("AAPL", dec!(75)).await;
        let refreshed = h.engine.refresh_positions(c.id).await.unwrap();
        let evaluation = refreshed.evaluation;
        assert!(evaluation.changed);
        assert_eq!(evaluation.status, ChallengeStatus::Failed);
        assert_eq!(evaluation.equity, dec!(9500));
        let reason = evaluation.reason.clone().unwrap();
        assert!(reason.contains("5.00"));
        assert!(reason.contains("(max: 5%)"));

        let stored = h.challenge(c.id).await;
        assert_eq!(stored.status, ChallengeStatus::Failed);
        assert_eq!(stored.failure_reason, Some(reason.clone()));
        assert_eq!(stored.equity, dec!(9500));
        assert!(stored.end_date.is_some());

        // Idempotent from here on.
        let again = h.engine.evaluate(c.id).await.unwrap();
        assert!(!again.changed);
        assert_eq!(again.status, ChallengeStatus::Failed);
        assert_eq!(again.reason, Some(reason));
        assert_eq!(h.challenge(c.id).await, stored);

        let err = h.engine.execute_buy(c.id, "AAPL", dec!(1), dec!(75)).await.unwrap_err();
        assert!(matches!(err, EngineError::ChallengeNotActive { .. }));
    }

    #[tokio::test]
    async fn test_profit_target_passes() {
        let h = Harness::new().await;
        let plan = h.plan(dec!(5000)).await;
        let c = h.start("e@example.com", &plan).await;

        h.engine.execute_buy(c.id, "NVDA", dec!(2), dec!(100)).await.unwrap();

        // 4800 cash + (450 - 100) * 2 = 5500
        h.oracle.set_price("NVDA", dec!(450)).await;
        let result = h.engine.refresh_positions(c.id).await.unwrap().evaluation;

        assert!(result.changed);
        assert_eq!(result.status, ChallengeStatus::Passed);
        assert_eq!(result.profit_pct, Some(dec!(10)));
        assert_eq!(
            result.reason.as_deref(),
            Some("Profit target reached: 10.00% (target: 10%)")
        );

        let stored = h.challenge(c.id).await;
        assert_eq!(stored.status, ChallengeStatus::Passed);
        assert!(stored.failure_reason.is_none());
    }

    #[tokio::test]
    async fn test_refresh_reports_stale_symbols() {
        let h = Harness::new().await;
        let plan = h.sandbox_plan().await;
        let c = h.start("f@example.com", &plan).await;

        h.engine.execute_buy(c.id, "AAPL", dec!(1), dec!(100)).await.unwrap();
        h.engine.execute_buy(c.id, "MSFT", dec!(1), dec!(300)).await.unwrap();
        h.oracle.remove("MSFT").await;

        let report = h.engine.refresh_positions(c.id).await.unwrap();

        assert_eq!(report.stale, vec!["MSFT".to_string()]);
        let aapl = report.positions.iter().find(|p| p.symbol == "AAPL").unwrap();
        assert_eq!(aapl.current_price, dec!(178.50));
        let msft = report.positions.iter().find(|p| p.symbol == "MSFT").unwrap();
        assert_eq!(msft.current_price, dec!(300));
    }

    #[tokio::test]
    async fn test_place_order_prices_from_oracle() {
        let h = Harness::new().await;
        let plan = h.sandbox_plan().await;
        let c = h.start("g@example.com", &plan).await;

        let result = h
            .engine
            .place_order(c.user_id, "aapl", TradeSide::Buy, dec!(2))
            .await
            .unwrap();
        assert_eq!(result.trade.symbol, "AAPL");
        assert_eq!(result.trade.entry_price, dec!(178.50));

        let err = h
            .engine
            .place_order(c.user_id, "NOPE", TradeSide::Buy, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PriceNotFound(_)));

        let loner = h.engine.db().create_user("h@example.com", None, false).await.unwrap();
        let err = h
            .engine
            .place_order(loner.id, "AAPL", TradeSide::Buy, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoActiveChallenge(_)));
    }

    #[tokio::test]
    async fn test_reset_daily_equity_touches_only_active() {
        let h = Harness::new().await;
        let plan = h.plan(dec!(5000)).await;

        let first = h.start("i@example.com", &plan).await;
        let second = h.start("j@example.com", &plan).await;
        let third = h.start("k@example.com", &plan).await;
        let doomed = h.start("l@example.com", &plan).await;

        h.engine.execute_buy(first.id, "AAPL", dec!(2), dec!(100)).await.unwrap();
        h.engine.execute_buy(second.id, "AAPL", dec!(1), dec!(100)).await.unwrap();
        // 20% of cash in one go breaches the daily limit.
        let failed = h.engine.execute_buy(doomed.id, "AAPL", dec!(10), dec!(100)).await.unwrap();
        assert_eq!(failed.evaluation.status, ChallengeStatus::Failed);
        let doomed_before = h.challenge(doomed.id).await;

        let report = h.engine.reset_daily_equity().await.unwrap();

        assert_eq!(report.reset_count, 3);
        assert!(report.failures.is_empty());
        for (id, equity) in [(first.id, dec!(4800)), (second.id, dec!(4900)), (third.id, dec!(5000))] {
            let c = h.challenge(id).await;
            assert_eq!(c.daily_start_equity, equity);
            assert!(c.daily_reset_at.is_some());
            assert_eq!(c.status, ChallengeStatus::Active);
        }
        assert_eq!(h.challenge(doomed.id).await, doomed_before);
    }

    #[tokio::test]
    async fn test_reset_daily_equity_collects_failures_and_continues() {
        let h = Harness::new().await;
        let plan = h.plan(dec!(5000)).await;

        let first = h.start("n@example.com", &plan).await;
        let broken = h.start("o@example.com", &plan).await;
        let last = h.start("p@example.com", &plan).await;
        h.engine.execute_buy(last.id, "AAPL", dec!(1), dec!(100)).await.unwrap();

        let mut tx = h.engine.db().begin().await.unwrap();
        sqlx::query("UPDATE challenges SET current_balance = 'not-a-number' WHERE id = ?")
            .bind(broken.id)
            .execute(&mut *tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let report = h.engine.reset_daily_equity().await.unwrap();

        assert_eq!(report.reset_count, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, broken.id);

        for (id, equity) in [(first.id, dec!(5000)), (last.id, dec!(4900))] {
            let c = h.challenge(id).await;
            assert_eq!(c.daily_start_equity, equity);
            assert!(c.daily_reset_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_one_active_challenge_per_user() {
        let h = Harness::new().await;
        let plan = h.sandbox_plan().await;
        let c = h.start("m@example.com", &plan).await;

        let err = h.engine.start_challenge(c.user_id, plan.id).await.unwrap_err();
        assert!(matches!(err, EngineError::ActiveChallengeExists(_)));

        let err = h.engine.start_challenge(c.user_id, 999).await.unwrap_err();
        assert!(matches!(err, EngineError::PlanNotFound(999)));
        let err = h.engine.start_challenge(999, plan.id).await.unwrap_err();
        assert!(matches!(err, EngineError::UserNotFound(999)));
    }

    #[tokio::test]
    async fn test_plan_edit_keeps_running_thresholds() {
        let h = Harness::new().await;
        let plan = h.plan(dec!(5000)).await;
        let c = h.start("n@example.com", &plan).await;

        let mut spec = PlanSpec {
            name: plan.name.clone(),
            price: plan.price,
            initial_balance: dec!(8000),
            thresholds: RuleThresholds {
                max_daily_loss_pct: dec!(1),
                max_total_loss_pct: dec!(2),
                profit_target_pct: dec!(3),
            },
            description: plan.description.clone(),
        };
        let updated = h.engine.update_plan(plan.id, &spec).await.unwrap();
        assert_eq!(updated.thresholds.max_daily_loss_pct, dec!(1));

        let running = h.challenge(c.id).await;
        assert_eq!(running.thresholds, RuleThresholds::default());
        assert_eq!(running.initial_balance, dec!(5000));

        // 2% down would fail under the edited plan, not under the snapshot.
        let result = h.engine.execute_buy(c.id, "AAPL", dec!(1), dec!(100)).await.unwrap();
        assert_eq!(result.evaluation.status, ChallengeStatus::Active);

        spec.thresholds.profit_target_pct = dec!(0);
        let err = h.engine.update_plan(plan.id, &spec).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlan(_)));
    }

    #[tokio::test]
    async fn test_duplicate_plan_name_is_invalid_plan() {
        let h = Harness::new().await;
        let first = h.plan(dec!(5000)).await;
        let second = h.plan(dec!(10000)).await;

        let spec = PlanSpec {
            name: first.name.clone(),
            price: dec!(50),
            initial_balance: dec!(2000),
            thresholds: RuleThresholds::default(),
            description: String::new(),
        };

        let err = h.engine.create_plan(&spec).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlan(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = h.engine.update_plan(second.id, &spec).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidPlan(_)));

        let untouched = h.engine.db().get_plan(second.id).await.unwrap().unwrap();
        assert_eq!(untouched.name, second.name);
    }

    #[tokio::test]
    async fn test_status_report_uses_live_equity() {
        let h = Harness::new().await;
        let plan = h.plan(dec!(10000)).await;
        let c = h.start("o@example.com", &plan).await;
        h.engine.execute_buy(c.id, "AAPL", dec!(1), dec!(100)).await.unwrap();

        let report = h.engine.status_report(c.id).await.unwrap();

        assert_eq!(report.current_equity, dec!(9900));
        assert_eq!(report.total_pnl_pct, dec!(-1));
        assert_eq!(report.daily_loss_remaining, dec!(4));
        assert_eq!(report.open_positions, 1);
    }

    #[tokio::test]
    async fn test_concurrent_buys_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("engine.db").display());
        let h = Arc::new(Harness::with_db(Database::new(&url).await.unwrap()));
        let plan = h.sandbox_plan().await;
        let challenge_id = h.start("p@example.com", &plan).await.id;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move {
                    h.engine.execute_buy(challenge_id, "AAPL", dec!(1), dec!(100)).await
                })
            })
            .collect();

        for task in join_all(tasks).await {
            task.unwrap().unwrap();
        }

        let stored = h.challenge(challenge_id).await;
        assert_eq!(stored.current_balance, dec!(9200));
        assert_eq!(stored.version, 8);

        let positions = h.engine.db().list_positions(challenge_id).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(8));
        assert_eq!(h.engine.db().list_trades(challenge_id).await.unwrap().len(), 8);
    }
}
