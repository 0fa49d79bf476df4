//! Database persistence for challenges and their ledgers.
//!
//! Stores everything the engine needs:
//! - Users and challenge plans
//! - Challenges with their balances, equity snapshots and status
//! - Open positions (one per challenge and symbol)
//! - The append-only trade log

mod rows;
pub mod tx;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

pub use rows::ChallengeStanding;
use rows::{decimal_text, ChallengeRow, PlanRow, PositionRow, StandingRow, TradeRow};

use crate::models::{Challenge, ChallengeStatus, Plan, PlanSpec, Position, Trade, User};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Challenge counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub active: i64,
    pub passed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.active + self.passed + self.failed
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        Self::connect(options, 5).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?;

        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let options = options.foreign_keys(true).busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.seed_default_plans().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                username TEXT,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                price TEXT NOT NULL DEFAULT '0',
                initial_balance TEXT NOT NULL,
                max_daily_loss_pct TEXT NOT NULL DEFAULT '5',
                max_total_loss_pct TEXT NOT NULL DEFAULT '10',
                profit_target_pct TEXT NOT NULL DEFAULT '10',
                description TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Thresholds are copied from the plan when the challenge starts.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS challenges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                plan_id INTEGER NOT NULL REFERENCES plans(id),
                initial_balance TEXT NOT NULL,
                current_balance TEXT NOT NULL,
                equity TEXT NOT NULL,
                daily_start_equity TEXT NOT NULL,
                max_daily_loss_pct TEXT NOT NULL,
                max_total_loss_pct TEXT NOT NULL,
                profit_target_pct TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'passed', 'failed')),
                failure_reason TEXT,
                start_date TEXT NOT NULL,
                end_date TEXT,
                daily_reset_at TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((status = 'failed') = (failure_reason IS NOT NULL))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                challenge_id INTEGER NOT NULL REFERENCES challenges(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL CHECK (CAST(quantity AS REAL) > 0),
                avg_entry_price TEXT NOT NULL,
                current_price TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL DEFAULT '0',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(challenge_id, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                challenge_id INTEGER NOT NULL REFERENCES challenges(id) ON DELETE CASCADE,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK (side IN ('buy', 'sell')),
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT,
                pnl TEXT,
                status TEXT NOT NULL CHECK (status IN ('open', 'closed')),
                opened_at TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one active challenge per user.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_challenges_one_active ON challenges(user_id) WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;

        // Terminal statuses are final.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS trg_challenges_status_terminal
            BEFORE UPDATE OF status ON challenges
            WHEN OLD.status <> 'active' AND NEW.status <> OLD.status
            BEGIN
                SELECT RAISE(ABORT, 'challenge status is terminal');
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Trades are append-only.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS trg_trades_append_only
            BEFORE UPDATE ON trades
            BEGIN
                SELECT RAISE(ABORT, 'trades are immutable');
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_challenges_status ON challenges(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_challenge ON trades(challenge_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn seed_default_plans(&self) -> Result<()> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM plans")
            .fetch_one(&self.pool)
            .await?;

        if count > 0 {
            return Ok(());
        }

        for spec in PlanSpec::defaults() {
            self.create_plan(&spec).await?;
        }
        info!("Seeded default plans");

        Ok(())
    }

    /// Start an explicit transaction. Dropping it without commit rolls back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context("Failed to begin transaction")
    }

    // ==================== Users ====================

    pub async fn create_user(&self, email: &str, username: Option<&str>, is_admin: bool) -> Result<User> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (email, username, is_admin, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(email)
        .bind(username)
        .bind(is_admin)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create user {}", email))?;

        debug!(user_id = id, email = %email, "Created user");

        self.get_user(id)
            .await?
            .context("User vanished after insert")
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")
    }

    /// Delete a user together with their challenges, positions and trades.
    pub async fn delete_user(&self, user_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete user")?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== Plans ====================

    pub async fn list_plans(&self) -> Result<Vec<Plan>> {
        let rows = sqlx::query_as::<_, PlanRow>("SELECT * FROM plans ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch plans")?;

        rows.into_iter().map(Plan::try_from).collect()
    }

    pub async fn get_plan(&self, plan_id: i64) -> Result<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>("SELECT * FROM plans WHERE id = ?")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch plan")?;

        row.map(Plan::try_from).transpose()
    }

    pub async fn create_plan(&self, spec: &PlanSpec) -> Result<Plan> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO plans (
                name, price, initial_balance, max_daily_loss_pct,
                max_total_loss_pct, profit_target_pct, description, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&spec.name)
        .bind(decimal_text(spec.price))
        .bind(decimal_text(spec.initial_balance))
        .bind(decimal_text(spec.thresholds.max_daily_loss_pct))
        .bind(decimal_text(spec.thresholds.max_total_loss_pct))
        .bind(decimal_text(spec.thresholds.profit_target_pct))
        .bind(&spec.description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create plan {}", spec.name))?;

        self.get_plan(id).await?.context("Plan vanished after insert")
    }

    /// Replace a plan's terms. Running challenges keep the thresholds they
    /// started with.
    pub async fn update_plan(&self, plan_id: i64, spec: &PlanSpec) -> Result<Option<Plan>> {
        let result = sqlx::query(
            r#"
            UPDATE plans SET
                name = ?,
                price = ?,
                initial_balance = ?,
                max_daily_loss_pct = ?,
                max_total_loss_pct = ?,
                profit_target_pct = ?,
                description = ?
            WHERE id = ?
            "#,
        )
        .bind(&spec.name)
        .bind(decimal_text(spec.price))
        .bind(decimal_text(spec.initial_balance))
        .bind(decimal_text(spec.thresholds.max_daily_loss_pct))
        .bind(decimal_text(spec.thresholds.max_total_loss_pct))
        .bind(decimal_text(spec.thresholds.profit_target_pct))
        .bind(&spec.description)
        .bind(plan_id)
        .execute(&self.pool)
        .await
        .context("Failed to update plan")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_plan(plan_id).await
    }

    // ==================== Challenges ====================

    /// Insert a new challenge. Fails with a unique violation if the user
    /// already has an active one.
    pub async fn insert_challenge(&self, challenge: &Challenge) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO challenges (
                user_id, plan_id, initial_balance, current_balance, equity,
                daily_start_equity, max_daily_loss_pct, max_total_loss_pct,
                profit_target_pct, status, start_date, version, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(challenge.user_id)
        .bind(challenge.plan_id)
        .bind(decimal_text(challenge.initial_balance))
        .bind(decimal_text(challenge.current_balance))
        .bind(decimal_text(challenge.equity))
        .bind(decimal_text(challenge.daily_start_equity))
        .bind(decimal_text(challenge.thresholds.max_daily_loss_pct))
        .bind(decimal_text(challenge.thresholds.max_total_loss_pct))
        .bind(decimal_text(challenge.thresholds.profit_target_pct))
        .bind(challenge.status.as_str())
        .bind(challenge.start_date)
        .bind(challenge.created_at)
        .bind(challenge.updated_at)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert challenge")?;

        Ok(id)
    }

    pub async fn get_challenge(&self, challenge_id: i64) -> Result<Option<Challenge>> {
        let row = sqlx::query_as::<_, ChallengeRow>("SELECT * FROM challenges WHERE id = ?")
            .bind(challenge_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch challenge")?;

        row.map(Challenge::try_from).transpose()
    }

    pub async fn get_active_challenge(&self, user_id: i64) -> Result<Option<Challenge>> {
        let row = sqlx::query_as::<_, ChallengeRow>(
            "SELECT * FROM challenges WHERE user_id = ? AND status = 'active'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch active challenge")?;

        row.map(Challenge::try_from).transpose()
    }

    /// All challenges of a user, newest first.
    pub async fn list_challenges(&self, user_id: i64) -> Result<Vec<Challenge>> {
        let rows = sqlx::query_as::<_, ChallengeRow>(
            "SELECT * FROM challenges WHERE user_id = ? ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch challenges")?;

        rows.into_iter().map(Challenge::try_from).collect()
    }

    pub async fn active_challenge_ids(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT id FROM challenges WHERE status = 'active' ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch active challenges")
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM challenges GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match ChallengeStatus::parse(&status) {
                Some(ChallengeStatus::Active) => counts.active = count,
                Some(ChallengeStatus::Passed) => counts.passed = count,
                Some(ChallengeStatus::Failed) => counts.failed = count,
                None => {}
            }
        }

        Ok(counts)
    }

    /// Challenges joined with their owners, optionally filtered by status.
    pub async fn standings(&self, status: Option<ChallengeStatus>) -> Result<Vec<ChallengeStanding>> {
        let rows = sqlx::query_as::<_, StandingRow>(
            r#"
            SELECT
                c.id AS challenge_id,
                u.id AS user_id,
                u.username,
                u.email,
                c.initial_balance,
                c.equity,
                c.status,
                c.start_date,
                c.end_date
            FROM challenges c
            JOIN users u ON u.id = c.user_id
            WHERE ? IS NULL OR c.status = ?
            ORDER BY c.id
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch standings")?;

        rows.into_iter().map(ChallengeStanding::try_from).collect()
    }

    // ==================== Ledger ====================

    pub async fn list_positions(&self, challenge_id: i64) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE challenge_id = ? ORDER BY symbol",
        )
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch positions")?;

        rows.into_iter().map(Position::try_from).collect()
    }

    /// Trade history, newest first.
    pub async fn list_trades(&self, challenge_id: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trades WHERE challenge_id = ? ORDER BY id DESC",
        )
        .bind(challenge_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch trades")?;

        rows.into_iter().map(Trade::try_from).collect()
    }
}

/// True if the error chain holds a SQLite unique-constraint violation.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<sqlx::Error>())
        .any(|e| matches!(e, sqlx::Error::Database(db) if db.is_unique_violation()))
}

/// True if the error chain holds a SQLite busy/locked error, i.e. another
/// connection won the write lock.
pub fn is_lock_contention(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<sqlx::Error>())
        .any(|e| match e {
            sqlx::Error::Database(db) => {
                let code = db.code();
                let code = code.as_deref().unwrap_or("");
                matches!(code, "5" | "6" | "261" | "262" | "517")
                    || db.message().contains("database is locked")
            }
            _ => false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleThresholds;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_migrations_seed_plans_once() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        db.seed_default_plans().await.unwrap();

        let plans = db.list_plans().await.unwrap();
        let names: Vec<_> = plans.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Starter", "Pro", "Elite"]);
        assert_eq!(plans[0].initial_balance, dec!(5000));
        assert_eq!(plans[0].thresholds, RuleThresholds::default());
    }

    #[tokio::test]
    async fn test_one_active_challenge_per_user() {
        let db = Database::in_memory().await.unwrap();
        let user = db.create_user("a@example.com", None, false).await.unwrap();

        let challenge = Challenge::new(user.id, 1, dec!(5000), RuleThresholds::default());
        db.insert_challenge(&challenge).await.unwrap();

        let err = db.insert_challenge(&challenge).await.unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn test_terminal_status_cannot_be_rewritten() {
        let db = Database::in_memory().await.unwrap();
        let user = db.create_user("b@example.com", None, false).await.unwrap();
        let challenge = Challenge::new(user.id, 1, dec!(5000), RuleThresholds::default());
        let id = db.insert_challenge(&challenge).await.unwrap();

        sqlx::query("UPDATE challenges SET status = 'passed' WHERE id = ?")
            .bind(id)
            .execute(&db.pool)
            .await
            .unwrap();

        let err = sqlx::query("UPDATE challenges SET status = 'active' WHERE id = ?")
            .bind(id)
            .execute(&db.pool)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("terminal"));
    }

    #[tokio::test]
    async fn test_zero_quantity_position_rejected() {
        let db = Database::in_memory().await.unwrap();
        let user = db.create_user("c@example.com", None, false).await.unwrap();
        let challenge = Challenge::new(user.id, 1, dec!(5000), RuleThresholds::default());
        let id = db.insert_challenge(&challenge).await.unwrap();

        let mut position = Position::open(id, "AAPL".to_string(), dec!(1), dec!(10));
        position.quantity = dec!(0);

        let mut tx = db.begin().await.unwrap();
        assert!(tx::upsert_position(&mut tx, &position).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_user_cascades() {
        let db = Database::in_memory().await.unwrap();
        let user = db.create_user("d@example.com", Some("dee"), false).await.unwrap();
        let challenge = Challenge::new(user.id, 1, dec!(5000), RuleThresholds::default());
        let id = db.insert_challenge(&challenge).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        tx::upsert_position(&mut tx, &Position::open(id, "AAPL".to_string(), dec!(1), dec!(10)))
            .await
            .unwrap();
        tx::insert_trade(&mut tx, &Trade::buy(id, "AAPL".to_string(), dec!(1), dec!(10)))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(db.delete_user(user.id).await.unwrap());
        assert!(db.get_challenge(id).await.unwrap().is_none());
        assert!(db.list_positions(id).await.unwrap().is_empty());
        assert!(db.list_trades(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_challenge_detects_stale_version() {
        let db = Database::in_memory().await.unwrap();
        let user = db.create_user("e@example.com", None, false).await.unwrap();
        let id = db
            .insert_challenge(&Challenge::new(user.id, 1, dec!(5000), RuleThresholds::default()))
            .await
            .unwrap();

        let mut first = db.get_challenge(id).await.unwrap().unwrap();
        let mut stale = first.clone();

        let mut tx = db.begin().await.unwrap();
        first.current_balance = dec!(4000);
        assert!(tx::save_challenge(&mut tx, &mut first).await.unwrap());
        assert_eq!(first.version, 1);

        stale.current_balance = dec!(3000);
        assert!(!tx::save_challenge(&mut tx, &mut stale).await.unwrap());
        tx.commit().await.unwrap();

        let stored = db.get_challenge(id).await.unwrap().unwrap();
        assert_eq!(stored.current_balance, dec!(4000));
    }
}
