//! Statements that run inside an engine transaction.
//!
//! Every function takes the transaction's connection (`&mut *tx`) so that
//! balance, ledger, trade and status writes commit or roll back together.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqliteConnection;

use super::rows::{decimal_text, ChallengeRow, PositionRow};
use crate::models::{Challenge, Position, Trade};

/// Take the write lock on a challenge row before reading anything else.
///
/// Returns false when the challenge does not exist.
pub async fn claim_challenge(conn: &mut SqliteConnection, challenge_id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE challenges SET version = version WHERE id = ?")
        .bind(challenge_id)
        .execute(&mut *conn)
        .await
        .context("Failed to claim challenge row")?;

    Ok(result.rows_affected() == 1)
}

pub async fn fetch_challenge(conn: &mut SqliteConnection, challenge_id: i64) -> Result<Option<Challenge>> {
    let row = sqlx::query_as::<_, ChallengeRow>("SELECT * FROM challenges WHERE id = ?")
        .bind(challenge_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch challenge")?;

    row.map(Challenge::try_from).transpose()
}

/// Persist the mutable fields of a challenge, conditional on the version
/// it was read at. Returns false if another writer got there first.
pub async fn save_challenge(conn: &mut SqliteConnection, challenge: &mut Challenge) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        UPDATE challenges SET
            current_balance = ?,
            equity = ?,
            daily_start_equity = ?,
            status = ?,
            failure_reason = ?,
            end_date = ?,
            daily_reset_at = ?,
            version = version + 1,
            updated_at = ?
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(decimal_text(challenge.current_balance))
    .bind(decimal_text(challenge.equity))
    .bind(decimal_text(challenge.daily_start_equity))
    .bind(challenge.status.as_str())
    .bind(challenge.failure_reason.as_deref())
    .bind(challenge.end_date)
    .bind(challenge.daily_reset_at)
    .bind(now)
    .bind(challenge.id)
    .bind(challenge.version)
    .execute(&mut *conn)
    .await
    .context("Failed to save challenge")?;

    if result.rows_affected() != 1 {
        return Ok(false);
    }

    challenge.version += 1;
    challenge.updated_at = now;
    Ok(true)
}

pub async fn fetch_positions(conn: &mut SqliteConnection, challenge_id: i64) -> Result<Vec<Position>> {
    let rows = sqlx::query_as::<_, PositionRow>(
        "SELECT * FROM positions WHERE challenge_id = ? ORDER BY symbol",
    )
    .bind(challenge_id)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to fetch positions")?;

    rows.into_iter().map(Position::try_from).collect()
}

pub async fn fetch_position(
    conn: &mut SqliteConnection,
    challenge_id: i64,
    symbol: &str,
) -> Result<Option<Position>> {
    let row = sqlx::query_as::<_, PositionRow>(
        "SELECT * FROM positions WHERE challenge_id = ? AND symbol = ?",
    )
    .bind(challenge_id)
    .bind(symbol)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to fetch position")?;

    row.map(Position::try_from).transpose()
}

/// Insert or overwrite the (challenge, symbol) position.
pub async fn upsert_position(conn: &mut SqliteConnection, position: &Position) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO positions (
            challenge_id, symbol, quantity, avg_entry_price, current_price,
            unrealized_pnl, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(challenge_id, symbol) DO UPDATE SET
            quantity = excluded.quantity,
            avg_entry_price = excluded.avg_entry_price,
            current_price = excluded.current_price,
            unrealized_pnl = excluded.unrealized_pnl,
            updated_at = excluded.updated_at
        RETURNING id
        "#,
    )
    .bind(position.challenge_id)
    .bind(&position.symbol)
    .bind(decimal_text(position.quantity))
    .bind(decimal_text(position.avg_entry_price))
    .bind(decimal_text(position.current_price))
    .bind(decimal_text(position.unrealized_pnl))
    .bind(position.created_at)
    .bind(position.updated_at)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to save position")?;

    Ok(id)
}

pub async fn delete_position(conn: &mut SqliteConnection, challenge_id: i64, symbol: &str) -> Result<()> {
    sqlx::query("DELETE FROM positions WHERE challenge_id = ? AND symbol = ?")
        .bind(challenge_id)
        .bind(symbol)
        .execute(&mut *conn)
        .await
        .context("Failed to delete position")?;

    Ok(())
}

/// Append a trade record.
pub async fn insert_trade(conn: &mut SqliteConnection, trade: &Trade) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO trades (
            challenge_id, symbol, side, quantity, entry_price, exit_price,
            pnl, status, opened_at, closed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(trade.challenge_id)
    .bind(&trade.symbol)
    .bind(trade.side.as_str())
    .bind(decimal_text(trade.quantity))
    .bind(decimal_text(trade.entry_price))
    .bind(trade.exit_price.map(decimal_text))
    .bind(trade.pnl.map(decimal_text))
    .bind(trade.status.as_str())
    .bind(trade.opened_at)
    .bind(trade.closed_at)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to insert trade")?;

    Ok(id)
}
