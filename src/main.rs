//! Prop-Trading Challenge Desk
//!
//! Runs simulated funding challenges: users trade virtual capital and are
//! passed or failed automatically against daily loss, total loss and profit
//! target rules.

mod api;
mod challenge;
mod db;
mod metrics;
mod models;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{PriceOracle, QuoteClient, StaticPriceOracle};
use crate::challenge::{
    ChallengeEngine, DailyResetScheduler, EngineConfig, EngineError, ErrorKind, EvaluationResult,
    SchedulerConfig,
};
use crate::db::Database;
use crate::metrics::{MetricsCalculator, LEADERBOARD_SIZE, RANKINGS_SIZE};
use crate::models::{ChallengeStatus, PlanSpec, RuleThresholds, TradeSide};

/// Where market prices come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PriceSource {
    /// Fixed built-in price table
    Simulated,
    /// Yahoo Finance chart API
    Yahoo,
}

/// Prop-trading challenge engine CLI.
#[derive(Parser)]
#[command(name = "propdesk")]
#[command(about = "Evaluate prop-trading challenges against killer rules", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "PROPDESK_DATABASE_URL", default_value = "sqlite:./propdesk.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, env = "PROPDESK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Price source for market orders and position refreshes
    #[arg(long, env = "PROPDESK_PRICE_SOURCE", value_enum, default_value = "simulated")]
    price_source: PriceSource,

    /// Base URL of the quote API (Yahoo source only)
    #[arg(long, env = "PROPDESK_QUOTE_URL")]
    quote_url: Option<String>,

    /// Pin a simulated price, e.g. --pin AAPL=180.25 (repeatable)
    #[arg(long = "pin", value_parser = parse_pin)]
    pins: Vec<(String, Decimal)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List challenge plans
    Plans,

    /// Create a plan (admin only)
    CreatePlan {
        /// Acting user id, must be an admin
        #[arg(long)]
        as_user: i64,

        /// Plan name
        name: String,

        /// Virtual capital granted at start
        #[arg(short, long)]
        balance: Decimal,

        /// Entry fee
        #[arg(short, long, default_value = "0")]
        price: Decimal,

        /// Max daily loss in percent
        #[arg(long, default_value = "5")]
        max_daily_loss: Decimal,

        /// Max total loss in percent
        #[arg(long, default_value = "10")]
        max_total_loss: Decimal,

        /// Profit target in percent
        #[arg(long, default_value = "10")]
        profit_target: Decimal,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// Change a plan's terms (admin only). Running challenges are unaffected.
    UpdatePlan {
        /// Acting user id, must be an admin
        #[arg(long)]
        as_user: i64,

        plan_id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(short, long)]
        balance: Option<Decimal>,

        #[arg(short, long)]
        price: Option<Decimal>,

        #[arg(long)]
        max_daily_loss: Option<Decimal>,

        #[arg(long)]
        max_total_loss: Option<Decimal>,

        #[arg(long)]
        profit_target: Option<Decimal>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Register a user
    Register {
        email: String,

        #[arg(short, long)]
        username: Option<String>,

        /// Grant plan administration rights
        #[arg(long)]
        admin: bool,
    },

    /// Delete a user with all their challenges, positions and trades
    DeleteUser { user_id: i64 },

    /// Start a challenge for a user on a plan
    Start { user_id: i64, plan_id: i64 },

    /// List a user's challenges
    Challenges { user_id: i64 },

    /// Show a user's active challenge
    Active { user_id: i64 },

    /// Live status report for a challenge
    Status { challenge_id: i64 },

    /// Buy on the user's active challenge
    Buy {
        user_id: i64,
        symbol: String,
        quantity: Decimal,

        /// Fill at this price instead of the current quote
        #[arg(long)]
        price: Option<Decimal>,
    },

    /// Sell on the user's active challenge
    Sell {
        user_id: i64,
        symbol: String,
        quantity: Decimal,

        /// Fill at this price instead of the current quote
        #[arg(long)]
        price: Option<Decimal>,
    },

    /// Show open positions, re-marked at current prices
    Positions {
        challenge_id: i64,

        /// Show stored marks without fetching prices
        #[arg(long)]
        no_refresh: bool,
    },

    /// Trade history and P&L summary
    Trades { challenge_id: i64 },

    /// Evaluate a challenge's rules now
    Evaluate { challenge_id: i64 },

    /// Rebase every active challenge's daily baseline once
    ResetDaily,

    /// Run the daily reset every day at a fixed local time
    Scheduler {
        /// Local wall-clock time (HH:MM)
        #[arg(long, env = "PROPDESK_RESET_TIME", default_value = "09:30", value_parser = parse_time)]
        reset_time: NaiveTime,
    },

    /// Look up a price
    Quote { symbol: String },

    /// Top passed challenges by profit
    Leaderboard,

    /// All challenges by profit
    Rankings,

    /// Platform statistics
    Stats,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize database
    let db = Database::new(&cli.database).await?;

    // Initialize price source and engine
    let oracle = build_oracle(&cli).await?;
    let engine = Arc::new(ChallengeEngine::new(db.clone(), oracle.clone(), EngineConfig::default()));

    match cli.command {
        Commands::Plans => {
            let plans = db.list_plans().await?;

            println!(
                "\n{:<4} {:<16} {:>10} {:>12} {:>8} {:>8} {:>8}",
                "ID", "NAME", "FEE", "BALANCE", "DAILY%", "TOTAL%", "TARGET%"
            );
            println!("{}", "-".repeat(72));

            for plan in plans {
                let t = plan.thresholds;
                println!(
                    "{:<4} {:<16} {:>10} {:>12} {:>8} {:>8} {:>8}",
                    plan.id,
                    truncate(&plan.name, 16),
                    plan.price.normalize(),
                    plan.initial_balance.normalize(),
                    t.max_daily_loss_pct.normalize(),
                    t.max_total_loss_pct.normalize(),
                    t.profit_target_pct.normalize()
                );
                if !plan.description.is_empty() {
                    println!("     {}", plan.description);
                }
            }
        }

        Commands::CreatePlan {
            as_user,
            name,
            balance,
            price,
            max_daily_loss,
            max_total_loss,
            profit_target,
            description,
        } => {
            require_admin(&db, as_user).await?;

            let spec = PlanSpec {
                name,
                price,
                initial_balance: balance,
                thresholds: RuleThresholds {
                    max_daily_loss_pct: max_daily_loss,
                    max_total_loss_pct: max_total_loss,
                    profit_target_pct: profit_target,
                },
                description,
            };
            let plan = engine.create_plan(&spec).await?;

            println!("Created plan {} ({})", plan.id, plan.name);
        }

        Commands::UpdatePlan {
            as_user,
            plan_id,
            name,
            balance,
            price,
            max_daily_loss,
            max_total_loss,
            profit_target,
            description,
        } => {
            require_admin(&db, as_user).await?;

            let current = db
                .get_plan(plan_id)
                .await?
                .ok_or(EngineError::PlanNotFound(plan_id))?;
            let t = current.thresholds;

            let spec = PlanSpec {
                name: name.unwrap_or(current.name),
                price: price.unwrap_or(current.price),
                initial_balance: balance.unwrap_or(current.initial_balance),
                thresholds: RuleThresholds {
                    max_daily_loss_pct: max_daily_loss.unwrap_or(t.max_daily_loss_pct),
                    max_total_loss_pct: max_total_loss.unwrap_or(t.max_total_loss_pct),
                    profit_target_pct: profit_target.unwrap_or(t.profit_target_pct),
                },
                description: description.unwrap_or(current.description),
            };
            let plan = engine.update_plan(plan_id, &spec).await?;

            println!("Updated plan {} ({})", plan.id, plan.name);
            println!("Running challenges keep the thresholds they started with.");
        }

        Commands::Register {
            email,
            username,
            admin,
        } => {
            let user = db.create_user(&email, username.as_deref(), admin).await?;
            println!(
                "Registered user {} ({}){}",
                user.id,
                user.display_name(),
                if user.is_admin { " [admin]" } else { "" }
            );
        }

        Commands::DeleteUser { user_id } => {
            if !db.delete_user(user_id).await? {
                return Err(EngineError::UserNotFound(user_id).into());
            }
            println!("Deleted user {} and all their challenges", user_id);
        }

        Commands::Start { user_id, plan_id } => {
            let challenge = engine.start_challenge(user_id, plan_id).await?;

            println!("\n=== Challenge {} started ===", challenge.id);
            println!("Balance:          ${}", challenge.initial_balance.normalize());
            println!("Max Daily Loss:   {}%", challenge.thresholds.max_daily_loss_pct.normalize());
            println!("Max Total Loss:   {}%", challenge.thresholds.max_total_loss_pct.normalize());
            println!("Profit Target:    {}%", challenge.thresholds.profit_target_pct.normalize());
        }

        Commands::Challenges { user_id } => {
            let challenges = db.list_challenges(user_id).await?;

            if challenges.is_empty() {
                println!("No challenges. Use 'propdesk start <user_id> <plan_id>' to begin one.");
                return Ok(());
            }

            println!(
                "\n{:<6} {:<6} {:<8} {:>12} {:>12} {:>9}  {}",
                "ID", "PLAN", "STATUS", "BALANCE", "EQUITY", "PROFIT%", "STARTED"
            );
            println!("{}", "-".repeat(76));

            for c in challenges {
                println!(
                    "{:<6} {:<6} {:<8} {:>12.2} {:>12.2} {:>8.2}%  {}",
                    c.id,
                    c.plan_id,
                    c.status,
                    c.current_balance,
                    c.equity,
                    c.profit_pct(c.equity),
                    c.start_date.format("%Y-%m-%d")
                );
            }
        }

        Commands::Active { user_id } => {
            let challenge = db
                .get_active_challenge(user_id)
                .await?
                .ok_or(EngineError::NoActiveChallenge(user_id))?;
            print_status(&engine, challenge.id).await?;
        }

        Commands::Status { challenge_id } => {
            print_status(&engine, challenge_id).await?;
        }

        Commands::Buy {
            user_id,
            symbol,
            quantity,
            price,
        } => {
            place(&engine, &db, user_id, &symbol, TradeSide::Buy, quantity, price).await?;
        }

        Commands::Sell {
            user_id,
            symbol,
            quantity,
            price,
        } => {
            place(&engine, &db, user_id, &symbol, TradeSide::Sell, quantity, price).await?;
        }

        Commands::Positions {
            challenge_id,
            no_refresh,
        } => {
            let challenge = db
                .get_challenge(challenge_id)
                .await?
                .ok_or(EngineError::ChallengeNotFound(challenge_id))?;

            let positions = if challenge.is_active() && !no_refresh {
                let report = engine.refresh_positions(challenge_id).await?;
                for symbol in &report.stale {
                    println!("warning: no price for {}, showing last mark", symbol);
                }
                print_evaluation(&report.evaluation);
                report.positions
            } else {
                db.list_positions(challenge_id).await?
            };

            if positions.is_empty() {
                println!("No open positions.");
                return Ok(());
            }

            println!(
                "\n{:<10} {:>10} {:>12} {:>12} {:>14} {:>14} {:>12}",
                "SYMBOL", "QTY", "AVG ENTRY", "MARK", "COST", "MKT VALUE", "UNREAL P&L"
            );
            println!("{}", "-".repeat(90));

            for pos in &positions {
                println!(
                    "{:<10} {:>10} {:>12.2} {:>12.2} {:>14.2} {:>14.2} {:>12.2}",
                    pos.symbol,
                    pos.quantity.normalize(),
                    pos.avg_entry_price,
                    pos.current_price,
                    pos.cost_basis(),
                    pos.market_value(),
                    pos.unrealized_pnl
                );
            }
        }

        Commands::Trades { challenge_id } => {
            if db.get_challenge(challenge_id).await?.is_none() {
                return Err(EngineError::ChallengeNotFound(challenge_id).into());
            }
            let trades = db.list_trades(challenge_id).await?;
            let positions = db.list_positions(challenge_id).await?;

            println!(
                "\n{:<6} {:<19} {:<4} {:<10} {:>10} {:>10} {:>10} {:>10}",
                "ID", "TIME", "SIDE", "SYMBOL", "QTY", "ENTRY", "EXIT", "P&L"
            );
            println!("{}", "-".repeat(86));

            for trade in &trades {
                println!(
                    "{:<6} {:<19} {:<4} {:<10} {:>10} {:>10.2} {:>10} {:>10}",
                    trade.id,
                    trade.opened_at.format("%Y-%m-%d %H:%M:%S"),
                    trade.side.as_str(),
                    trade.symbol,
                    trade.quantity.normalize(),
                    trade.entry_price,
                    trade.exit_price.map(|p| format!("{:.2}", p)).unwrap_or_default(),
                    trade.pnl.map(|p| format!("{:.2}", p)).unwrap_or_default()
                );
            }

            let summary = MetricsCalculator::trade_summary(&trades, &positions);
            println!("\n--- Summary ---");
            println!("Trades:           {} ({} buys, {} sells)", summary.total_trades, summary.buys, summary.sells);
            println!("Winning/Losing:   {}/{}", summary.winning_sells, summary.losing_sells);
            println!("Volume:           ${:.2}", summary.volume);
            println!("Realized P&L:     ${:.2}", summary.realized_pnl);
            println!("Unrealized P&L:   ${:.2}", summary.unrealized_pnl);
            println!("Total P&L:        ${:.2}", summary.total_pnl);
        }

        Commands::Evaluate { challenge_id } => {
            let result = engine.evaluate(challenge_id).await?;
            print_evaluation(&result);
            if !result.changed && result.status == ChallengeStatus::Active {
                println!("Challenge {} remains active at ${:.2}", challenge_id, result.equity);
            }
        }

        Commands::ResetDaily => {
            let report = engine.reset_daily_equity().await?;

            println!("Reset {} challenge(s), skipped {}", report.reset_count, report.skipped);
            for (id, error) in &report.failures {
                println!("  challenge {}: {}", id, error);
            }
        }

        Commands::Scheduler { reset_time } => {
            info!(reset_time = %reset_time, "Starting daily reset scheduler");

            println!("\n=== Daily Reset Scheduler ===");
            println!("Reset time: {} (local)", reset_time.format("%H:%M"));
            println!("\nPress Ctrl+C to stop.\n");

            let scheduler = DailyResetScheduler::new(engine.clone(), SchedulerConfig { reset_time });
            scheduler.run().await?;
        }

        Commands::Quote { symbol } => {
            let symbol = symbol.trim().to_uppercase();
            let quote = oracle.get_price(&symbol).await.map_err(EngineError::from)?;

            println!("\n{} ${:.2}", quote.symbol, quote.price);
            if let Some(change) = quote.change_pct {
                println!("Change:  {:+.2}%", change);
            }
            println!("Source:  {}", quote.source);
            println!("As of:   {}", quote.fetched_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }

        Commands::Leaderboard => {
            let passed = db.standings(Some(ChallengeStatus::Passed)).await?;
            let entries = MetricsCalculator::rank(passed, LEADERBOARD_SIZE);

            if entries.is_empty() {
                println!("No funded traders yet.");
                return Ok(());
            }

            println!(
                "\n{:<5} {:<20} {:<10} {:>12} {:>12} {:>9}",
                "RANK", "TRADER", "CHALLENGE", "INITIAL", "FINAL", "PROFIT%"
            );
            println!("{}", "-".repeat(73));

            for e in &entries {
                println!(
                    "{:<5} {:<20} {:<10} {:>12.2} {:>12.2} {:>8.2}%",
                    e.rank,
                    truncate(&e.username, 20),
                    e.challenge_id,
                    e.initial_balance,
                    e.equity,
                    e.profit_pct
                );
            }
            println!("\nFunded traders: {}", entries.len());
        }

        Commands::Rankings => {
            let all = db.standings(None).await?;
            let entries = MetricsCalculator::rank(all, RANKINGS_SIZE);

            println!(
                "\n{:<5} {:<20} {:<10} {:<8} {:>9}",
                "RANK", "TRADER", "CHALLENGE", "STATUS", "PROFIT%"
            );
            println!("{}", "-".repeat(56));

            for e in &entries {
                println!(
                    "{:<5} {:<20} {:<10} {:<8} {:>8.2}%",
                    e.rank,
                    truncate(&e.username, 20),
                    e.challenge_id,
                    e.status,
                    e.profit_pct
                );
            }
        }

        Commands::Stats => {
            let counts = db.status_counts().await?;
            let passed = db.standings(Some(ChallengeStatus::Passed)).await?;
            let stats = MetricsCalculator::platform_stats(counts, &passed);

            println!("\n=== Platform Stats ===");
            println!("Total Challenges:  {}", stats.total_challenges);
            println!("Active:            {}", stats.active_challenges);
            println!("Passed:            {}", stats.passed_challenges);
            println!("Failed:            {}", stats.failed_challenges);
            println!("Pass Rate:         {}%", stats.pass_rate);
            println!("Total Profit:      ${:.2}", stats.total_profit);
        }
    }

    Ok(())
}

async fn build_oracle(cli: &Cli) -> Result<Arc<dyn PriceOracle>> {
    let oracle: Arc<dyn PriceOracle> = match cli.price_source {
        PriceSource::Simulated => {
            let oracle = StaticPriceOracle::simulated();
            for (symbol, price) in &cli.pins {
                oracle.set_price(symbol, *price).await;
            }
            Arc::new(oracle)
        }
        PriceSource::Yahoo => {
            if !cli.pins.is_empty() {
                bail!("--pin only applies to the simulated price source");
            }
            let client = match &cli.quote_url {
                Some(url) => QuoteClient::with_base_url(url.clone())?,
                None => QuoteClient::new()?,
            };
            Arc::new(client)
        }
    };

    Ok(oracle)
}

/// Plan administration is reserved to admins.
async fn require_admin(db: &Database, user_id: i64) -> Result<()> {
    let user = db
        .get_user(user_id)
        .await?
        .ok_or(EngineError::UserNotFound(user_id))?;

    if !user.is_admin {
        bail!("user {} is not an admin", user_id);
    }
    Ok(())
}

/// Market order at the quote, or a fill at an explicit price.
async fn place(
    engine: &ChallengeEngine,
    db: &Database,
    user_id: i64,
    symbol: &str,
    side: TradeSide,
    quantity: Decimal,
    price: Option<Decimal>,
) -> Result<()> {
    let result = match price {
        None => engine.place_order(user_id, symbol, side, quantity).await?,
        Some(price) => {
            let challenge = db
                .get_active_challenge(user_id)
                .await?
                .ok_or(EngineError::NoActiveChallenge(user_id))?;
            match side {
                TradeSide::Buy => engine.execute_buy(challenge.id, symbol, quantity, price).await?,
                TradeSide::Sell => engine.execute_sell(challenge.id, symbol, quantity, price).await?,
            }
        }
    };

    let trade = &result.trade;
    let fill = trade.exit_price.unwrap_or(trade.entry_price);
    println!(
        "{} {} {} @ ${:.2} (trade {})",
        trade.side.as_str().to_uppercase(),
        trade.quantity.normalize(),
        trade.symbol,
        fill,
        trade.id
    );
    if let Some(pnl) = result.realized_pnl {
        println!("Realized P&L: ${:.2}", pnl);
    }
    match &result.position {
        Some(pos) => println!(
            "Position: {} @ avg ${:.2}",
            pos.quantity.normalize(),
            pos.avg_entry_price
        ),
        None => println!("Position closed"),
    }
    print_evaluation(&result.evaluation);

    Ok(())
}

async fn print_status(engine: &ChallengeEngine, challenge_id: i64) -> Result<()> {
    let r = engine.status_report(challenge_id).await?;

    println!("\n=== Challenge {} ===", r.challenge_id);
    println!("Status:           {}", r.status);
    if let Some(reason) = &r.failure_reason {
        println!("Reason:           {}", reason);
    }

    println!("\n--- Account ---");
    println!("Initial Balance:  ${:.2}", r.initial_balance);
    println!("Cash Balance:     ${:.2}", r.current_balance);
    println!("Equity:           ${:.2}", r.current_equity);
    println!("Daily Start:      ${:.2}", r.daily_start_equity);
    println!("Open Positions:   {}", r.open_positions);

    println!("\n--- P&L ---");
    println!("Total:            ${:.2} ({:.2}%)", r.total_pnl, r.total_pnl_pct);
    println!("Today:            ${:.2} ({:.2}%)", r.daily_pnl, r.daily_pnl_pct);

    println!("\n--- Rules ---");
    println!(
        "Profit Target:    {}%  ({:.2} pts to go)",
        r.thresholds.profit_target_pct.normalize(),
        r.to_profit_target
    );
    println!(
        "Max Daily Loss:   {}%  ({:.2} pts left)",
        r.thresholds.max_daily_loss_pct.normalize(),
        r.daily_loss_remaining
    );
    println!(
        "Max Total Loss:   {}%  ({:.2} pts left)",
        r.thresholds.max_total_loss_pct.normalize(),
        r.total_loss_remaining
    );

    Ok(())
}

fn print_evaluation(result: &EvaluationResult) {
    if !result.changed {
        return;
    }
    match result.status {
        ChallengeStatus::Passed => println!("\n*** Challenge {} PASSED ***", result.challenge_id),
        ChallengeStatus::Failed => println!("\n*** Challenge {} FAILED ***", result.challenge_id),
        ChallengeStatus::Active => {}
    }
    if let Some(reason) = &result.reason {
        println!("{}", reason);
    }
    println!("Final equity: ${:.2}", result.equity);
}

/// Exit status by error class.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>().map(EngineError::kind) {
        Some(ErrorKind::Validation) => 2,
        Some(ErrorKind::Precondition) => 3,
        Some(ErrorKind::NotFound) => 4,
        Some(ErrorKind::Consistency) => 5,
        Some(ErrorKind::Internal) | None => 1,
    }
}

fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| format!("expected HH:MM, got {:?}: {}", s, e))
}

fn parse_pin(s: &str) -> Result<(String, Decimal), String> {
    let (symbol, price) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SYMBOL=PRICE, got {:?}", s))?;
    let price: Decimal = price
        .trim()
        .parse()
        .map_err(|e| format!("invalid price {:?}: {}", price, e))?;
    if price <= Decimal::ZERO {
        return Err(format!("price must be positive, got {}", price));
    }
    Ok((symbol.trim().to_uppercase(), price))
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("09:30").unwrap(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(parse_time("16:00:30").unwrap(), NaiveTime::from_hms_opt(16, 0, 30).unwrap());
        assert!(parse_time("9h30").is_err());
    }

    #[test]
    fn test_parse_pin() {
        let (symbol, price) = parse_pin("aapl=180.25").unwrap();
        assert_eq!(symbol, "AAPL");
        assert_eq!(price, Decimal::new(18025, 2));
        assert!(parse_pin("AAPL").is_err());
        assert!(parse_pin("AAPL=-1").is_err());
    }

    #[test]
    fn test_exit_codes() {
        let err: anyhow::Error = EngineError::ChallengeNotFound(1).into();
        assert_eq!(exit_code(&err), 4);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["propdesk", "--pin", "AAPL=100", "buy", "1", "aapl", "2.5"]).unwrap();
        assert_eq!(cli.price_source, PriceSource::Simulated);
        assert!(matches!(cli.command, Commands::Buy { user_id: 1, .. }));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long name", 10), "a very ...");
    }
}
