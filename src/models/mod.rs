//! Data models for users, plans, challenges, positions, and trades.

mod challenge;
mod plan;
mod position;
mod trade;
mod user;

pub use challenge::{Challenge, ChallengeStatus, Conclusion};
pub use plan::{Plan, PlanSpec, RuleThresholds};
pub use position::Position;
pub use trade::{Trade, TradeSide, TradeStatus};
pub use user::User;
