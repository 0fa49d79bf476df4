//! Reporting over challenges and their trades.

mod calculator;

pub use calculator::{ChallengeStatusReport, MetricsCalculator, LEADERBOARD_SIZE, RANKINGS_SIZE};
