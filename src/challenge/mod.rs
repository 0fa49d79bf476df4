//! Challenge evaluation: trade execution, killer rules, daily resets.

mod config;
mod engine;
mod equity;
mod error;
mod ledger;
mod locks;
mod rules;
mod scheduler;

pub use config::{EngineConfig, SchedulerConfig};
pub use engine::ChallengeEngine;
pub use error::{EngineError, ErrorKind};
pub use rules::EvaluationResult;
pub use scheduler::DailyResetScheduler;
