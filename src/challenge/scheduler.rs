//! Once-a-day rebase of daily-loss baselines.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use tracing::{error, info};

use super::config::SchedulerConfig;
use super::engine::{ChallengeEngine, ResetReport};
use super::error::EngineError;

/// First instant strictly after `now` whose local wall-clock time is `at`.
/// Days where `at` falls into a DST gap are skipped.
pub fn next_trigger<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    for offset in 0..3 {
        let Some(date) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        if let Some(candidate) = tz.from_local_datetime(&date.and_time(at)).earliest() {
            if candidate > *now {
                return candidate;
            }
        }
    }

    now.clone() + chrono::Duration::days(1)
}

/// Runs [`ChallengeEngine::reset_daily_equity`] every day at the configured
/// local time until Ctrl+C.
pub struct DailyResetScheduler {
    engine: Arc<ChallengeEngine>,
    config: SchedulerConfig,
}

impl DailyResetScheduler {
    pub fn new(engine: Arc<ChallengeEngine>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// Run a single reset pass now.
    pub async fn run_once(&self) -> Result<ResetReport, EngineError> {
        self.engine.reset_daily_equity().await
    }

    pub async fn run(&self) -> Result<()> {
        info!(reset_time = %self.config.reset_time, "Daily reset scheduler started");

        loop {
            let now = Local::now();
            let next = next_trigger(&now, self.config.reset_time);
            let wait = (next - now).to_std().unwrap_or_default();

            info!(next = %next.format("%Y-%m-%d %H:%M:%S %Z"), "Next daily reset scheduled");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.run_once().await {
                        Ok(report) if !report.failures.is_empty() => {
                            error!(failed = report.failures.len(), "Daily reset finished with failures");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Daily reset failed"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Scheduler stopping");
                    break;
                }
            }
        }

        Ok(())
    }
}
