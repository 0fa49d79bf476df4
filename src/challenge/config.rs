//! Engine and scheduler configuration.

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Configuration for the challenge engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// First wait after a lost write race (milliseconds)
    pub retry_initial_interval_ms: u64,

    /// Upper bound on a single wait between attempts (milliseconds)
    pub retry_max_interval_ms: u64,

    /// Give up and surface a conflict after this long (milliseconds)
    pub retry_max_elapsed_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_initial_interval_ms: 10,
            retry_max_interval_ms: 200,
            retry_max_elapsed_ms: 2_000,
        }
    }
}

impl EngineConfig {
    /// Fresh backoff policy for one operation.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.retry_initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.retry_max_interval_ms))
            .with_max_elapsed_time(Some(Duration::from_millis(self.retry_max_elapsed_ms)))
            .build()
    }
}

/// Market open.
const DEFAULT_RESET_TIME: NaiveTime = match NaiveTime::from_hms_opt(9, 30, 0) {
    Some(time) => time,
    None => panic!("invalid default reset time"),
};

/// Configuration for the daily reset job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Local wall-clock time at which daily baselines are rebased
    pub reset_time: NaiveTime,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reset_time: DEFAULT_RESET_TIME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_is_bounded() {
        let policy = EngineConfig::default().backoff();
        assert_eq!(policy.initial_interval, Duration::from_millis(10));
        assert_eq!(policy.max_elapsed_time, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_default_reset_time() {
        let config = SchedulerConfig::default();
        assert_eq!(config.reset_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }
}
