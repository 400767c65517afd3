use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::QueueLimits;

/// Documented limit is 5 requests per second; 15 holds up in practice.
pub const MAX_REQS_PER_SEC: usize = 15;
pub const RATE_LIMIT_DELAY: Duration = Duration::from_secs(30);
pub const TASK_TIMEOUT: Duration = Duration::from_secs(60);
pub const PARSE_SETTLE_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("rate limit delay {delay:?} must be shorter than the task timeout {timeout:?}")]
    DelayExceedsTimeout { delay: Duration, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of requests in flight at once.
    pub concurrency: usize,
    /// Maximum number of request starts per `interval`.
    pub interval_cap: usize,
    pub interval: Duration,
    pub task_timeout: Duration,
    /// Pause applied to the whole queue after a 429 response.
    pub rate_limit_delay: Duration,
    /// Wait between the end of fetching and the transform call.
    pub parse_settle_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: MAX_REQS_PER_SEC,
            interval_cap: MAX_REQS_PER_SEC,
            interval: Duration::from_secs(1),
            task_timeout: TASK_TIMEOUT,
            rate_limit_delay: RATE_LIMIT_DELAY,
            parse_settle_delay: PARSE_SETTLE_DELAY,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_reqs = env_parse("BASESYNC_MAX_REQS_PER_SEC").unwrap_or(MAX_REQS_PER_SEC);
        Self {
            concurrency: max_reqs,
            interval_cap: max_reqs,
            interval: defaults.interval,
            task_timeout: env_parse("BASESYNC_TASK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_timeout),
            rate_limit_delay: env_parse("BASESYNC_RATE_LIMIT_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_delay),
            parse_settle_delay: env_parse("BASESYNC_PARSE_SETTLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.parse_settle_delay),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Zero("concurrency"));
        }
        if self.interval_cap == 0 {
            return Err(ConfigError::Zero("interval_cap"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Zero("interval"));
        }
        // The rate-limited task sleeps inside its own timeout budget.
        if self.rate_limit_delay >= self.task_timeout {
            return Err(ConfigError::DelayExceedsTimeout {
                delay: self.rate_limit_delay,
                timeout: self.task_timeout,
            });
        }
        Ok(())
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            concurrency: self.concurrency,
            interval_cap: self.interval_cap,
            interval: self.interval,
            task_timeout: self.task_timeout,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
