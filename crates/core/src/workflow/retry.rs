use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Retry policy applied to node processor failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt; total tries = max_retries + 1
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(rename = "retryDelay", default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        should_retry(attempt, self.max_retries)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        delay_for(attempt, self.retry_delay_ms, self.backoff_multiplier)
    }
}

/// Whether a node whose `attempt`-th try (1-based) just failed gets another one
pub fn should_retry(attempt: u32, max_retries: u32) -> bool {
    attempt <= max_retries
}

/// Delay before the retry that follows failed attempt `attempt` (1-based):
/// `retry_delay * backoff_multiplier^(attempt - 1)`
pub fn delay_for(attempt: u32, retry_delay_ms: u64, backoff_multiplier: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let millis = retry_delay_ms as f64 * backoff_multiplier.powi(exponent);
    // `as` saturates, so overflow and NaN cannot panic here.
    Duration::from_millis(millis.round() as u64)
}
