use std::time::Duration;

use tracing::debug;

/// Backoff ceiling for the exponential strategy.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

/// How long to wait before re-running a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Fixed delay on every retry.
    Linear,
    /// `base * 2^(retry_count - 1)`, capped at [`MAX_RETRY_DELAY`].
    Exponential,
}

impl RetryStrategy {
    /// Resolve a strategy by name. Unknown names fall back to linear.
    pub fn from_name(name: &str) -> Self {
        match name {
            "exponential" => Self::Exponential,
            "linear" => Self::Linear,
            other => {
                debug!(strategy = other, "unknown retry strategy, using linear");
                Self::Linear
            }
        }
    }

    /// Delay before retry number `retry_count` (1-based), given the task's
    /// base delay in seconds.
    pub fn delay(&self, retry_count: i64, base_delay_secs: i64) -> Duration {
        let base = Duration::from_secs(base_delay_secs.max(0) as u64);
        match self {
            Self::Linear => base,
            Self::Exponential => {
                if retry_count <= 0 {
                    return base;
                }
                let multiplier = 2f64.powi((retry_count - 1) as i32);
                let delay = Duration::from_secs_f64(base.as_secs_f64() * multiplier);
                delay.min(MAX_RETRY_DELAY)
            }
        }
    }
}
