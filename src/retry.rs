//! Backoff calculation for per-service retry policies.

use std::time::Duration;

use serde::Deserialize;

/// Base delay between attempts.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for exponential backoff.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Backoff curve named by a service's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Fixed one-second delay between attempts.
    #[default]
    Constant,
    /// Doubling delay: `base * 2^(attempt - 1)`, capped at [`MAX_DELAY`].
    Exponential,
}

impl BackoffKind {
    pub fn kind_str(&self) -> &'static str {
        match self {
            BackoffKind::Constant => "constant",
            BackoffKind::Exponential => "exponential",
        }
    }

    /// Delay to sleep after `attempt` (1-based) has failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            BackoffKind::Constant => BASE_DELAY,
            BackoffKind::Exponential => {
                // 2^5 already exceeds the 30s cap.
                let exp = attempt.saturating_sub(1).min(5);
                BASE_DELAY.saturating_mul(1 << exp).min(MAX_DELAY)
            }
        }
    }
}
