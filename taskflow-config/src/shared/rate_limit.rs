use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration for the periodic admission gate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Minimum time, in milliseconds, between two admissions.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl RateLimitConfig {
    /// Default admission interval: 200 milliseconds.
    pub const DEFAULT_INTERVAL_MS: u64 = 200;

    /// Returns the admission interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Validates the rate limit configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval_ms == 0 {
            return Err(ValidationError::invalid(
                "rate_limit.interval_ms",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    RateLimitConfig::DEFAULT_INTERVAL_MS
}
