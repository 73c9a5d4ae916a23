use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{PoolConfig, RateLimitConfig, StageConfig, ValidationError};

/// Top-level configuration of the taskflow runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunnerConfig {
    /// Number of tasks the runner submits per scenario.
    #[serde(default = "default_tasks")]
    pub tasks: u64,
    /// Worker pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Optional pacing of task admission. Tasks are submitted as fast as possible when absent.
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Settings applied to every pipeline stage.
    #[serde(default)]
    pub stage: StageConfig,
    /// Optional deadline, in milliseconds, for a whole scenario run.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RunnerConfig {
    /// Default number of tasks per scenario.
    pub const DEFAULT_TASKS: u64 = 20;

    /// Returns the scenario deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Config for RunnerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        self.pool.validate()?;
        self.stage.validate()?;
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        if self.timeout_ms == Some(0) {
            return Err(ValidationError::invalid(
                "timeout_ms",
                "must be greater than 0 when set",
            ));
        }

        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tasks: default_tasks(),
            pool: PoolConfig::default(),
            rate_limit: None,
            stage: StageConfig::default(),
            timeout_ms: None,
        }
    }
}

fn default_tasks() -> u64 {
    RunnerConfig::DEFAULT_TASKS
}
