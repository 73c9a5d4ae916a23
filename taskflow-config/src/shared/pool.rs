use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Worker pool configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    /// Number of concurrent workers draining the job channel.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the job channel feeding the workers.
    #[serde(default = "default_job_capacity")]
    pub job_capacity: usize,
    /// Capacity of the result channel the workers publish to.
    #[serde(default = "default_result_capacity")]
    pub result_capacity: usize,
}

impl PoolConfig {
    /// Default number of workers.
    pub const DEFAULT_WORKERS: usize = 4;

    /// Default job channel capacity.
    pub const DEFAULT_JOB_CAPACITY: usize = 64;

    /// Default result channel capacity.
    pub const DEFAULT_RESULT_CAPACITY: usize = 64;

    /// Creates a configuration with `workers` workers and default capacities.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// Validates pool settings.
    ///
    /// A pool needs at least one worker. Zero capacities are allowed and give rendezvous channels.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workers == 0 {
            return Err(ValidationError::invalid(
                "pool.workers",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            job_capacity: default_job_capacity(),
            result_capacity: default_result_capacity(),
        }
    }
}

fn default_workers() -> usize {
    PoolConfig::DEFAULT_WORKERS
}

fn default_job_capacity() -> usize {
    PoolConfig::DEFAULT_JOB_CAPACITY
}

fn default_result_capacity() -> usize {
    PoolConfig::DEFAULT_RESULT_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = PoolConfig::with_workers(0).validate().unwrap_err();
        assert!(err.to_string().contains("pool.workers"));
    }
}
