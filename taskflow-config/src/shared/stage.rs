use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration of a single pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StageConfig {
    /// Number of concurrent instances reading the stage input.
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Capacity of the channel the stage writes to.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl StageConfig {
    /// Default number of stage instances.
    pub const DEFAULT_REPLICAS: usize = 1;

    /// Default output channel capacity. Zero makes stages hand off values one by one.
    pub const DEFAULT_CAPACITY: usize = 0;

    /// Creates a configuration running `replicas` instances with the default capacity.
    pub fn replicated(replicas: usize) -> Self {
        Self {
            replicas,
            ..Self::default()
        }
    }

    /// Validates stage settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.replicas == 0 {
            return Err(ValidationError::invalid(
                "stage.replicas",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            capacity: default_capacity(),
        }
    }
}

fn default_replicas() -> usize {
    StageConfig::DEFAULT_REPLICAS
}

fn default_capacity() -> usize {
    StageConfig::DEFAULT_CAPACITY
}
