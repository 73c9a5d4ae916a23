use anyhow::Context;
use taskflow_config::load_config;
use taskflow_config::shared::RunnerConfig;

/// Loads and validates the runner configuration.
///
/// Files are read from the `configuration` directory, or from `TASKFLOW_CONFIG_DIR` when set, and
/// `TASKFLOW_`-prefixed environment variables override individual keys.
pub fn load_runner_config() -> anyhow::Result<RunnerConfig> {
    load_config::<RunnerConfig>().context("failed to load the runner configuration")
}
