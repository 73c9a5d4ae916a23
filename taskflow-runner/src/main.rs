//! Taskflow runner binary.
//!
//! Loads the runner configuration, initializes telemetry and runs one orchestration scenario until
//! it completes, reaches its deadline or is interrupted by a shutdown signal.

use clap::Parser;
use taskflow_config::shared::RunnerConfig;
use taskflow_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_runner_config;
use crate::core::start_scenario;
use crate::metrics::init_metrics;
use crate::scenario::Scenario;

mod config;
mod core;
mod metrics;
mod scenario;

#[derive(Parser)]
#[command(name = "taskflow-runner", about = "Runs task orchestration scenarios")]
struct Args {
    /// Overrides the number of tasks from the configuration
    #[arg(long, global = true)]
    tasks: Option<u64>,

    #[command(subcommand)]
    scenario: Scenario,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut runner_config = load_runner_config()?;
    if let Some(tasks) = args.tasks {
        runner_config.tasks = tasks;
    }

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(runner_config, args.scenario))
}

async fn async_main(runner_config: RunnerConfig, scenario: Scenario) -> anyhow::Result<()> {
    // The recorder spawns its upkeep task, so it is installed once the runtime is running.
    let metrics_handle = init_metrics()?;

    match start_scenario(runner_config, scenario).await {
        Ok(report) => {
            println!("{report}");
            println!("{}", metrics_handle.render());

            Ok(())
        }
        Err(err) => {
            error!("{err:#}");

            Err(err)
        }
    }
}
