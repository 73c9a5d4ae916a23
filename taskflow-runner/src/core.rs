use std::io;

use taskflow::concurrency::context::{CancelHandle, Context};
use taskflow_config::shared::{PoolConfig, RunnerConfig, StageConfig};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::scenario::{Scenario, ScenarioReport};

/// Runs `scenario` with the provided configuration.
///
/// The run is bounded by the configured timeout, if any, and cancelled on SIGINT or SIGTERM. A
/// cancelled run still produces a report; its results up to the interruption are kept.
pub async fn start_scenario(
    runner_config: RunnerConfig,
    scenario: Scenario,
) -> anyhow::Result<ScenarioReport> {
    info!(?scenario, "starting scenario");

    log_config(&runner_config);

    let root = Context::background();
    let (ctx, cancel) = match runner_config.timeout() {
        Some(timeout) => Context::with_timeout(&root, timeout),
        None => Context::with_cancel(&root),
    };

    let shutdown_cancel = cancel.clone();
    let shutdown_handle = tokio::spawn(async move {
        if let Err(err) = cancel_on_shutdown_signal(shutdown_cancel).await {
            warn!(error = %err, "failed to listen for shutdown signals");
        }
    });

    let result = scenario.run(&ctx, &runner_config).await;

    // The signal listener is no longer needed once the scenario finished.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;
    cancel.cancel();

    Ok(result?)
}

/// Cancels the run on the first SIGINT or SIGTERM.
async fn cancel_on_shutdown_signal(cancel: CancelHandle) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("sigint (ctrl+c) received, cancelling run");
        }
        _ = sigterm.recv() => {
            info!("sigterm received, cancelling run");
        }
    }

    cancel.cancel();

    Ok(())
}

fn log_config(config: &RunnerConfig) {
    debug!(
        tasks = config.tasks,
        timeout_ms = config.timeout_ms,
        rate_limit_interval_ms = config.rate_limit.as_ref().map(|r| r.interval_ms),
        "runner config"
    );
    log_pool_config(&config.pool);
    log_stage_config(&config.stage);
}

fn log_pool_config(config: &PoolConfig) {
    debug!(
        workers = config.workers,
        job_capacity = config.job_capacity,
        result_capacity = config.result_capacity,
        "pool config"
    );
}

fn log_stage_config(config: &StageConfig) {
    debug!(
        replicas = config.replicas,
        capacity = config.capacity,
        "stage config"
    );
}
