use std::fmt;
use std::time::Duration;

use clap::Subcommand;
use taskflow::bail;
use taskflow::concurrency::channel::bounded;
use taskflow::concurrency::context::{Cause, Context};
use taskflow::concurrency::rate_limiter::RateLimiter;
use taskflow::error::{ErrorKind, FlowResult};
use taskflow::pipeline::fan::{fan_out, merge};
use taskflow::pipeline::{Pipeline, PipelineOutput, stage};
use taskflow::task::{Flow, Task, TaskId};
use taskflow::workers::base::{Worker, WorkerHandle};
use taskflow::workers::pool::WorkerPool;
use taskflow::workers::producer::Producer;
use taskflow_config::shared::RunnerConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Every value divisible by this fails, so each scenario exercises failure reporting.
const FAILING_DIVISOR: u64 = 7;

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum Scenario {
    /// Rate-limited producer feeding a worker pool
    Pool,
    /// Source, filter and replicated async map stages
    Pipeline,
    /// Fan-out into one stage per branch, merged back into a single stream
    Fan {
        /// Number of branches
        #[arg(long, default_value_t = 3)]
        branches: usize,
    },
}

impl Scenario {
    fn name(&self) -> &'static str {
        match self {
            Scenario::Pool => "pool",
            Scenario::Pipeline => "pipeline",
            Scenario::Fan { .. } => "fan",
        }
    }

    /// Runs the scenario under `ctx` and reports what happened.
    pub async fn run(self, ctx: &Context, config: &RunnerConfig) -> FlowResult<ScenarioReport> {
        let started = Instant::now();

        let mut report = match self {
            Scenario::Pool => run_pool(ctx, config).await?,
            Scenario::Pipeline => run_pipeline(ctx, config).await?,
            Scenario::Fan { branches } => run_fan(ctx, config, branches).await?,
        };
        report.scenario = self.name();
        report.elapsed = started.elapsed();

        Ok(report)
    }
}

/// Outcome of a scenario run.
#[derive(Debug, Default)]
pub struct ScenarioReport {
    scenario: &'static str,
    submitted: u64,
    succeeded: u64,
    failed: u64,
    sum: u64,
    interrupted: Option<Cause>,
    elapsed: Duration,
}

impl ScenarioReport {
    fn from_pipeline(submitted: u64, output: PipelineOutput<u64>) -> Self {
        for failure in &output.failures {
            warn!(error = %failure, "item failed");
        }

        Self {
            submitted,
            succeeded: output.items.len() as u64,
            failed: output.failures.len() as u64,
            sum: output.items.iter().sum(),
            interrupted: output.interrupted,
            ..Self::default()
        }
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scenario `{}`: {} submitted, {} succeeded, {} failed, sum {} in {:?}",
            self.scenario, self.submitted, self.succeeded, self.failed, self.sum, self.elapsed
        )?;
        if let Some(cause) = self.interrupted {
            write!(f, " (interrupted: {cause})")?;
        }

        Ok(())
    }
}

/// Squares `value` after a short simulated delay.
async fn square(value: u64) -> FlowResult<u64> {
    tokio::time::sleep(Duration::from_millis(value % 5 * 10)).await;

    if value % FAILING_DIVISOR == 0 {
        bail!(
            ErrorKind::TaskFailed,
            "Simulated task failure",
            format!("value {value} is divisible by {FAILING_DIVISOR}")
        );
    }

    Ok(value * value)
}

async fn run_pool(ctx: &Context, config: &RunnerConfig) -> FlowResult<ScenarioReport> {
    let (jobs_tx, jobs_rx) = bounded(config.pool.job_capacity);
    let (results_tx, results_rx) = bounded(config.pool.result_capacity);

    let limiter = config
        .rate_limit
        .as_ref()
        .map(RateLimiter::from_config)
        .transpose()?;
    let tasks = (1..=config.tasks).map(|value| Task::new(TaskId::new(value), value, square));

    let producer = Producer::new(tasks, jobs_tx).report_failures_to(results_tx.clone());
    let pool = WorkerPool::new(config.pool.clone(), jobs_rx, results_tx)?.start(ctx)?;
    let producer = match limiter {
        Some(limiter) => producer.with_rate_limiter(limiter).start(ctx)?,
        None => producer.start(ctx)?,
    };

    let mut report = ScenarioReport::default();
    while let Some(flow) = results_rx.recv().await? {
        match flow {
            Flow::Item(result) => match result.outcome {
                Ok(value) => {
                    debug!(task_id = %result.task_id, value, "task completed");
                    report.succeeded += 1;
                    report.sum += value;
                }
                Err(err) => {
                    warn!(task_id = %result.task_id, error = %err, "task failed");
                    report.failed += 1;
                }
            },
            Flow::Failed(err) => {
                warn!(error = %err, "worker failed");
                report.failed += 1;
            }
            Flow::Interrupted(cause) => report.interrupted = Some(cause),
        }
    }

    let producer_summary = producer.wait().await?;
    let pool_summary = pool.wait().await?;
    info!(
        submitted = producer_summary.submitted,
        completed = pool_summary.completed,
        failed = pool_summary.failed,
        "pool drained"
    );
    report.submitted = producer_summary.submitted;

    Ok(report)
}

async fn run_pipeline(ctx: &Context, config: &RunnerConfig) -> FlowResult<ScenarioReport> {
    let mut pipeline = Pipeline::from_iter(ctx, 1..=config.tasks, config.stage.capacity);
    if let Some(rate_limit) = &config.rate_limit {
        pipeline = pipeline.throttle(
            "pace",
            config.stage.capacity,
            RateLimiter::from_config(rate_limit)?,
        )?;
    }

    let output = pipeline
        .filter("odd", &config.stage, |value| value % 2 == 1)?
        .then("square", &config.stage, square)?
        .collect()
        .await?;

    Ok(ScenarioReport::from_pipeline(config.tasks, output))
}

async fn run_fan(
    ctx: &Context,
    config: &RunnerConfig,
    branches: usize,
) -> FlowResult<ScenarioReport> {
    let values = stage::source(ctx, 1..=config.tasks, config.stage.capacity);

    let squared = fan_out(ctx, values, branches)?
        .into_iter()
        .enumerate()
        .map(|(branch, input)| {
            stage::then(ctx, &format!("square-{branch}"), &config.stage, input, square)
        })
        .collect::<FlowResult<Vec<_>>>()?;
    let merged = merge(ctx, squared, config.stage.capacity)?;

    let output = Pipeline::from_receiver(ctx, merged).collect().await?;

    Ok(ScenarioReport::from_pipeline(config.tasks, output))
}
