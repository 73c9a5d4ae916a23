use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use taskflow_config::shared::PoolConfig;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::concurrency::channel::{Receiver, Sender};
use crate::concurrency::context::{Cause, Context};
use crate::concurrency::guarded::Guarded;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::metrics::{
    ERROR_KIND_LABEL, TASKFLOW_TASK_DURATION_SECONDS, TASKFLOW_TASKS_COMPLETED_TOTAL,
    TASKFLOW_TASKS_FAILED_TOTAL, TASKFLOW_TASKS_IN_FLIGHT, WORKER_LABEL,
};
use crate::task::{Flow, Task, TaskResult};
use crate::workers::base::{Worker, WorkerHandle};

/// Snapshot of a running [`WorkerPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolState {
    /// Workers that have not exited yet.
    pub active_workers: usize,
    /// Tasks currently executing.
    pub in_flight: usize,
    /// Tasks that produced a value.
    pub completed: u64,
    /// Tasks that failed or panicked.
    pub failed: u64,
}

/// Final report of a [`WorkerPool`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSummary {
    pub completed: u64,
    pub failed: u64,
    /// Set when the run was cut short by its context.
    pub interrupted: Option<Cause>,
}

/// How a single worker left its loop.
#[derive(Debug, Clone, Copy)]
enum WorkerExit {
    /// The job channel was closed and drained.
    Drained,
    /// The context fired while the worker was waiting or executing.
    Interrupted(Cause),
}

#[derive(Debug, Default)]
struct PoolShared {
    state: Guarded<PoolState>,
}

impl PoolShared {
    fn update(&self, f: impl FnOnce(&mut PoolState)) {
        if let Err(err) = self.state.with_lock(f) {
            error!(error = %err, "failed to update pool state");
        }
    }

    fn snapshot(&self) -> PoolState {
        self.state.with_lock(|state| *state).unwrap_or_default()
    }
}

/// Decrements the active worker count when a worker exits, including by panicking.
struct ActiveWorkerGuard {
    shared: Arc<PoolShared>,
}

impl Drop for ActiveWorkerGuard {
    fn drop(&mut self) {
        self.shared.update(|state| state.active_workers -= 1);
    }
}

/// Fixed set of workers draining one job channel into one result channel.
///
/// Every worker loops: receive a task, execute it racing against the context, publish a
/// [`TaskResult`] wrapped in [`Flow::Item`]. Task failures and panics are published as `Err`
/// outcomes and never dropped. Once every worker exited, the pool's supervisor closes the result
/// channel; if the run was cut short it first publishes a single [`Flow::Interrupted`] marker.
/// Results arrive in completion order.
#[derive(Debug)]
pub struct WorkerPool<T, R> {
    config: PoolConfig,
    jobs: Receiver<Task<T, R>>,
    results: Sender<Flow<TaskResult<R>>>,
}

impl<T, R> WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Creates a pool, rejecting configurations without workers.
    pub fn new(
        config: PoolConfig,
        jobs: Receiver<Task<T, R>>,
        results: Sender<Flow<TaskResult<R>>>,
    ) -> FlowResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            jobs,
            results,
        })
    }
}

impl<T, R> Worker<WorkerPoolHandle, PoolState> for WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    type Error = FlowError;

    fn start(self, ctx: &Context) -> FlowResult<WorkerPoolHandle> {
        let WorkerPool {
            config,
            jobs,
            results,
        } = self;

        let shared = Arc::new(PoolShared::default());
        shared.update(|state| state.active_workers = config.workers);

        let mut workers = JoinSet::new();
        for index in 0..config.workers {
            let worker = PoolWorker {
                index,
                ctx: ctx.clone(),
                jobs: jobs.clone().with_context(ctx),
                results: results.clone().with_context(ctx),
                _active: ActiveWorkerGuard {
                    shared: shared.clone(),
                },
                shared: shared.clone(),
            };
            workers.spawn(worker.run());
        }
        drop(jobs);

        info!(workers = config.workers, "worker pool started");

        let supervisor = tokio::spawn(supervise(workers, results, shared.clone()));

        Ok(WorkerPoolHandle { shared, supervisor })
    }
}

struct PoolWorker<T, R> {
    index: usize,
    ctx: Context,
    jobs: Receiver<Task<T, R>>,
    results: Sender<Flow<TaskResult<R>>>,
    shared: Arc<PoolShared>,
    _active: ActiveWorkerGuard,
}

impl<T, R> PoolWorker<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    async fn run(self) -> FlowResult<WorkerExit> {
        let worker = self.index;
        debug!(worker, "worker started");

        loop {
            let task = match self.jobs.recv().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    debug!(worker, "job channel drained, worker exiting");
                    return Ok(WorkerExit::Drained);
                }
                Err(err) => return self.interrupted_or(err),
            };

            let task_id = task.id();
            self.shared.update(|state| state.in_flight += 1);
            gauge!(TASKFLOW_TASKS_IN_FLIGHT).increment(1.0);
            let started = Instant::now();

            let executed = self.ctx.run(task.execute()).await;

            self.shared.update(|state| state.in_flight -= 1);
            gauge!(TASKFLOW_TASKS_IN_FLIGHT).decrement(1.0);

            let outcome = match executed {
                Ok(outcome) => outcome,
                Err(err) => {
                    debug!(worker, %task_id, "task abandoned because the context fired");
                    return self.interrupted_or(err);
                }
            };

            histogram!(TASKFLOW_TASK_DURATION_SECONDS, WORKER_LABEL => worker.to_string())
                .record(started.elapsed().as_secs_f64());
            self.record_outcome(&outcome);

            let result = TaskResult { task_id, outcome };
            if let Err(err) = self.results.send(Flow::Item(result)).await {
                return self.interrupted_or(err);
            }
        }
    }

    fn record_outcome(&self, outcome: &FlowResult<R>) {
        let worker = self.index;
        match outcome {
            Ok(_) => {
                self.shared.update(|state| state.completed += 1);
                counter!(TASKFLOW_TASKS_COMPLETED_TOTAL, WORKER_LABEL => worker.to_string())
                    .increment(1);
            }
            Err(err) => {
                warn!(worker, error = %err, "task failed");
                self.shared.update(|state| state.failed += 1);
                counter!(
                    TASKFLOW_TASKS_FAILED_TOTAL,
                    WORKER_LABEL => worker.to_string(),
                    ERROR_KIND_LABEL => format!("{:?}", err.kind()),
                )
                .increment(1);
            }
        }
    }

    /// Maps a cancellation error to an interrupted exit and passes every other error through.
    fn interrupted_or(&self, err: FlowError) -> FlowResult<WorkerExit> {
        match self.ctx.cause() {
            Some(cause) if err.is_cancellation() => {
                debug!(worker = self.index, %cause, "worker interrupted");
                Ok(WorkerExit::Interrupted(cause))
            }
            _ => {
                error!(worker = self.index, error = %err, "worker stopped with an error");
                Err(err)
            }
        }
    }
}

/// Waits for every worker, then publishes diagnostics and closes the result channel.
async fn supervise<R>(
    mut workers: JoinSet<FlowResult<WorkerExit>>,
    results: Sender<Flow<TaskResult<R>>>,
    shared: Arc<PoolShared>,
) -> FlowResult<PoolSummary>
where
    R: Send + 'static,
{
    let mut errors = Vec::new();
    let mut interrupted = None;

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(WorkerExit::Drained)) => {}
            Ok(Ok(WorkerExit::Interrupted(cause))) => {
                interrupted.get_or_insert(cause);
            }
            Ok(Err(err)) => errors.push(err),
            Err(join_err) if join_err.is_cancelled() => {
                debug!("worker task was cancelled");
            }
            Err(join_err) => {
                let err = flow_error!(ErrorKind::WorkerPanic, "Pool worker panicked", join_err);
                error!(error = %err, "worker panicked");
                if let Err(push_err) = results.push_unbounded(Flow::Failed(err.clone())) {
                    warn!(error = %push_err, "could not publish worker panic");
                }
                errors.push(err);
            }
        }
    }

    if let Some(cause) = interrupted
        && let Err(push_err) = results.push_unbounded(Flow::Interrupted(cause))
    {
        warn!(error = %push_err, "could not publish interruption marker");
    }

    if let Err(err) = results.close() {
        errors.push(err);
    }

    let state = shared.snapshot();
    let summary = PoolSummary {
        completed: state.completed,
        failed: state.failed,
        interrupted,
    };
    info!(
        completed = summary.completed,
        failed = summary.failed,
        interrupted = ?summary.interrupted,
        "worker pool finished"
    );

    if errors.is_empty() {
        Ok(summary)
    } else {
        Err(errors.into())
    }
}

/// Handle to a started [`WorkerPool`].
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shared: Arc<PoolShared>,
    supervisor: JoinHandle<FlowResult<PoolSummary>>,
}

impl WorkerHandle<PoolState> for WorkerPoolHandle {
    type Output = PoolSummary;

    fn state(&self) -> PoolState {
        self.shared.snapshot()
    }

    /// Waits until every worker exited and the result channel was closed.
    ///
    /// Worker-level failures are aggregated into a single error.
    async fn wait(self) -> FlowResult<PoolSummary> {
        match self.supervisor.await {
            Ok(summary) => summary,
            Err(join_err) => Err(flow_error!(
                ErrorKind::WorkerPanic,
                "Pool supervisor panicked",
                join_err
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::concurrency::channel::bounded;
    use crate::task::TaskId;

    fn square_task(id: u64) -> Task<u64, u64> {
        Task::from_fn(TaskId::new(id), id, |value| Ok(value * value))
    }

    #[tokio::test]
    async fn zero_workers_is_rejected_synchronously() {
        let (_jobs_tx, jobs_rx) = bounded::<Task<u64, u64>>(1);
        let (results_tx, _results_rx) = bounded(1);

        let err = WorkerPool::new(PoolConfig::with_workers(0), jobs_rx, results_tx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn every_task_produces_exactly_one_result() {
        let (jobs_tx, jobs_rx) = bounded(4);
        let (results_tx, results_rx) = bounded(4);
        let pool = WorkerPool::new(PoolConfig::with_workers(3), jobs_rx, results_tx).unwrap();
        let handle = pool.start(&Context::background()).unwrap();

        tokio::spawn(async move {
            for id in 1..=10 {
                jobs_tx.send(square_task(id)).await.unwrap();
            }
        });

        let mut squares = Vec::new();
        while let Some(flow) = results_rx.recv().await.unwrap() {
            let result = flow.into_item().unwrap();
            squares.push(result.outcome.unwrap());
        }
        squares.sort_unstable();

        assert_eq!(squares, (1..=10).map(|id| id * id).collect::<Vec<_>>());
        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.completed, 10);
        assert_eq!(summary.interrupted, None);
    }

    #[tokio::test]
    async fn failing_and_panicking_tasks_are_reported_as_outcomes() {
        let (jobs_tx, jobs_rx) = bounded(4);
        let (results_tx, results_rx) = bounded(4);
        let handle = WorkerPool::new(PoolConfig::with_workers(2), jobs_rx, results_tx)
            .unwrap()
            .start(&Context::background())
            .unwrap();

        jobs_tx
            .send(Task::from_fn(TaskId::new(1), 1u64, |_| {
                Err(flow_error!(ErrorKind::TaskFailed, "Refused"))
            }))
            .await
            .unwrap();
        jobs_tx
            .send(Task::from_fn(TaskId::new(2), 2u64, |_| -> FlowResult<u64> {
                panic!("worker task blew up")
            }))
            .await
            .unwrap();
        jobs_tx.send(square_task(3)).await.unwrap();
        drop(jobs_tx);

        let mut kinds = Vec::new();
        while let Some(flow) = results_rx.recv().await.unwrap() {
            let result = flow.into_item().unwrap();
            if let Err(err) = result.outcome {
                kinds.push(err.kind());
            }
        }
        kinds.sort_by_key(|kind| format!("{kind:?}"));

        assert_eq!(kinds, vec![ErrorKind::TaskFailed, ErrorKind::TaskPanicked]);
        let summary = handle.wait().await.unwrap();
        assert_eq!((summary.completed, summary.failed), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_results_with_one_marker() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let (jobs_tx, jobs_rx) = bounded(8);
        let (results_tx, results_rx) = bounded(8);
        let handle = WorkerPool::new(PoolConfig::with_workers(2), jobs_rx, results_tx)
            .unwrap()
            .start(&ctx)
            .unwrap();

        for id in 0..4 {
            jobs_tx
                .send(Task::new(TaskId::new(id), id, |value| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(value)
                }))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state().in_flight, 2);
        cancel.cancel();

        let mut flows = Vec::new();
        while let Some(flow) = results_rx.recv().await.unwrap() {
            flows.push(flow);
        }

        assert_eq!(flows.len(), 1);
        assert!(matches!(flows[0], Flow::Interrupted(Cause::Cancelled)));

        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.interrupted, Some(Cause::Cancelled));
        assert_eq!(summary.completed, 0);
    }

    /// Payload that panics when a task is dropped before finishing.
    struct PanicsOnDrop;

    impl Drop for PanicsOnDrop {
        fn drop(&mut self) {
            panic!("payload dropped while its task was in flight");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_panic_is_published_before_results_close() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let (jobs_tx, jobs_rx) = bounded(2);
        let (results_tx, results_rx) = bounded(2);
        let handle = WorkerPool::new(PoolConfig::with_workers(2), jobs_rx, results_tx)
            .unwrap()
            .start(&ctx)
            .unwrap();

        for (id, payload) in [(0, Some(PanicsOnDrop)), (1, None)] {
            jobs_tx
                .send(Task::new(TaskId::new(id), payload, move |payload| async move {
                    let _held = payload;
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(id)
                }))
                .await
                .unwrap();
        }
        drop(jobs_tx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.state().in_flight, 2);
        // Abandoning the first task drops its payload outside the task's own panic capture.
        cancel.cancel();

        let mut flows = Vec::new();
        while let Some(flow) = results_rx.recv().await.unwrap() {
            flows.push(flow);
        }

        assert_eq!(flows.len(), 2);
        assert_eq!(
            flows[0].failure().map(FlowError::kind),
            Some(ErrorKind::WorkerPanic)
        );
        assert!(matches!(flows[1], Flow::Interrupted(Cause::Cancelled)));

        let err = handle.wait().await.unwrap_err();
        assert!(err.kinds().contains(&ErrorKind::WorkerPanic));
    }

    #[tokio::test]
    async fn state_reports_exited_workers() {
        let (jobs_tx, jobs_rx) = bounded::<Task<u64, u64>>(1);
        let (results_tx, _results_rx) = bounded(1);
        let handle = WorkerPool::new(PoolConfig::with_workers(4), jobs_rx, results_tx)
            .unwrap()
            .start(&Context::background())
            .unwrap();
        assert_eq!(handle.state().active_workers, 4);

        drop(jobs_tx);
        let shared = handle.shared.clone();
        handle.wait().await.unwrap();

        assert_eq!(shared.snapshot().active_workers, 0);
    }
}
