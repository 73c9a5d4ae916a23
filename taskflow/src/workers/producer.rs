use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

use crate::concurrency::channel::Sender;
use crate::concurrency::context::{Cause, Context};
use crate::concurrency::rate_limiter::RateLimiter;
use crate::concurrency::timer::TickSource;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::task::{Flow, Task, TaskResult, panic_message};
use crate::workers::base::{Worker, WorkerHandle};

/// Final report of a [`Producer`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSummary {
    /// Tasks handed to the job channel.
    pub submitted: u64,
    /// Set when the context fired before every task was submitted.
    pub interrupted: Option<Cause>,
}

/// Feeds tasks into a job channel, optionally rate-limited, and closes it when done.
///
/// The job channel is closed on every exit path, so workers draining it always terminate. A
/// panicking task iterator stops submission; with [`Producer::report_failures_to`] the panic is
/// also published as a [`Flow::Failed`] record on the result channel.
pub struct Producer<T, R, S = Interval> {
    tasks: Box<dyn Iterator<Item = Task<T, R>> + Send>,
    jobs: Sender<Task<T, R>>,
    limiter: Option<RateLimiter<S>>,
    failures: Option<Sender<Flow<TaskResult<R>>>>,
}

impl<T, R> Producer<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub fn new<I>(tasks: I, jobs: Sender<Task<T, R>>) -> Self
    where
        I: IntoIterator<Item = Task<T, R>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            tasks: Box::new(tasks.into_iter()),
            jobs,
            limiter: None,
            failures: None,
        }
    }
}

impl<T, R, S> Producer<T, R, S>
where
    T: Send + 'static,
    R: Send + 'static,
    S: TickSource + 'static,
{
    /// Waits for an admission from `limiter` before submitting each task.
    pub fn with_rate_limiter<L>(self, limiter: RateLimiter<L>) -> Producer<T, R, L>
    where
        L: TickSource + 'static,
    {
        Producer {
            tasks: self.tasks,
            jobs: self.jobs,
            limiter: Some(limiter),
            failures: self.failures,
        }
    }

    /// Publishes producer failures on `results` before the job channel is closed.
    ///
    /// `results` is usually a clone of the pool's result sender. The pool closes it only after the
    /// job channel was closed, which the producer does after publishing.
    pub fn report_failures_to(mut self, results: Sender<Flow<TaskResult<R>>>) -> Self {
        self.failures = Some(results);
        self
    }

    async fn run(self, ctx: Context, submitted: Arc<AtomicU64>) -> FlowResult<ProducerSummary> {
        let Producer {
            mut tasks,
            jobs,
            limiter,
            failures,
        } = self;
        let jobs = jobs.with_context(&ctx);
        let mut limiter = limiter.map(|limiter| limiter.with_context(&ctx));

        let mut interrupted = None;
        let mut failure = None;

        loop {
            let task = match catch_unwind(AssertUnwindSafe(|| tasks.next())) {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(panic) => {
                    let err = flow_error!(
                        ErrorKind::WorkerPanic,
                        "Task iterator panicked",
                        panic_message(panic.as_ref())
                    );
                    error!(error = %err, "producer stopped by a panicking task iterator");
                    if let Some(failures) = &failures
                        && let Err(push_err) = failures.push_unbounded(Flow::Failed(err.clone()))
                    {
                        warn!(error = %push_err, "could not publish producer panic");
                    }
                    failure = Some(err);
                    break;
                }
            };

            if let Some(limiter) = limiter.as_mut()
                && let Err(err) = limiter.admit().await
            {
                interrupted = ctx.cause();
                failure = Some(err);
                break;
            }

            let task_id = task.id();
            match jobs.send(task).await {
                Ok(()) => {
                    submitted.fetch_add(1, Ordering::Relaxed);
                    debug!(%task_id, "task submitted");
                }
                Err(err) => {
                    interrupted = ctx.cause();
                    failure = Some(err);
                    break;
                }
            }
        }

        let close_result = jobs.close();
        drop(failures);

        let summary = ProducerSummary {
            submitted: submitted.load(Ordering::Relaxed),
            interrupted,
        };
        info!(
            submitted = summary.submitted,
            interrupted = ?summary.interrupted,
            "producer finished"
        );

        match failure {
            Some(err) if !err.is_cancellation() => Err(err),
            _ => close_result.map(|()| summary),
        }
    }
}

impl<T, R, S> Worker<ProducerHandle, u64> for Producer<T, R, S>
where
    T: Send + 'static,
    R: Send + 'static,
    S: TickSource + 'static,
{
    type Error = FlowError;

    fn start(self, ctx: &Context) -> FlowResult<ProducerHandle> {
        let submitted = Arc::new(AtomicU64::new(0));
        let join = tokio::spawn(self.run(ctx.clone(), submitted.clone()));

        Ok(ProducerHandle { submitted, join })
    }
}

/// Handle to a started [`Producer`]. Its state is the number of tasks submitted so far.
#[derive(Debug)]
pub struct ProducerHandle {
    submitted: Arc<AtomicU64>,
    join: JoinHandle<FlowResult<ProducerSummary>>,
}

impl WorkerHandle<u64> for ProducerHandle {
    type Output = ProducerSummary;

    fn state(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    async fn wait(self) -> FlowResult<ProducerSummary> {
        match self.join.await {
            Ok(summary) => summary,
            Err(join_err) => Err(flow_error!(
                ErrorKind::WorkerPanic,
                "Producer panicked",
                join_err
            )),
        }
    }
}

/// Starts a producer submitting `tasks` into `jobs` under `ctx`, spaced by `limiter` when given.
pub fn spawn_producer<I, T, R>(
    ctx: &Context,
    tasks: I,
    jobs: Sender<Task<T, R>>,
    limiter: Option<RateLimiter>,
) -> FlowResult<ProducerHandle>
where
    I: IntoIterator<Item = Task<T, R>>,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
{
    let producer = Producer::new(tasks, jobs);
    match limiter {
        Some(limiter) => producer.with_rate_limiter(limiter).start(ctx),
        None => producer.start(ctx),
    }
}
