//! Pipeline stages.
//!
//! A stage consumes a `Receiver<Flow<A>>` and returns a fresh `Receiver<Flow<B>>`. It runs
//! `replicas` concurrent instances of its step over the shared input and closes its output exactly
//! once, after the input was drained and every replica finished.
//!
//! Items are handled as follows:
//!
//! - [`Flow::Item`] runs through the step. A failing step emits [`Flow::Failed`]; a panicking step
//!   is recovered for that item and emits [`Flow::Failed`] with [`ErrorKind::StagePanic`].
//! - [`Flow::Failed`] passes through unchanged.
//! - [`Flow::Interrupted`] from upstream is held back and re-emitted once, right before the
//!   output closes, so a cut-short run ends with exactly one marker however many stages it
//!   crosses.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use metrics::counter;
use taskflow_config::shared::StageConfig;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::concurrency::channel::{Receiver, Sender, bounded};
use crate::concurrency::context::{Cause, Context};
use crate::concurrency::rate_limiter::RateLimiter;
use crate::concurrency::timer::TickSource;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;
use crate::metrics::{OUTCOME_LABEL, STAGE_LABEL, TASKFLOW_STAGE_ITEMS_TOTAL};
use crate::task::{Flow, panic_message};

/// Records the first cause that cut a run short.
pub(crate) type InterruptCell = Arc<OnceLock<Cause>>;

/// Publishes the interruption marker, if any, and closes `output`.
///
/// Uses an unbounded push so that a supervisor never blocks on a consumer that stopped reading.
pub(crate) fn finish_output<T>(name: &str, output: Sender<Flow<T>>, interrupted: &InterruptCell) {
    if let Some(cause) = interrupted.get()
        && let Err(err) = output.push_unbounded(Flow::Interrupted(*cause))
    {
        warn!(stage = name, error = %err, "could not publish interruption marker");
    }

    if let Err(err) = output.close() {
        error!(stage = name, error = %err, "failed to close stage output");
    }
}

/// Outcome of applying a step to one item.
type StepOutput<B> = Option<FlowResult<B>>;

/// Spawns `config.replicas` replicas of `step` between `input` and a new output channel.
///
/// A step returning `None` drops the item.
fn spawn_stage<A, B, F, Fut>(
    ctx: &Context,
    name: &str,
    config: &StageConfig,
    input: Receiver<Flow<A>>,
    step: F,
) -> FlowResult<Receiver<Flow<B>>>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepOutput<B>> + Send + 'static,
{
    config.validate()?;

    let (output, output_rx) = bounded(config.capacity);
    let step = Arc::new(step);
    let interrupted = InterruptCell::default();

    let mut replicas = JoinSet::new();
    for replica in 0..config.replicas {
        let replica = StageReplica {
            name: name.to_owned(),
            replica,
            ctx: ctx.clone(),
            input: input.clone().with_context(ctx),
            output: output.clone().with_context(ctx),
            step: step.clone(),
            interrupted: interrupted.clone(),
        };
        replicas.spawn(replica.run());
    }
    drop(input);

    debug!(stage = name, replicas = config.replicas, "stage started");
    tokio::spawn(supervise(name.to_owned(), replicas, output, interrupted));

    Ok(output_rx)
}

struct StageReplica<A, B, F> {
    name: String,
    replica: usize,
    ctx: Context,
    input: Receiver<Flow<A>>,
    output: Sender<Flow<B>>,
    step: Arc<F>,
    interrupted: InterruptCell,
}

impl<A, B, F, Fut> StageReplica<A, B, F>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepOutput<B>> + Send + 'static,
{
    async fn run(self) -> FlowResult<()> {
        loop {
            let flow = match self.input.recv().await {
                Ok(Some(flow)) => flow,
                Ok(None) => return Ok(()),
                Err(err) => return self.stop(err),
            };

            let emitted = match flow {
                Flow::Item(item) => match self.apply(item).await {
                    Ok(Some(emitted)) => emitted,
                    Ok(None) => continue,
                    Err(err) => return self.stop(err),
                },
                Flow::Failed(err) => Flow::Failed(err),
                Flow::Interrupted(cause) => {
                    let _ = self.interrupted.set(cause);
                    continue;
                }
            };

            let outcome = if emitted.is_item() { "item" } else { "failed" };
            counter!(
                TASKFLOW_STAGE_ITEMS_TOTAL,
                STAGE_LABEL => self.name.clone(),
                OUTCOME_LABEL => outcome,
            )
            .increment(1);

            if let Err(err) = self.output.send(emitted).await {
                return self.stop(err);
            }
        }
    }

    /// Runs the step on one item, racing it against the context.
    async fn apply(&self, item: A) -> FlowResult<Option<Flow<B>>> {
        let step = self.step.clone();
        let guarded = AssertUnwindSafe(async move { step(item).await }).catch_unwind();

        let emitted = match self.ctx.run(guarded).await? {
            Ok(Some(result)) => Some(Flow::from(result)),
            Ok(None) => None,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    stage = %self.name,
                    replica = self.replica,
                    panic = %message,
                    "stage step panicked"
                );
                Some(Flow::Failed(flow_error!(
                    ErrorKind::StagePanic,
                    "Stage step panicked",
                    format!("stage {}: {message}", self.name)
                )))
            }
        };

        Ok(emitted)
    }

    /// Ends the replica, recording an interruption when the context fired.
    fn stop(&self, err: FlowError) -> FlowResult<()> {
        match self.ctx.cause() {
            Some(cause) if err.is_cancellation() => {
                debug!(
                    stage = %self.name,
                    replica = self.replica,
                    %cause,
                    "stage replica interrupted"
                );
                let _ = self.interrupted.set(cause);
                Ok(())
            }
            _ => Err(err),
        }
    }
}

async fn supervise<B>(
    name: String,
    mut replicas: JoinSet<FlowResult<()>>,
    output: Sender<Flow<B>>,
    interrupted: InterruptCell,
) where
    B: Send + 'static,
{
    while let Some(joined) = replicas.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(stage = %name, error = %err, "stage replica stopped with an error");
            }
            Err(join_err) => {
                let err = flow_error!(ErrorKind::WorkerPanic, "Stage replica panicked", join_err);
                error!(stage = %name, error = %err, "stage replica panicked");
                if let Err(push_err) = output.push_unbounded(Flow::Failed(err)) {
                    warn!(stage = %name, error = %push_err, "could not publish replica panic");
                }
            }
        }
    }

    debug!(stage = %name, "stage finished");
    finish_output(&name, output, &interrupted);
}

/// Emits every value of `items` as [`Flow::Item`], then closes the returned channel.
///
/// Stops early with a single [`Flow::Interrupted`] marker when `ctx` fires. A panicking iterator
/// ends the stream with a [`Flow::Failed`] record of kind [`ErrorKind::WorkerPanic`].
pub fn source<T, I>(ctx: &Context, items: I, capacity: usize) -> Receiver<Flow<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
{
    let (output, output_rx) = bounded(capacity);
    let interrupted = InterruptCell::default();

    let mut generators = JoinSet::new();
    generators.spawn(generate(
        ctx.clone(),
        items.into_iter(),
        output.clone().with_context(ctx),
        interrupted.clone(),
    ));
    tokio::spawn(supervise(
        "source".to_owned(),
        generators,
        output,
        interrupted,
    ));

    output_rx
}

async fn generate<T, I>(
    ctx: Context,
    items: I,
    output: Sender<Flow<T>>,
    interrupted: InterruptCell,
) -> FlowResult<()>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
{
    for item in items {
        if let Err(err) = output.send(Flow::Item(item)).await {
            return match ctx.cause() {
                Some(cause) if err.is_cancellation() => {
                    let _ = interrupted.set(cause);
                    Ok(())
                }
                _ => Err(err),
            };
        }
    }

    Ok(())
}

/// Applies a fallible synchronous transform to every item.
pub fn map<A, B, F>(
    ctx: &Context,
    name: &str,
    config: &StageConfig,
    input: Receiver<Flow<A>>,
    transform: F,
) -> FlowResult<Receiver<Flow<B>>>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> FlowResult<B> + Send + Sync + 'static,
{
    let transform = Arc::new(transform);
    spawn_stage(ctx, name, config, input, move |item| {
        let transform = transform.clone();
        async move { Some(transform(item)) }
    })
}

/// Keeps the items matching `predicate` and drops the others.
pub fn filter<A, P>(
    ctx: &Context,
    name: &str,
    config: &StageConfig,
    input: Receiver<Flow<A>>,
    predicate: P,
) -> FlowResult<Receiver<Flow<A>>>
where
    A: Send + 'static,
    P: Fn(&A) -> bool + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    spawn_stage(ctx, name, config, input, move |item| {
        let predicate = predicate.clone();
        async move { predicate(&item).then_some(Ok(item)) }
    })
}

/// Applies a fallible asynchronous transform to every item.
pub fn then<A, B, F, Fut>(
    ctx: &Context,
    name: &str,
    config: &StageConfig,
    input: Receiver<Flow<A>>,
    transform: F,
) -> FlowResult<Receiver<Flow<B>>>
where
    A: Send + 'static,
    B: Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FlowResult<B>> + Send + 'static,
{
    spawn_stage(ctx, name, config, input, move |item| {
        let transformed = transform(item);
        async move { Some(transformed.await) }
    })
}

/// Forwards items no faster than `limiter` admits them.
///
/// Failures pass through without waiting for an admission.
pub fn throttle<A, S>(
    ctx: &Context,
    name: &str,
    capacity: usize,
    input: Receiver<Flow<A>>,
    limiter: RateLimiter<S>,
) -> FlowResult<Receiver<Flow<A>>>
where
    A: Send + 'static,
    S: TickSource + 'static,
{
    let config = StageConfig {
        replicas: 1,
        capacity,
    };
    let limiter = Arc::new(Mutex::new(limiter.with_context(ctx)));

    spawn_stage(ctx, name, &config, input, move |item| {
        let limiter = limiter.clone();
        async move { Some(limiter.lock().await.admit().await.map(|()| item)) }
    })
}
