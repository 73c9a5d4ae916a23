use std::future::Future;

use crate::concurrency::context::Context;
use crate::error::FlowResult;

/// Trait for background workers started under a cancellation context.
///
/// Starting a worker spawns its tasks and returns immediately with a handle that can be used to
/// observe progress and wait for completion. Workers stop cooperatively once the context fires.
///
/// The generic parameter `H` represents the handle type returned when the worker starts,
/// and `S` represents the state type accessible through the handle.
pub trait Worker<H, S>
where
    H: WorkerHandle<S>,
{
    /// Error type returned when worker startup fails.
    type Error;

    /// Starts the worker under `ctx` and returns a handle for monitoring its execution.
    ///
    /// Must be called from within a tokio runtime.
    fn start(self, ctx: &Context) -> Result<H, Self::Error>;
}

/// Handle for monitoring a running worker.
///
/// The handle remains valid after the worker completes, so the final state can still be read.
pub trait WorkerHandle<S> {
    /// Value produced by the worker once it completes.
    type Output;

    /// Returns a snapshot of the worker's state.
    ///
    /// The snapshot may be outdated as soon as it is returned.
    fn state(&self) -> S;

    /// Waits for the worker to complete and returns its output.
    fn wait(self) -> impl Future<Output = FlowResult<Self::Output>> + Send;
}
