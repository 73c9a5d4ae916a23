//! Periodic tick sources driving the rate limiter.
//!
//! Production code ticks from a tokio [`Interval`], which follows the runtime's clock and can
//! therefore be paused and advanced in tests. [`ManualTicker`] ticks only when its
//! [`TickHandle`] says so, for tests that need to control admissions one by one.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::Interval;

/// Source of periodic ticks.
pub trait TickSource: Send {
    /// Waits for the next tick.
    fn tick(&mut self) -> impl Future<Output = ()> + Send;
}

impl TickSource for Interval {
    fn tick(&mut self) -> impl Future<Output = ()> + Send {
        async move {
            Interval::tick(self).await;
        }
    }
}

/// Tick source that only ticks when told to.
///
/// Ticks issued through the handle before anyone waits are stored and consumed one per
/// [`TickSource::tick`] call.
#[derive(Debug)]
pub struct ManualTicker {
    ticks: Arc<Semaphore>,
}

/// Issues ticks to a [`ManualTicker`].
#[derive(Debug, Clone)]
pub struct TickHandle {
    ticks: Arc<Semaphore>,
}

impl ManualTicker {
    /// Creates a ticker with no pending ticks and the handle that drives it.
    pub fn new() -> (Self, TickHandle) {
        let ticks = Arc::new(Semaphore::new(0));
        (
            Self {
                ticks: ticks.clone(),
            },
            TickHandle { ticks },
        )
    }
}

impl TickSource for ManualTicker {
    fn tick(&mut self) -> impl Future<Output = ()> + Send {
        let ticks = self.ticks.clone();
        async move {
            match ticks.acquire().await {
                Ok(permit) => permit.forget(),
                // The semaphore is never closed.
                Err(_) => std::future::pending().await,
            }
        }
    }
}

impl TickHandle {
    /// Issues a single tick.
    pub fn tick(&self) {
        self.ticks.add_permits(1);
    }

    /// Issues `count` ticks at once.
    pub fn tick_n(&self, count: usize) {
        self.ticks.add_permits(count);
    }

    /// Returns the number of ticks issued but not consumed yet.
    pub fn pending(&self) -> usize {
        self.ticks.available_permits()
    }
}
