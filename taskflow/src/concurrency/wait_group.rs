//! Completion counter for a dynamic set of concurrent units.

use std::sync::Arc;

use tokio::sync::watch;

/// Counts live [`WaitGuard`]s and lets waiters block until none are left.
///
/// Every unit takes a guard with [`WaitGroup::enter`] before it is spawned and releases it by
/// dropping it, so an early return or a panic inside the unit still counts as done.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    count: Arc<watch::Sender<usize>>,
}

/// Registration of one unit in a [`WaitGroup`], released on drop.
#[derive(Debug)]
#[must_use = "the unit is considered done as soon as the guard is dropped"]
pub struct WaitGuard {
    count: Arc<watch::Sender<usize>>,
}

impl WaitGroup {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Registers one more unit.
    pub fn enter(&self) -> WaitGuard {
        self.count.send_modify(|count| *count += 1);
        WaitGuard {
            count: self.count.clone(),
        }
    }

    /// Returns the number of units still registered.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Waits until every registered unit released its guard.
    ///
    /// Returns immediately when nothing is registered.
    pub async fn wait(&self) {
        let mut count_rx = self.count.subscribe();
        // The sender is owned by `self`, so waiting cannot fail.
        let _ = count_rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}
