//! Shared mutable state reachable only through a lock.
//!
//! [`Guarded`] and [`GuardedRw`] hand the protected value to a closure and release the lock when
//! the closure returns or unwinds. Critical sections are synchronous, so a guard can recognize an
//! attempt to lock it again from inside its own critical section on the same thread and report
//! [`ErrorKind::ReentrantLock`] instead of deadlocking.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::error;

use crate::bail;
use crate::error::{ErrorKind, FlowResult};

static NEXT_GUARD_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Guards whose critical section is currently running on this thread.
    static HELD_GUARDS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn next_guard_id() -> u64 {
    NEXT_GUARD_ID.fetch_add(1, Ordering::Relaxed)
}

/// Marks a guard as held by the current thread until dropped.
struct HeldMarker {
    guard_id: u64,
}

impl HeldMarker {
    fn enter(guard_id: u64) -> FlowResult<Self> {
        let reentrant = HELD_GUARDS.with_borrow_mut(|held| {
            if held.contains(&guard_id) {
                return true;
            }
            held.push(guard_id);
            false
        });

        if reentrant {
            error!(guard_id, "guarded state locked again from its own critical section");
            bail!(
                ErrorKind::ReentrantLock,
                "Guarded state is already locked by this critical section"
            );
        }

        Ok(Self { guard_id })
    }
}

impl Drop for HeldMarker {
    fn drop(&mut self) {
        HELD_GUARDS.with_borrow_mut(|held| {
            if let Some(position) = held.iter().rposition(|id| *id == self.guard_id) {
                held.remove(position);
            }
        });
    }
}

/// State behind an exclusive lock.
pub struct Guarded<S> {
    id: u64,
    state: Mutex<S>,
}

impl<S> Guarded<S> {
    pub fn new(state: S) -> Self {
        Self {
            id: next_guard_id(),
            state: Mutex::new(state),
        }
    }

    /// Runs `f` with exclusive access to the state.
    ///
    /// Fails with [`ErrorKind::ReentrantLock`] when called from inside `f` of the same guard.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut S) -> R) -> FlowResult<R> {
        let _held = HeldMarker::enter(self.id)?;
        let mut state = self.state.lock();

        Ok(f(&mut state))
    }

    /// Consumes the guard and returns the state.
    pub fn into_inner(self) -> S {
        self.state.into_inner()
    }
}

impl<S: Default> Default for Guarded<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> fmt::Debug for Guarded<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded").field("id", &self.id).finish_non_exhaustive()
    }
}

/// State behind a reader-writer lock.
///
/// Any number of readers run concurrently; a writer runs alone.
pub struct GuardedRw<S> {
    id: u64,
    state: RwLock<S>,
}

impl<S> GuardedRw<S> {
    pub fn new(state: S) -> Self {
        Self {
            id: next_guard_id(),
            state: RwLock::new(state),
        }
    }

    /// Runs `f` with shared access to the state.
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> FlowResult<R> {
        let _held = HeldMarker::enter(self.id)?;
        let state = self.state.read();

        Ok(f(&state))
    }

    /// Runs `f` with exclusive access to the state.
    pub fn write<R>(&self, f: impl FnOnce(&mut S) -> R) -> FlowResult<R> {
        let _held = HeldMarker::enter(self.id)?;
        let mut state = self.state.write();

        Ok(f(&mut state))
    }

    /// Consumes the guard and returns the state.
    pub fn into_inner(self) -> S {
        self.state.into_inner()
    }
}

impl<S: Default> Default for GuardedRw<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> fmt::Debug for GuardedRw<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedRw")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Counter safe to increment from many tasks at once.
#[derive(Debug, Default)]
pub struct Counter {
    value: Guarded<u64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one and returns the new value.
    pub fn increment(&self) -> FlowResult<u64> {
        self.add(1)
    }

    /// Adds `amount` and returns the new value.
    pub fn add(&self, amount: u64) -> FlowResult<u64> {
        self.value.with_lock(|value| {
            *value += amount;
            *value
        })
    }

    pub fn get(&self) -> FlowResult<u64> {
        self.value.with_lock(|value| *value)
    }
}

/// Counters indexed by key, safe to update from many tasks at once.
#[derive(Debug)]
pub struct KeyedCounter<K> {
    counts: GuardedRw<HashMap<K, u64>>,
}

impl<K> KeyedCounter<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            counts: GuardedRw::new(HashMap::new()),
        }
    }

    /// Adds one to the counter of `key` and returns its new value.
    pub fn increment(&self, key: K) -> FlowResult<u64> {
        self.counts.write(|counts| {
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            *count
        })
    }

    /// Returns the counter of `key`, zero for keys never incremented.
    pub fn value(&self, key: &K) -> FlowResult<u64> {
        self.counts
            .read(|counts| counts.get(key).copied().unwrap_or_default())
    }

    /// Returns a copy of every counter.
    pub fn snapshot(&self) -> FlowResult<HashMap<K, u64>>
    where
        K: Clone,
    {
        self.counts.read(HashMap::clone)
    }
}

impl<K> Default for KeyedCounter<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
