//! Hierarchical cancellation contexts.
//!
//! A [`Context`] is a node in a tree. Firing a node fires every descendant, synchronously with
//! respect to the call that fired it; descendants never affect their ancestors. A node fires at
//! most once and remembers why ([`Cause`]). Deadline contexts fire on their own when their
//! deadline elapses.
//!
//! The done signal is a [`watch`] channel so that any number of tasks can wait on it inside a
//! `tokio::select!` without polling. Children are held weakly by their parent: a subtree that is
//! no longer referenced is reclaimed without being cancelled first. A child holds its parent
//! strongly, so an ancestor's deadline keeps firing the child after every handle to the ancestor
//! is gone.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::error::{FlowError, FlowResult};

/// Reason a context fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cause {
    /// The context or one of its ancestors was cancelled explicitly.
    Cancelled,
    /// The deadline of the context or of one of its ancestors elapsed.
    DeadlineExceeded,
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Cancelled => "cancelled",
            Cause::DeadlineExceeded => "deadline exceeded",
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Node {
    /// `None` until the node fires, then the recorded cause forever.
    state: watch::Sender<Option<Cause>>,
    deadline: Option<Instant>,
    children: Mutex<Vec<Weak<Node>>>,
    /// Keeps the ancestor chain, and with it any ancestor deadline timer, reachable.
    _parent: Option<Arc<Node>>,
}

impl Node {
    fn new(deadline: Option<Instant>, parent: Option<Arc<Node>>) -> Arc<Self> {
        let (state, _) = watch::channel(None);
        Arc::new(Self {
            state,
            deadline,
            children: Mutex::new(Vec::new()),
            _parent: parent,
        })
    }

    fn cause(&self) -> Option<Cause> {
        *self.state.borrow()
    }

    /// Fires this node and its whole subtree. Returns `false` if the node had already fired.
    fn fire(&self, cause: Cause) -> bool {
        // The state is set before the children are taken, `adopt` relies on this ordering.
        let fired = self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(cause);
            true
        });

        if !fired {
            return false;
        }

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.fire(cause);
        }

        true
    }

    /// Registers `child` so it fires together with this node.
    ///
    /// A child adopted by a node that already fired is fired immediately with the same cause.
    fn adopt(&self, child: &Arc<Node>) {
        let mut children = self.children.lock();
        if let Some(cause) = self.cause() {
            drop(children);
            child.fire(cause);
            return;
        }

        children.retain(|child| child.strong_count() > 0);
        children.push(Arc::downgrade(child));
    }
}

/// Handle to a node of the cancellation tree.
///
/// Cloning a context is cheap and yields another handle to the same node. Long-running or blocking
/// work selects between its own operation and [`Context::done`], and stops without further side
/// effects once it resolves.
#[derive(Debug, Clone)]
pub struct Context {
    node: Arc<Node>,
}

impl Context {
    /// Returns a root context that never fires.
    pub fn background() -> Self {
        Self {
            node: Node::new(None, None),
        }
    }

    /// Derives a child context that fires when [`CancelHandle::cancel`] is called or when `parent`
    /// fires.
    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        let node = Node::new(parent.node.deadline, Some(parent.node.clone()));
        parent.node.adopt(&node);

        (
            Context { node: node.clone() },
            CancelHandle { node },
        )
    }

    /// Derives a child context that additionally fires with [`Cause::DeadlineExceeded`] once
    /// `timeout` has elapsed.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime, as the deadline is driven by a timer task.
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelHandle) {
        Self::with_deadline(parent, Instant::now() + timeout)
    }

    /// Derives a child context that additionally fires with [`Cause::DeadlineExceeded`] at
    /// `deadline`.
    ///
    /// The effective deadline is the earlier of `deadline` and the parent's deadline; when the
    /// parent's comes first, the parent's own timer fires the child.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime, as the deadline is driven by a timer task.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
        let inherited = parent.node.deadline.filter(|inherited| *inherited <= deadline);
        let node = Node::new(
            Some(inherited.unwrap_or(deadline)),
            Some(parent.node.clone()),
        );
        parent.node.adopt(&node);

        if inherited.is_none() {
            if deadline <= Instant::now() {
                node.fire(Cause::DeadlineExceeded);
            } else {
                spawn_deadline_timer(&node, deadline);
            }
        }

        (
            Context { node: node.clone() },
            CancelHandle { node },
        )
    }

    /// Waits until the context fires and returns the recorded cause.
    ///
    /// The returned future owns everything it needs, so it can be stored or moved into spawned
    /// tasks. For a context that never fires it stays pending forever.
    pub fn done(&self) -> impl Future<Output = Cause> + Send + 'static {
        let node = self.node.clone();

        async move {
            let mut state_rx = node.state.subscribe();
            let cause = match state_rx.wait_for(Option::is_some).await {
                Ok(state) => *state,
                Err(_) => None,
            };

            match cause {
                Some(cause) => cause,
                // The sender lives in `node`, which this future keeps alive.
                None => std::future::pending().await,
            }
        }
    }

    /// Returns the cause once the context fired, `None` before.
    pub fn cause(&self) -> Option<Cause> {
        self.node.cause()
    }

    /// Returns the cancellation error once the context fired, `None` before.
    pub fn err(&self) -> Option<FlowError> {
        self.cause().map(FlowError::from)
    }

    /// Returns `true` once the context fired.
    pub fn is_done(&self) -> bool {
        self.cause().is_some()
    }

    /// Returns the deadline after which the context fires on its own, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.node.deadline
    }

    /// Runs `future` to completion unless the context fires first.
    ///
    /// A context that already fired does not poll `future` at all.
    pub async fn run<F>(&self, future: F) -> FlowResult<F::Output>
    where
        F: Future,
    {
        if let Some(cause) = self.cause() {
            return Err(cause.into());
        }

        tokio::select! {
            biased;
            cause = self.done() => Err(cause.into()),
            output = future => Ok(output),
        }
    }
}

/// Capability to cancel one context and, through it, its whole subtree.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    node: Arc<Node>,
}

impl CancelHandle {
    /// Fires the context with [`Cause::Cancelled`].
    ///
    /// Every descendant has fired when this returns. Calling it again, or after the deadline
    /// already fired the context, has no effect.
    pub fn cancel(&self) {
        if self.node.fire(Cause::Cancelled) {
            debug!("context cancelled");
        }
    }

    /// Returns a guard that cancels the context when dropped.
    pub fn drop_guard(self) -> CancelOnDrop {
        CancelOnDrop { handle: self }
    }
}

/// Cancels its context when dropped, on every exit path of the owning scope.
#[derive(Debug)]
pub struct CancelOnDrop {
    handle: CancelHandle,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Spawns the task that fires `node` at `deadline`.
///
/// The task holds the node weakly and exits early when the node fires for another reason or is
/// dropped, so it never keeps a subtree alive.
fn spawn_deadline_timer(node: &Arc<Node>, deadline: Instant) {
    let weak_node = Arc::downgrade(node);
    let mut state_rx = node.state.subscribe();

    tokio::spawn(async move {
        tokio::select! {
            _ = sleep_until(deadline) => {
                if let Some(node) = weak_node.upgrade()
                    && node.fire(Cause::DeadlineExceeded)
                {
                    debug!("context deadline exceeded");
                }
            }
            _ = state_rx.wait_for(Option::is_some) => {}
        }
    });
}

/// Resolves when `ctx` fires. Without a context it never resolves.
pub(crate) async fn fired(ctx: Option<&Context>) -> Cause {
    match ctx {
        Some(ctx) => ctx.done().await,
        None => std::future::pending().await,
    }
}

/// Fails with the cancellation error of `ctx` if it already fired.
pub(crate) fn check_cancelled(ctx: Option<&Context>) -> FlowResult<()> {
    match ctx.and_then(Context::cause) {
        Some(cause) => Err(cause.into()),
        None => Ok(()),
    }
}

/// Bounds a single operation by `duration`.
///
/// Returns an error of kind [`crate::error::ErrorKind::DeadlineExceeded`] if `future` does not
/// complete in time; `future` is dropped in that case.
pub async fn timeout<F>(duration: Duration, future: F) -> FlowResult<F::Output>
where
    F: Future,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| FlowError::from(Cause::DeadlineExceeded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn background_context_never_fires() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn cancel_propagates_to_every_descendant() {
        let root = Context::background();
        let (parent, cancel_parent) = Context::with_cancel(&root);
        let (child, _cancel_child) = Context::with_cancel(&parent);
        let (grandchild, _cancel_grandchild) = Context::with_cancel(&child);
        let (sibling, _cancel_sibling) = Context::with_cancel(&root);

        cancel_parent.cancel();

        assert_eq!(parent.cause(), Some(Cause::Cancelled));
        assert_eq!(child.cause(), Some(Cause::Cancelled));
        assert_eq!(grandchild.cause(), Some(Cause::Cancelled));
        assert!(!sibling.is_done());
        assert!(!root.is_done());
    }

    #[test]
    fn cancelling_a_leaf_leaves_the_tree_untouched() {
        let root = Context::background();
        let (parent, _cancel_parent) = Context::with_cancel(&root);
        let (leaf, cancel_leaf) = Context::with_cancel(&parent);
        let (other_leaf, _cancel_other) = Context::with_cancel(&parent);

        cancel_leaf.cancel();
        cancel_leaf.cancel();

        assert!(leaf.is_done());
        assert!(!parent.is_done());
        assert!(!other_leaf.is_done());
    }

    #[test]
    fn child_of_fired_parent_is_born_fired() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        cancel.cancel();

        let (child, _cancel_child) = Context::with_cancel(&parent);
        assert_eq!(child.cause(), Some(Cause::Cancelled));
    }

    #[test]
    fn dropped_children_are_pruned() {
        let (parent, _cancel) = Context::with_cancel(&Context::background());
        for _ in 0..10 {
            let _ = Context::with_cancel(&parent);
        }
        let (_kept, _cancel_kept) = Context::with_cancel(&parent);

        assert_eq!(parent.node.children.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_with_deadline_exceeded() {
        let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!ctx.is_done());
        assert!(ctx.err().is_none());

        let cause = ctx.done().await;
        assert_eq!(cause, Cause::DeadlineExceeded);
        assert_eq!(ctx.err().unwrap().kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_timeout_keeps_deadline_cause() {
        let (ctx, cancel) =
            Context::with_timeout(&Context::background(), Duration::from_millis(10));

        ctx.done().await;
        cancel.cancel();

        assert_eq!(ctx.cause(), Some(Cause::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancel_before_deadline_reports_cancelled() {
        let (ctx, cancel) = Context::with_timeout(&Context::background(), Duration::from_secs(5));

        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(ctx.cause(), Some(Cause::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn child_inherits_earlier_parent_deadline() {
        let (parent, _cancel_parent) =
            Context::with_timeout(&Context::background(), Duration::from_secs(1));
        let (child, _cancel_child) = Context::with_timeout(&parent, Duration::from_secs(60));

        assert_eq!(child.deadline(), parent.deadline());

        let cause = child.done().await;
        assert_eq!(cause, Cause::DeadlineExceeded);
        assert!(parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_deadline_fires_immediately() {
        let past = Instant::now() - Duration::from_secs(1);
        let (ctx, _cancel) = Context::with_deadline(&Context::background(), past);

        assert_eq!(ctx.cause(), Some(Cause::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn inherited_deadline_fires_after_parent_handles_are_dropped() {
        let child = {
            let (parent, _cancel_parent) =
                Context::with_timeout(&Context::background(), Duration::from_secs(1));
            let (child, _cancel_child) = Context::with_cancel(&parent);
            child
        };
        assert!(child.deadline().is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(child.cause(), Some(Cause::DeadlineExceeded));
        assert_eq!(child.err().unwrap().kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn done_resolves_for_waiters_spawned_before_cancel() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());

        let waiters: Vec<_> = (0..4).map(|_| tokio::spawn(ctx.done())).collect();
        cancel.cancel();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), Cause::Cancelled);
        }
    }

    #[tokio::test]
    async fn run_stops_when_context_fires() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        cancel.cancel();

        let err = ctx.run(std::future::pending::<()>()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let ok = Context::background().run(async { 7 }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn drop_guard_cancels_on_scope_exit() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        {
            let _guard = cancel.drop_guard();
        }
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_a_single_operation() {
        let err = timeout(Duration::from_millis(50), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

        let value = timeout(Duration::from_millis(50), async { "done" })
            .await
            .unwrap();
        assert_eq!(value, "done");
    }
}
