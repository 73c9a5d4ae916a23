//! Units of work and the values that flow between orchestration stages.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::concurrency::context::Cause;
use crate::error::{ErrorKind, FlowError, FlowResult};
use crate::flow_error;

/// Identifier of a task, used for tracing and to correlate results with submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

type Executor<T, R> = Box<dyn FnOnce(T) -> BoxFuture<'static, FlowResult<R>> + Send>;

/// A payload together with the work to perform on it.
///
/// A task is consumed by [`Task::execute`], so it runs at most once.
pub struct Task<T, R> {
    id: TaskId,
    payload: T,
    executor: Executor<T, R>,
}

impl<T, R> Task<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Creates a task running an asynchronous executor.
    pub fn new<F, Fut>(id: TaskId, payload: T, executor: F) -> Self
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = FlowResult<R>> + Send + 'static,
    {
        Self {
            id,
            payload,
            executor: Box::new(move |payload| executor(payload).boxed()),
        }
    }

    /// Creates a task running a synchronous executor.
    pub fn from_fn<F>(id: TaskId, payload: T, executor: F) -> Self
    where
        F: FnOnce(T) -> FlowResult<R> + Send + 'static,
    {
        Self::new(id, payload, move |payload| {
            std::future::ready(executor(payload))
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Runs the task to completion.
    ///
    /// A panic inside the executor is caught and returned as [`ErrorKind::TaskPanicked`].
    pub async fn execute(self) -> FlowResult<R> {
        let Task {
            id,
            payload,
            executor,
        } = self;

        let run = async move { executor(payload).await };
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(flow_error!(
                ErrorKind::TaskPanicked,
                "Task panicked while executing",
                format!("{id}: {}", panic_message(panic.as_ref()))
            )),
        }
    }
}

impl<T, R> fmt::Debug for Task<T, R>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Outcome of one executed task.
#[derive(Debug, Clone)]
pub struct TaskResult<R> {
    pub task_id: TaskId,
    pub outcome: FlowResult<R>,
}

impl<R> TaskResult<R> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Value travelling through a pool or pipeline channel.
///
/// Failures are carried next to regular items instead of being dropped, and a run cut short by
/// its context ends with exactly one [`Flow::Interrupted`] marker.
#[derive(Debug, Clone)]
pub enum Flow<T> {
    /// A regular item.
    Item(T),
    /// An item that could not be produced.
    Failed(FlowError),
    /// The producing side stopped early because its context fired.
    Interrupted(Cause),
}

impl<T> Flow<T> {
    pub fn is_item(&self) -> bool {
        matches!(self, Flow::Item(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Flow::Failed(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Flow::Interrupted(_))
    }

    /// Returns the item, discarding failures and markers.
    pub fn into_item(self) -> Option<T> {
        match self {
            Flow::Item(item) => Some(item),
            Flow::Failed(_) | Flow::Interrupted(_) => None,
        }
    }

    /// Returns the failure, if this is one.
    pub fn failure(&self) -> Option<&FlowError> {
        match self {
            Flow::Failed(err) => Some(err),
            Flow::Item(_) | Flow::Interrupted(_) => None,
        }
    }
}

impl<T> From<FlowResult<T>> for Flow<T> {
    fn from(result: FlowResult<T>) -> Self {
        match result {
            Ok(item) => Flow::Item(item),
            Err(err) => Flow::Failed(err),
        }
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        return (*message).to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }

    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_async_and_sync_executors() {
        let doubled = Task::new(TaskId::new(1), 21, |value| async move { Ok(value * 2) });
        assert_eq!(doubled.id(), TaskId::new(1));
        assert_eq!(doubled.execute().await.unwrap(), 42);

        let failing = Task::<u32, u32>::from_fn(TaskId::new(2), 0, |_| {
            Err(flow_error!(ErrorKind::TaskFailed, "Nothing to do"))
        });
        assert_eq!(
            failing.execute().await.unwrap_err().kind(),
            ErrorKind::TaskFailed
        );
    }

    #[tokio::test]
    async fn panics_become_task_errors() {
        let task = Task::<u32, u32>::from_fn(TaskId::new(7), 0, |value| {
            if value == 0 {
                panic!("division by zero");
            }
            Ok(100 / value)
        });

        let err = task.execute().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskPanicked);
        assert_eq!(err.detail(), Some("task-7: division by zero"));
    }

    #[test]
    fn flow_converts_from_results() {
        let item: Flow<u8> = Ok(1).into();
        let failed: Flow<u8> = Err(flow_error!(ErrorKind::TaskFailed, "bad")).into();

        assert!(item.is_item());
        assert!(failed.is_failed());
        assert_eq!(failed.failure().unwrap().kind(), ErrorKind::TaskFailed);
        assert_eq!(Flow::<u8>::Interrupted(Cause::Cancelled).into_item(), None);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        let other: Box<dyn Any + Send> = Box::new(3);

        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
