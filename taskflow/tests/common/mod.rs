#![allow(dead_code)]

use std::time::Duration;

use taskflow::concurrency::channel::Receiver;
use taskflow::error::ErrorKind;
use taskflow::flow_error;
use taskflow::task::{Task, TaskId};

/// Tasks doubling their payload after yielding once, ids `0..count`.
pub fn doubling_tasks(count: u64) -> Vec<Task<u64, u64>> {
    (0..count)
        .map(|id| {
            Task::new(TaskId::new(id), id, |value| async move {
                tokio::task::yield_now().await;
                Ok(value * 2)
            })
        })
        .collect()
}

/// A task that sleeps for `delay` before returning its payload.
pub fn sleeping_task(id: u64, delay: Duration) -> Task<u64, u64> {
    Task::new(TaskId::new(id), id, move |value| async move {
        tokio::time::sleep(delay).await;
        Ok(value)
    })
}

/// A task that always fails with [`ErrorKind::TaskFailed`].
pub fn failing_task(id: u64) -> Task<u64, u64> {
    Task::from_fn(TaskId::new(id), id, |value| {
        Err(flow_error!(
            ErrorKind::TaskFailed,
            "Task refused its payload",
            value
        ))
    })
}

/// Receives until the channel closes.
pub async fn drain<T>(receiver: Receiver<T>) -> Vec<T> {
    let mut values = Vec::new();
    while let Some(value) = receiver.recv().await.unwrap() {
        values.push(value);
    }

    values
}
