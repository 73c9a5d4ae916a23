//! Fan-out and fan-in over channels.

use tracing::{debug, error};

use crate::bail;
use crate::concurrency::channel::{Receiver, bounded};
use crate::concurrency::context::Context;
use crate::concurrency::wait_group::WaitGroup;
use crate::error::{ErrorKind, FlowResult};
use crate::pipeline::stage::{InterruptCell, finish_output};
use crate::task::Flow;

/// Splits `input` between `consumers` receivers bound to `ctx`.
///
/// The receivers compete for values, so every value reaches exactly one of them and the union of
/// what they receive is the input.
pub fn fan_out<T>(
    ctx: &Context,
    input: Receiver<T>,
    consumers: usize,
) -> FlowResult<Vec<Receiver<T>>> {
    if consumers == 0 {
        bail!(
            ErrorKind::InvalidConfiguration,
            "Fan-out needs at least one consumer"
        );
    }

    let receivers = (0..consumers)
        .map(|_| input.clone().with_context(ctx))
        .collect();

    Ok(receivers)
}

/// Forwards every input into a single channel of the given capacity.
///
/// One forwarder runs per input, tracked by a [`WaitGroup`]; the merged channel closes only after
/// every forwarder drained its input. Interruption markers from the inputs are collapsed into one,
/// emitted right before the merged channel closes.
pub fn merge<T>(
    ctx: &Context,
    inputs: Vec<Receiver<Flow<T>>>,
    capacity: usize,
) -> FlowResult<Receiver<Flow<T>>>
where
    T: Send + 'static,
{
    if inputs.is_empty() {
        bail!(
            ErrorKind::InvalidConfiguration,
            "Merge needs at least one input"
        );
    }

    let (output, output_rx) = bounded(capacity);
    let forwarders = WaitGroup::new();
    let interrupted = InterruptCell::default();

    for (index, input) in inputs.into_iter().enumerate() {
        let guard = forwarders.enter();
        let ctx = ctx.clone();
        let input = input.with_context(&ctx);
        let output = output.clone().with_context(&ctx);
        let interrupted = interrupted.clone();

        tokio::spawn(async move {
            let _guard = guard;

            let err = loop {
                let flow = match input.recv().await {
                    Ok(Some(Flow::Interrupted(cause))) => {
                        let _ = interrupted.set(cause);
                        continue;
                    }
                    Ok(Some(flow)) => flow,
                    Ok(None) => {
                        debug!(input = index, "merge input drained");
                        return;
                    }
                    Err(err) => break err,
                };

                if let Err(err) = output.send(flow).await {
                    break err;
                }
            };

            match ctx.cause() {
                Some(cause) if err.is_cancellation() => {
                    let _ = interrupted.set(cause);
                }
                _ => error!(input = index, error = %err, "merge forwarder stopped with an error"),
            }
        });
    }

    tokio::spawn(async move {
        forwarders.wait().await;
        finish_output("merge", output, &interrupted);
    });

    Ok(output_rx)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::stage::source;

    async fn drain<T>(receiver: Receiver<Flow<T>>) -> Vec<Flow<T>> {
        let mut flows = Vec::new();
        while let Some(flow) = receiver.recv().await.unwrap() {
            flows.push(flow);
        }
        flows
    }

    #[tokio::test]
    async fn zero_consumers_or_inputs_are_rejected() {
        let ctx = Context::background();
        let (_tx, rx) = bounded::<Flow<u8>>(1);

        let err = fan_out(&ctx, rx, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        let err = merge::<u8>(&ctx, Vec::new(), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[tokio::test]
    async fn merge_forwards_every_input() {
        let ctx = Context::background();
        let inputs = vec![
            source(&ctx, vec![1, 2, 3], 1),
            source(&ctx, vec![10, 20], 0),
            source(&ctx, Vec::<i32>::new(), 0),
        ];

        let mut merged: Vec<_> = drain(merge(&ctx, inputs, 2).unwrap())
            .await
            .into_iter()
            .filter_map(Flow::into_item)
            .collect();
        merged.sort_unstable();

        assert_eq!(merged, vec![1, 2, 3, 10, 20]);
    }

    #[tokio::test]
    async fn fan_out_then_merge_preserves_the_multiset() {
        let ctx = Context::background();
        let numbers = source(&ctx, 0..50u32, 4);

        let branches = fan_out(&ctx, numbers, 3).unwrap();
        let merged = merge(&ctx, branches, 4).unwrap();

        let mut values: Vec<_> = drain(merged)
            .await
            .into_iter()
            .filter_map(Flow::into_item)
            .collect();
        values.sort_unstable();

        assert_eq!(values, (0..50u32).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn merged_output_carries_a_single_marker() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let inputs: Vec<_> = (0..3).map(|_| source(&ctx, 0.., 0)).collect();
        let merged = merge(&ctx, inputs, 0).unwrap();

        let first = merged.recv().await.unwrap();
        assert!(first.is_some());
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let rest = drain(merged).await;
        assert_eq!(rest.iter().filter(|flow| flow.is_interrupted()).count(), 1);
        assert!(rest.last().is_some_and(Flow::is_interrupted));
    }
}
