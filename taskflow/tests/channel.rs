use std::time::Duration;

use taskflow::concurrency::channel::{TryRecvError, bounded};
use taskflow::error::{ErrorClass, ErrorKind};
use taskflow_telemetry::tracing::init_test_tracing;

mod common;

use common::drain;

#[tokio::test]
async fn second_close_is_reported_and_resources_are_still_released() {
    init_test_tracing();

    let (jobs_tx, jobs_rx) = bounded(4);
    let (results_tx, results_rx) = bounded(4);

    jobs_tx.send(1u32).await.unwrap();
    jobs_tx.close().unwrap();
    let err = jobs_tx.close().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelAlreadyClosed);
    assert_eq!(err.class(), ErrorClass::ProtocolViolation);

    // The failed close neither reopens the channel nor blocks the sibling channel from closing.
    results_tx.send(2u32).await.unwrap();
    results_tx.close().unwrap();

    assert_eq!(drain(jobs_rx).await, vec![1]);
    assert_eq!(drain(results_rx).await, vec![2]);
}

#[tokio::test]
async fn sending_after_close_fails() {
    init_test_tracing();

    let (tx, rx) = bounded(1);
    tx.close().unwrap();

    let err = tx.send(5u8).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SendOnClosedChannel);
    assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_receiver_unblocks_senders() {
    init_test_tracing();

    let (tx, rx) = bounded(1);
    tx.send(1u64).await.unwrap();

    let blocked = tokio::spawn(async move { tx.send(2).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(rx);

    let err = blocked.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelAbandoned);
}

#[tokio::test]
async fn values_are_received_in_send_order() {
    init_test_tracing();

    let (tx, rx) = bounded(3);
    let producer = tokio::spawn(async move {
        for value in 0..50u32 {
            tx.send(value).await.unwrap();
        }
    });

    assert_eq!(drain(rx).await, (0..50).collect::<Vec<_>>());
    producer.await.unwrap();
}
