//! Capacity-bounded multi-producer multi-consumer channel.
//!
//! Values are delivered in FIFO order. Every blocking operation of a half bound to a [`Context`]
//! races against the context's done signal and fails with a cancellation error when it fires,
//! leaving the channel exactly as it was before the call.
//!
//! Closing is a capability of the sending half. A channel closes explicitly through
//! [`Sender::close`] or implicitly when its last [`Sender`] is dropped. Once closed, receivers drain
//! the buffered values and then observe `None`. When the last [`Receiver`] is dropped the channel is
//! abandoned: buffered values are discarded and every send fails with
//! [`ErrorKind::ChannelAbandoned`].
//!
//! A capacity of zero gives a rendezvous channel where [`Sender::send`] returns only once a
//! receiver has taken the value.

use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::bail;
use crate::concurrency::context::{Context, check_cancelled, fired};
use crate::error::{ErrorKind, FlowResult};

/// Error returned by [`Sender::try_send`]. The rejected value is handed back.
#[derive(PartialEq, Eq)]
pub enum TrySendError<T> {
    /// The channel has no room without waiting.
    Full(T),
    /// The channel is closed or abandoned.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Returns the value that could not be sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(value) | TrySendError::Closed(value) => value,
        }
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => f.write_str("Full(..)"),
            TrySendError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// Error returned by [`Receiver::try_recv`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    /// No value is buffered right now.
    Empty,
    /// The channel is closed and drained.
    Closed,
}

struct Slot<T> {
    ticket: u64,
    value: T,
}

struct State<T> {
    /// Buffered values ordered by ascending ticket.
    buffer: VecDeque<Slot<T>>,
    next_ticket: u64,
    /// Ticket of the most recently received value. Tickets up to this one were delivered.
    last_taken: u64,
    closed: bool,
    senders: usize,
    receivers: usize,
    /// Receivers currently waiting for a value, which lets `try_send` hand off on rendezvous
    /// channels.
    parked_receivers: usize,
}

impl<T> State<T> {
    fn push(&mut self, value: T) -> u64 {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.buffer.push_back(Slot { ticket, value });
        ticket
    }

    fn pop(&mut self) -> Option<T> {
        let slot = self.buffer.pop_front()?;
        self.last_taken = slot.ticket;
        Some(slot.value)
    }

    fn is_delivered(&self, ticket: u64) -> bool {
        ticket <= self.last_taken
    }

    /// Removes a value that has not been received yet.
    fn withdraw(&mut self, ticket: u64) -> Option<T> {
        let position = self.buffer.iter().position(|slot| slot.ticket == ticket)?;
        self.buffer.remove(position).map(|slot| slot.value)
    }

    fn is_abandoned(&self) -> bool {
        self.receivers == 0
    }
}

struct Shared<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    /// Signalled when a value is buffered or the channel closes.
    readable: Notify,
    /// Signalled when a value is taken, the channel closes or the channel is abandoned.
    writable: Notify,
}

impl<T> Shared<T> {
    fn has_room(&self, state: &State<T>) -> bool {
        state.buffer.len() < self.capacity.max(state.parked_receivers)
    }

    fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }
}

/// Creates a bounded channel holding at most `capacity` values.
///
/// Both halves start without a bound context; see [`Sender::with_context`] and
/// [`Receiver::with_context`].
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        capacity,
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity),
            next_ticket: 0,
            last_taken: 0,
            closed: false,
            senders: 1,
            receivers: 1,
            parked_receivers: 0,
        }),
        readable: Notify::new(),
        writable: Notify::new(),
    });

    (
        Sender {
            shared: shared.clone(),
            ctx: None,
        },
        Receiver { shared, ctx: None },
    )
}

fn send_on_closed<T>() -> FlowResult<T> {
    bail!(
        ErrorKind::SendOnClosedChannel,
        "Attempted to send on a closed channel"
    );
}

fn abandoned<T>() -> FlowResult<T> {
    warn!("send on a channel without receivers, the value is discarded");
    bail!(
        ErrorKind::ChannelAbandoned,
        "All receivers of the channel were dropped"
    );
}

/// Sending half of a bounded channel.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
    ctx: Option<Context>,
}

impl<T> Sender<T> {
    /// Binds this half to `ctx`; blocking sends fail once the context fires.
    pub fn with_context(mut self, ctx: &Context) -> Self {
        self.ctx = Some(ctx.clone());
        self
    }

    /// Sends `value`, waiting for room or, on a rendezvous channel, for a receiver to take it.
    ///
    /// Fails with a cancellation error if the bound context fires first, in which case the value
    /// was not delivered. Fails with [`ErrorKind::SendOnClosedChannel`] if the channel is or becomes
    /// closed and with [`ErrorKind::ChannelAbandoned`] if every receiver is gone.
    pub async fn send(&self, value: T) -> FlowResult<()> {
        check_cancelled(self.ctx.as_ref())?;

        if self.shared.capacity == 0 {
            self.send_rendezvous(value).await
        } else {
            self.send_buffered(value).await
        }
    }

    async fn send_buffered(&self, value: T) -> FlowResult<()> {
        loop {
            let mut notified = pin!(self.shared.writable.notified());
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return send_on_closed();
                }
                if state.is_abandoned() {
                    return abandoned();
                }
                if self.shared.has_room(&state) {
                    state.push(value);
                    drop(state);
                    self.shared.readable.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                biased;
                cause = fired(self.ctx.as_ref()) => return Err(cause.into()),
                _ = notified => {}
            }
        }
    }

    async fn send_rendezvous(&self, value: T) -> FlowResult<()> {
        let ticket = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return send_on_closed();
            }
            if state.is_abandoned() {
                return abandoned();
            }
            state.push(value)
        };
        self.shared.readable.notify_waiters();

        loop {
            let mut notified = pin!(self.shared.writable.notified());
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if state.is_delivered(ticket) {
                    return Ok(());
                }
                if state.closed {
                    let withdrawn = state.withdraw(ticket);
                    drop(state);
                    drop(withdrawn);
                    return send_on_closed();
                }
                if state.is_abandoned() {
                    return abandoned();
                }
            }

            tokio::select! {
                biased;
                cause = fired(self.ctx.as_ref()) => {
                    let mut state = self.shared.state.lock();
                    if state.is_delivered(ticket) {
                        return Ok(());
                    }
                    let withdrawn = state.withdraw(ticket);
                    drop(state);
                    drop(withdrawn);
                    return Err(cause.into());
                }
                _ = notified => {}
            }
        }
    }

    /// Sends `value` only if that is possible without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut state = self.shared.state.lock();
        if state.closed || state.is_abandoned() {
            return Err(TrySendError::Closed(value));
        }
        if !self.shared.has_room(&state) {
            return Err(TrySendError::Full(value));
        }

        state.push(value);
        drop(state);
        self.shared.readable.notify_waiters();

        Ok(())
    }

    /// Buffers `value` ignoring the capacity.
    ///
    /// Reserved for diagnostics and end-of-stream markers that must not block a supervisor.
    pub(crate) fn push_unbounded(&self, value: T) -> FlowResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return send_on_closed();
            }
            if state.is_abandoned() {
                return abandoned();
            }
            state.push(value);
        }
        self.shared.readable.notify_waiters();

        Ok(())
    }

    /// Closes the channel.
    ///
    /// Receivers drain what is buffered and then observe `None`; blocked senders fail. Closing a
    /// channel twice fails with [`ErrorKind::ChannelAlreadyClosed`].
    pub fn close(&self) -> FlowResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                drop(state);
                error!("attempted to close a channel that is already closed");
                bail!(
                    ErrorKind::ChannelAlreadyClosed,
                    "Channel was already closed"
                );
            }
            state.closed = true;
        }
        self.shared.wake_all();

        Ok(())
    }

    /// Returns `true` once the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Returns the configured capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().senders += 1;

        Self {
            shared: self.shared.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let closed_now = {
            let mut state = self.shared.state.lock();
            state.senders -= 1;
            if state.senders == 0 && !state.closed {
                state.closed = true;
                true
            } else {
                false
            }
        };

        if closed_now {
            self.shared.wake_all();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

/// Receiving half of a bounded channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
    ctx: Option<Context>,
}

/// Keeps [`State::parked_receivers`] accurate even when a waiting receive is dropped.
struct ParkedGuard<'a, T> {
    shared: &'a Shared<T>,
}

impl<'a, T> ParkedGuard<'a, T> {
    fn park(shared: &'a Shared<T>, state: &mut State<T>) -> Self {
        state.parked_receivers += 1;
        Self { shared }
    }
}

impl<T> Drop for ParkedGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.state.lock().parked_receivers -= 1;
    }
}

impl<T> Receiver<T> {
    /// Binds this half to `ctx`; blocking receives fail once the context fires.
    pub fn with_context(mut self, ctx: &Context) -> Self {
        self.ctx = Some(ctx.clone());
        self
    }

    /// Receives the next value.
    ///
    /// Returns `Ok(None)` once the channel is closed and drained, and a cancellation error if the
    /// bound context fires first.
    pub async fn recv(&self) -> FlowResult<Option<T>> {
        check_cancelled(self.ctx.as_ref())?;

        let mut parked = None;
        loop {
            let mut notified = pin!(self.shared.readable.notified());
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if let Some(value) = state.pop() {
                    drop(state);
                    self.shared.writable.notify_waiters();
                    return Ok(Some(value));
                }
                if state.closed {
                    return Ok(None);
                }
                if parked.is_none() {
                    parked = Some(ParkedGuard::park(&self.shared, &mut state));
                }
            }

            tokio::select! {
                biased;
                cause = fired(self.ctx.as_ref()) => return Err(cause.into()),
                _ = notified => {}
            }
        }
    }

    /// Receives a value only if one is buffered.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut state = self.shared.state.lock();
        match state.pop() {
            Some(value) => {
                drop(state);
                self.shared.writable.notify_waiters();
                Ok(value)
            }
            None if state.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Converts the receiver into a stream that ends when the channel is closed and drained, or
    /// when the bound context fires.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |receiver| async move {
            match receiver.recv().await {
                Ok(Some(value)) => Some((value, receiver)),
                Ok(None) | Err(_) => None,
            }
        })
    }

    /// Returns the number of buffered values.
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Returns `true` when no value is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the channel is closed, even if values are still buffered.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Returns the context this half is bound to, if any.
    pub fn context(&self) -> Option<&Context> {
        self.ctx.as_ref()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().receivers += 1;

        Self {
            shared: self.shared.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.receivers -= 1;
            if state.receivers > 0 {
                return;
            }
            std::mem::take(&mut state.buffer)
        };

        // Values are dropped outside of the lock.
        drop(discarded);
        self.shared.writable.notify_waiters();
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

/// Creates a channel whose halves are both bound to `ctx`.
pub fn bounded_with_context<T>(ctx: &Context, capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = bounded(capacity);
    (tx.with_context(ctx), rx.with_context(ctx))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn values_are_received_in_fifo_order() {
        let (tx, rx) = bounded(4);
        for value in 0..4 {
            tx.send(value).await.unwrap();
        }
        drop(tx);

        let mut received = Vec::new();
        while let Some(value) = rx.recv().await.unwrap() {
            received.push(value);
        }
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn closed_channel_drains_before_reporting_none() {
        let (tx, rx) = bounded(2);
        tx.send("a").await.unwrap();
        tx.close().unwrap();

        assert_eq!(rx.recv().await.unwrap(), Some("a"));
        assert_eq!(rx.recv().await.unwrap(), None);
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn send_after_close_is_a_protocol_violation() {
        let (tx, _rx) = bounded(1);
        tx.close().unwrap();

        let err = tx.send(1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SendOnClosedChannel);
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn double_close_is_rejected() {
        let (tx, rx) = bounded::<u8>(1);
        tx.close().unwrap();

        let err = tx.close().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelAlreadyClosed);
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropping_last_sender_closes_the_channel() {
        let (tx, rx) = bounded::<u8>(1);
        let other = tx.clone();
        drop(tx);
        assert!(!rx.is_closed());

        drop(other);
        assert!(rx.is_closed());
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn full_channel_blocks_until_a_value_is_taken() {
        let (tx, rx) = bounded(1);
        tx.send(1).await.unwrap();

        let blocked = tokio::spawn(async move {
            tx.send(2).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        assert_eq!(rx.recv().await.unwrap(), Some(1));
        blocked.await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn cancelled_send_leaves_the_buffer_untouched() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let (tx, rx) = bounded(1);
        let tx = tx.with_context(&ctx);
        tx.send(1).await.unwrap();

        let pending = tokio::spawn(async move { tx.send(2).await });
        tokio::task::yield_now().await;
        cancel.cancel();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.recv().await.unwrap(), Some(1));
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_receiving() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let (tx, rx) = bounded(1);
        let rx = rx.with_context(&ctx);
        tx.send(1).await.unwrap();
        cancel.cancel();

        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(rx.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out_with_deadline_context() {
        let (ctx, _cancel) = Context::with_timeout(&Context::background(), Duration::from_secs(1));
        let (_tx, rx) = bounded::<u8>(1);
        let rx = rx.with_context(&ctx);

        let err = rx.recv().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn rendezvous_send_completes_when_value_is_taken() {
        let (tx, rx) = bounded(0);

        let sender = tokio::spawn(async move {
            tx.send(42).await.unwrap();
            tx
        });

        assert_eq!(rx.recv().await.unwrap(), Some(42));
        let tx = sender.await.unwrap();
        assert!(matches!(tx.try_send(1), Err(TrySendError::Full(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_rendezvous_send_withdraws_its_value() {
        let (ctx, _cancel) =
            Context::with_timeout(&Context::background(), Duration::from_millis(10));
        let (tx, rx) = bounded(0);
        let tx = tx.with_context(&ctx);

        let err = tx.send(7).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert!(rx.is_empty());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn closing_wakes_blocked_receivers() {
        let (tx, rx) = bounded::<u8>(1);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move { rx.recv().await })
            })
            .collect();
        tokio::task::yield_now().await;
        tx.close().unwrap();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), None);
        }
    }

    #[tokio::test]
    async fn closing_fails_blocked_senders() {
        let (tx, _rx) = bounded(1);
        tx.send(1).await.unwrap();

        let blocked = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.send(2).await })
        };
        tokio::task::yield_now().await;
        tx.close().unwrap();

        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SendOnClosedChannel);
    }

    #[tokio::test]
    async fn dropping_every_receiver_abandons_the_channel() {
        let (tx, rx) = bounded(1);
        tx.send(1).await.unwrap();

        let blocked = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.send(2).await })
        };
        tokio::task::yield_now().await;
        drop(rx);

        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChannelAbandoned);
        assert!(matches!(tx.try_send(3), Err(TrySendError::Closed(3))));
    }

    #[test]
    fn try_operations_report_without_waiting() {
        let (tx, rx) = bounded(1);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        tx.try_send(1).unwrap();
        assert_eq!(tx.try_send(2).unwrap_err().into_inner(), 2);

        assert_eq!(rx.try_recv(), Ok(1));
        drop(tx);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[tokio::test]
    async fn unbounded_push_ignores_capacity() {
        let (tx, rx) = bounded(1);
        tx.send(1).await.unwrap();
        tx.push_unbounded(2).unwrap();
        drop(tx);

        let values: Vec<_> = rx.into_stream().collect().await;
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn many_producers_and_consumers_deliver_every_value_once() {
        let (tx, rx) = bounded(3);

        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    for value in 0..25 {
                        tx.send(producer * 100 + value).await.unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(value) = rx.recv().await.unwrap() {
                        seen.push(value);
                    }
                    seen
                })
            })
            .collect();
        drop(rx);

        for producer in producers {
            producer.await.unwrap();
        }
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();

        let mut expected: Vec<_> = (0..4)
            .flat_map(|producer| (0..25).map(move |value| producer * 100 + value))
            .collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
    }
}
