//! Demand-driven element streams.
//!
//! A stream is a [`Producer`] / [`Consumer`] pair. The consumer grants demand
//! and the producer may emit at most as many elements as were granted. Either
//! side may end the stream, after which it stays in its [`Terminal`] state
//! forever.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt as _};

use crate::{Result, Status};

mod state;

pub use async_stream::{stream, try_stream};
pub use state::Terminal;
use state::{Shared, State};

/// A stream of replies as returned by streaming service methods.
pub type ReplyStream<T> = BoxStream<'static, Result<T>>;

/// One event a producer can emit.
#[derive(Debug)]
pub enum Signal<T> {
    Next(T),
    End,
    Fail(Status),
}

/// The emitting half of a stream.
///
/// Dropping an open producer cancels the stream.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

/// The receiving half of a stream.
///
/// Elements are read through its [`Stream`] implementation. A failed or
/// cancelled stream yields its status once and then ends. Dropping an open
/// consumer cancels the stream.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    prefetch: u64,
}

/// Creates a connected producer / consumer pair with no initial demand.
pub fn channel<T>() -> (Producer<T>, Consumer<T>) {
    let shared = Arc::new(Shared::default());
    let producer = Producer {
        shared: shared.clone(),
    };
    let consumer = Consumer {
        shared,
        prefetch: 0,
    };
    (producer, consumer)
}

/// A consumer for a stream that already failed with `status`.
pub fn failed<T>(status: Status) -> Consumer<T> {
    let (producer, consumer) = channel();
    producer.fail(status);
    consumer
}

impl<T> Producer<T> {
    /// Emits one signal.
    ///
    /// Signals on a stream that already ended are ignored. Emitting an element
    /// without outstanding demand fails the stream and returns the failure.
    pub fn produce(&self, signal: Signal<T>) -> Result<()> {
        match signal {
            Signal::Next(item) => match self.try_push(item) {
                Ok(None) | Err(_) => Ok(()),
                Ok(Some(_)) => {
                    let status = Status::demand_exceeded();
                    self.shared.terminate(Terminal::Failed(status.clone()));
                    Err(status)
                }
            },
            Signal::End => {
                self.shared.terminate(Terminal::Completed);
                Ok(())
            }
            Signal::Fail(status) => {
                self.shared.terminate(Terminal::Failed(status));
                Ok(())
            }
        }
    }

    /// Emits `item` as soon as the consumer grants demand for it.
    ///
    /// Fails with the stream's status once it ended.
    pub async fn send(&self, item: T) -> Result<()> {
        let mut item = item;
        loop {
            let notified = self.shared.producer.notified();
            match self.try_push(item) {
                Ok(None) => return Ok(()),
                Ok(Some(back)) => item = back,
                Err(terminal) => return Err(terminal.closed_status()),
            }
            notified.await;
        }
    }

    // Pushes `item` if there is demand for it, hands it back otherwise.
    fn try_push(&self, item: T) -> Result<Option<T>, Terminal> {
        let waker = {
            let mut state = self.shared.lock();
            if let Some(terminal) = &state.terminal {
                return Err(terminal.clone());
            }
            if state.demand() == 0 {
                return Ok(Some(item));
            }
            state.produced += 1;
            state.buffer.push_back(item);
            state.consumer_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(None)
    }

    /// Elements that may still be emitted.
    pub fn demand(&self) -> u64 {
        self.shared.lock().demand()
    }

    /// Total demand granted so far.
    pub fn granted(&self) -> u64 {
        self.shared.lock().granted
    }

    /// Waits until the total granted demand exceeds `seen`.
    ///
    /// Returns the new total, or `None` once the stream ended.
    pub async fn wait_granted(&self, seen: u64) -> Option<u64> {
        loop {
            let notified = self.shared.producer.notified();
            {
                let state = self.shared.lock();
                if state.terminal.is_some() {
                    return None;
                }
                if state.granted > seen {
                    return Some(state.granted);
                }
            }
            notified.await;
        }
    }

    /// Waits until some demand is outstanding.
    ///
    /// Returns it, or `None` once the stream ended.
    pub async fn wait_demand(&self) -> Option<u64> {
        loop {
            let notified = self.shared.producer.notified();
            {
                let state = self.shared.lock();
                if state.terminal.is_some() {
                    return None;
                }
                if state.demand() > 0 {
                    return Some(state.demand());
                }
            }
            notified.await;
        }
    }

    /// Waits until the stream ended, from either side.
    pub async fn closed(&self) -> Terminal {
        loop {
            let notified = self.shared.producer.notified();
            if let Some(terminal) = self.shared.terminal() {
                return terminal;
            }
            notified.await;
        }
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.shared.terminal()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal().is_some()
    }

    pub fn complete(&self) {
        self.shared.terminate(Terminal::Completed);
    }

    pub fn fail(&self, status: Status) {
        self.shared.terminate(Terminal::Failed(status));
    }

    pub fn cancel(&self) {
        self.shared.terminate(Terminal::Cancelled);
    }

    /// Runs `handler` once when the stream ends, right away if it already did.
    pub fn on_terminal(&self, handler: impl FnOnce(&Terminal) + Send + 'static) {
        self.shared.on_terminal(Box::new(handler));
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> Consumer<T> {
    /// Grants demand for `n` more elements. Zero is a no-op.
    pub fn request(&self, n: u64) {
        if self.shared.lock().grant(n) {
            self.shared.producer.notify_waiters();
        }
    }

    /// Keeps up to `window` elements requested ahead of consumption.
    ///
    /// Demand is topped up whenever fewer than half of them remain in flight.
    #[must_use]
    pub fn with_prefetch(mut self, window: u32) -> Self {
        self.prefetch = window.into();
        let notify = {
            let mut state = self.shared.lock();
            self.top_up(&mut state)
        };
        if notify {
            self.shared.producer.notify_waiters();
        }
        self
    }

    fn top_up(&self, state: &mut State<T>) -> bool {
        if self.prefetch == 0 {
            return false;
        }
        let in_flight = state.buffer.len() as u64 + state.demand();
        if in_flight > self.prefetch / 2 {
            return false;
        }
        state.grant(self.prefetch - in_flight)
    }

    pub fn cancel(&self) {
        self.shared.terminate(Terminal::Cancelled);
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.shared.terminal()
    }

    /// Runs `handler` once when the stream ends, right away if it already did.
    pub fn on_terminal(&self, handler: impl FnOnce(&Terminal) + Send + 'static) {
        self.shared.on_terminal(Box::new(handler));
    }

    /// Like `next`, but gives up after `timeout` with `DeadlineExceeded`.
    ///
    /// Giving up leaves the stream untouched.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<T>> {
        match tokio::time::timeout(timeout, self.next()).await {
            Err(_) => Err(Status::wait_timeout(timeout)),
            Ok(None) => Ok(None),
            Ok(Some(item)) => item.map(Some),
        }
    }
}

impl<T> Stream for Consumer<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut state = this.shared.lock();

        if let Some(item) = state.buffer.pop_front() {
            let notify = this.top_up(&mut state);
            drop(state);
            if notify {
                this.shared.producer.notify_waiters();
            }
            return Poll::Ready(Some(Ok(item)));
        }

        let Some(status) = state.terminal.as_ref().map(Terminal::status) else {
            let notify = this.top_up(&mut state);
            state.consumer_waker = Some(cx.waker().clone());
            drop(state);
            if notify {
                this.shared.producer.notify_waiters();
            }
            return Poll::Pending;
        };

        match status {
            Some(status) if !state.failure_reported => {
                state.failure_reported = true;
                Poll::Ready(Some(Err(status)))
            }
            _ => Poll::Ready(None),
        }
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Forwards every element of `source` into `producer`, pacing it by demand.
///
/// The source is only polled while demand is outstanding. Ends the stream
/// with the source, or fails it with the first error the source yields.
pub async fn forward<T, S>(producer: &Producer<T>, source: S)
where
    S: Stream<Item = Result<T>>,
{
    let mut source = std::pin::pin!(source);
    loop {
        if producer.wait_demand().await.is_none() {
            return;
        }
        match source.next().await {
            Some(Ok(item)) => {
                if producer.send(item).await.is_err() {
                    return;
                }
            }
            Some(Err(status)) => return producer.fail(status),
            None => return producer.complete(),
        }
    }
}
