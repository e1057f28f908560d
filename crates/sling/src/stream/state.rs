use std::collections::VecDeque;
use std::mem::take;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::Waker;

use tokio::sync::Notify;

use crate::Status;

/// The absorbing end states of a stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Terminal {
    Completed,
    Failed(Status),
    Cancelled,
}

impl Terminal {
    /// The failure a consumer (or a late producer) observes for this state.
    pub fn status(&self) -> Option<Status> {
        match self {
            Terminal::Completed => None,
            Terminal::Failed(status) => Some(status.clone()),
            Terminal::Cancelled => Some(Status::stream_cancelled()),
        }
    }

    pub(super) fn closed_status(&self) -> Status {
        self.status()
            .unwrap_or_else(|| Status::failed_precondition("Stream is already completed"))
    }
}

pub(super) type TerminalHandler = Box<dyn FnOnce(&Terminal) + Send>;

pub(super) struct State<T> {
    pub terminal: Option<Terminal>,
    pub buffer: VecDeque<T>,
    // cumulative counters, `produced <= granted` at all times
    pub granted: u64,
    pub produced: u64,
    pub failure_reported: bool,
    pub consumer_waker: Option<Waker>,
    pub handlers: Vec<TerminalHandler>,
}

impl<T> State<T> {
    pub fn demand(&self) -> u64 {
        self.granted - self.produced
    }

    /// Grants `n` more elements. Returns whether producers need waking.
    pub fn grant(&mut self, n: u64) -> bool {
        if n == 0 || self.terminal.is_some() {
            return false;
        }
        self.granted = self.granted.saturating_add(n);
        true
    }
}

pub(super) struct Shared<T> {
    state: Mutex<State<T>>,
    pub producer: Notify,
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                terminal: None,
                buffer: VecDeque::new(),
                granted: 0,
                produced: 0,
                failure_reported: false,
                consumer_waker: None,
                handlers: Vec::new(),
            }),
            producer: Notify::new(),
        }
    }
}

impl<T> Shared<T> {
    pub fn lock(&self) -> MutexGuard<'_, State<T>> {
        // the state stays consistent across panics in user callbacks,
        // which never run under the lock
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the stream into `terminal` unless it already ended.
    ///
    /// Wakes both sides and runs the terminal handlers, all outside the lock.
    pub fn terminate(&self, terminal: Terminal) -> bool {
        let (handlers, waker, _dropped) = {
            let mut state = self.lock();
            if state.terminal.is_some() {
                return false;
            }
            let dropped = match terminal {
                Terminal::Cancelled => take(&mut state.buffer),
                _ => VecDeque::new(),
            };
            state.terminal = Some(terminal.clone());
            (take(&mut state.handlers), state.consumer_waker.take(), dropped)
        };
        self.producer.notify_waiters();
        if let Some(waker) = waker {
            waker.wake();
        }
        for handler in handlers {
            handler(&terminal);
        }
        true
    }

    pub fn on_terminal(&self, handler: TerminalHandler) {
        let terminal = {
            let mut state = self.lock();
            match &state.terminal {
                Some(terminal) => terminal.clone(),
                None => {
                    state.handlers.push(handler);
                    return;
                }
            }
        };
        handler(&terminal);
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.lock().terminal.clone()
    }
}
