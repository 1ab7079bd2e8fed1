//! Keep-latest hand-off between threads.
//!
//! A `LatestSlot` holds at most one pending value. Putting a value while one
//! is pending replaces it, so a slow consumer only ever sees the newest
//! frame and the producer never blocks.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Result of waiting on a slot.
#[derive(Debug, PartialEq, Eq)]
pub enum Take<T> {
    Value(T),
    TimedOut,
    Closed,
}

/// Result of storing into a slot.
#[derive(Debug, PartialEq, Eq)]
pub enum Put<T> {
    Stored,
    /// The pending value that was superseded.
    Replaced(T),
    /// The slot is closed; the value is handed back.
    Rejected(T),
}

#[derive(Debug)]
struct State<T> {
    pending: Option<T>,
    closed: bool,
}

#[derive(Debug)]
pub struct LatestSlot<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pending: None,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store `value`, superseding any pending value.
    pub fn put(&self, value: T) -> Put<T> {
        let Ok(mut state) = self.state.lock() else {
            return Put::Rejected(value);
        };
        if state.closed {
            return Put::Rejected(value);
        }
        let replaced = state.pending.replace(value);
        self.ready.notify_one();
        match replaced {
            Some(old) => Put::Replaced(old),
            None => Put::Stored,
        }
    }

    /// Take the pending value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.state.lock().ok().and_then(|mut state| state.pending.take())
    }

    /// Wait up to `timeout` for a value. A pending value is still returned
    /// after `close`; `Closed` is reported once the slot is drained.
    pub fn take_timeout(&self, timeout: Duration) -> Take<T> {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.state.lock() else {
            return Take::Closed;
        };
        loop {
            if let Some(value) = state.pending.take() {
                return Take::Value(value);
            }
            if state.closed {
                return Take::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Take::TimedOut;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return Take::Closed,
            };
        }
    }

    /// Wait until a value arrives or the slot is closed.
    pub fn take(&self) -> Option<T> {
        loop {
            match self.take_timeout(Duration::from_secs(1)) {
                Take::Value(value) => return Some(value),
                Take::Closed => return None,
                Take::TimedOut => continue,
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.pending.is_some())
            .unwrap_or(false)
    }

    /// Wake every waiter. Later `put`s are refused.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|state| state.closed).unwrap_or(true)
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
