//! Closable FIFO message queue.
//!
//! Worker threads block on `pop` until an item arrives or the queue is
//! closed. Producers `close` the queue after the final item; consumers drain
//! whatever is left and then observe `None`. A `push` against a closed queue
//! is refused and hands the item back.
//!
//! Unlike a channel, closing does not require dropping the producer side —
//! the engines close their queues while every thread still holds a reference.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct MessageQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        MessageQueue {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Append an item and wake one waiter. Returns `Err(item)` if closed.
    pub fn push(&self, item: T) -> std::result::Result<(), T> {
        let mut s = self.state.lock().unwrap();
        if s.closed {
            return Err(item);
        }
        s.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until an item is available or the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut s = self.state.lock().unwrap();
        while s.items.is_empty() && !s.closed {
            s = self.not_empty.wait(s).unwrap();
        }
        s.items.pop_front()
    }

    /// Like `pop`, but gives up after `timeout` without closing the queue.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut s = self.state.lock().unwrap();
        while s.items.is_empty() && !s.closed {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(s, deadline - now).unwrap();
            s = guard;
            if result.timed_out() && s.items.is_empty() {
                return None;
            }
        }
        s.items.pop_front()
    }

    /// Mark the queue closed and wake all waiters. Items already queued can
    /// still be popped.
    pub fn close(&self) {
        let mut s = self.state.lock().unwrap();
        s.closed = true;
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
