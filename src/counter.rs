//! Bounded counter used for admission control.
//!
//! `BoundedCounter` is a size-valued cell with an upper limit: `add` blocks
//! while the increment would push the value past the limit, `sub` wakes
//! waiters, and `invalidate` releases every waiter unconditionally (used on
//! cancellation so no worker stays parked on the gate).
//!
//! The compress engine runs two of these: one capping the aggregate
//! uncompressed bytes in flight, and one counting live compressed buffers so
//! both can be asserted zero when a task ends.

use std::sync::{Condvar, Mutex};

struct State {
    value: u64,
    invalid: bool,
}

pub struct BoundedCounter {
    limit: u64,
    state: Mutex<State>,
    cond: Condvar,
}

impl BoundedCounter {
    pub fn new(start: u64, limit: u64) -> Self {
        BoundedCounter {
            limit,
            state: Mutex::new(State {
                value: start,
                invalid: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Add `n`, blocking while `value + n` would exceed the limit.
    ///
    /// Returns immediately once the counter has been invalidated; the value
    /// is still incremented so the caller's matching `sub` stays balanced.
    pub fn add(&self, n: u64) {
        let mut s = self.state.lock().unwrap();
        while !s.invalid && s.value + n > self.limit {
            s = self.cond.wait(s).unwrap();
        }
        s.value += n;
    }

    /// Subtract `n` and wake all waiters.
    pub fn sub(&self, n: u64) {
        let mut s = self.state.lock().unwrap();
        s.value = s.value.saturating_sub(n);
        self.cond.notify_all();
    }

    pub fn get(&self) -> u64 {
        self.state.lock().unwrap().value
    }

    pub fn set(&self, value: u64) {
        let mut s = self.state.lock().unwrap();
        s.value = value;
        self.cond.notify_all();
    }

    /// Release all current and future `add` waiters for the remaining
    /// lifetime of the counter.
    pub fn invalidate(&self) {
        let mut s = self.state.lock().unwrap();
        s.invalid = true;
        self.cond.notify_all();
    }
}
