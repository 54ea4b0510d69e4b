//! Sticky completion signal for blocking status queries.

use std::sync::{Condvar, Mutex};

/// A one-way latch: once signaled it stays satisfied, and every current and
/// future waiter is released. The manual-reset event of the operation
/// machinery; each async operation signals its latch exactly once.
pub(crate) struct WaitSignal {
    satisfied: Mutex<bool>,
    cond: Condvar,
}

impl WaitSignal {
    pub(crate) fn new() -> Self {
        WaitSignal {
            satisfied: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        let mut satisfied = self.satisfied.lock().unwrap_or_else(|e| e.into_inner());
        *satisfied = true;
        drop(satisfied);
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut satisfied = self.satisfied.lock().unwrap_or_else(|e| e.into_inner());
        while !*satisfied {
            satisfied = self
                .cond
                .wait(satisfied)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}
