//! Deadline thread for delayed callback submission.
//!
//! A queue family lazily starts one timer thread holding a min-heap of
//! `(deadline, id, action)` entries. Arming returns a [`TimerToken`] whose
//! `cancel` removes the entry and drops its action, releasing whatever the
//! action captured exactly once.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type TimerAction = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    deadline: Instant,
    id: u64,
    action: TimerAction,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the heap pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct TimerState {
    entries: BinaryHeap<TimerEntry>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Handle to a pending delayed submission.
pub struct TimerToken {
    shared: Arc<TimerShared>,
    id: u64,
}

impl TimerToken {
    /// Cancel the pending action. Returns `true` if the action had not fired
    /// yet; its captures are dropped before this returns.
    pub fn cancel(self) -> bool {
        let mut state = lock(&self.shared.state);
        let entries = std::mem::take(&mut state.entries);
        let (removed, kept): (Vec<_>, Vec<_>) =
            entries.into_vec().into_iter().partition(|e| e.id == self.id);
        state.entries = BinaryHeap::from(kept);
        drop(state);

        // Dropping the removed action may release queue or state references;
        // that must happen outside the timer lock.
        let canceled = !removed.is_empty();
        drop(removed);
        canceled
    }
}

pub(crate) struct TimerThread {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub(crate) fn start() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                next_id: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let handle = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || timer_loop(shared))
        };
        TimerThread {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Schedule `action` to run after `delay`.
    pub(crate) fn arm(&self, delay: Duration, action: impl FnOnce() + Send + 'static) -> TimerToken {
        let id;
        {
            let mut state = lock(&self.shared.state);
            id = state.next_id;
            state.next_id += 1;
            state.entries.push(TimerEntry {
                deadline: Instant::now() + delay,
                id,
                action: Box::new(action),
            });
        }
        self.shared.cond.notify_all();
        TimerToken {
            shared: Arc::clone(&self.shared),
            id,
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
        }
        self.shared.cond.notify_all();

        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // The timer thread itself dropped the last reference from
                // inside a fired action; detach instead of self-joining.
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut state = lock(&shared.state);
    loop {
        if state.shutdown {
            break;
        }
        let next_deadline = state.entries.peek().map(|e| e.deadline);
        match next_deadline {
            None => {
                state = shared.cond.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    if let Some(entry) = state.entries.pop() {
                        drop(state);
                        (entry.action)();
                        state = lock(&shared.state);
                    }
                } else {
                    let (guard, _) = shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = guard;
                }
            }
        }
    }
    // Unfired entries drop outside the lock so their captures can release
    // queue references freely.
    let remaining = std::mem::take(&mut state.entries);
    drop(state);
    drop(remaining);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fires_after_delay() {
        let timer = TimerThread::start();
        let fired = Arc::new(AtomicU32::new(0));
        let _token = {
            let fired = Arc::clone(&fired);
            timer.arm(Duration::from_millis(10), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_prevents_firing() {
        let timer = TimerThread::start();
        let fired = Arc::new(AtomicU32::new(0));
        let token = {
            let fired = Arc::clone(&fired);
            timer.arm(Duration::from_secs(60), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(token.cancel());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn earliest_deadline_fires_first() {
        let timer = TimerThread::start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, label) in [(40u64, 2u32), (10, 1)] {
            let order = Arc::clone(&order);
            let _ = timer.arm(Duration::from_millis(delay), move || {
                order.lock().unwrap().push(label);
            });
        }
        thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
