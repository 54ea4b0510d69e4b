//! Worker pool that pumps the pool-mode callback lanes.
//!
//! Workers park on a condition variable keyed to a pending-call counter;
//! [`ThreadPool::submit`] wakes one of them to invoke the registered
//! callback. The callback receives an [`ActionComplete`] token it may consume
//! early to declare "I am no longer touching queue state", which lets a
//! callback tear down the queue that is driving it while the worker's stack
//! unwinds. Termination waits for every entered-but-unacknowledged
//! invocation before joining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::metrics::POOL_WAKEUPS;

pub(crate) type PoolCallback = Arc<dyn Fn(ActionComplete) + Send + Sync + 'static>;

struct WakeState {
    calls: u32,
    terminate: bool,
}

struct PoolShared {
    wake: Mutex<WakeState>,
    wake_cond: Condvar,
    active: Mutex<u32>,
    active_cond: Condvar,
    callback: PoolCallback,
}

/// Fixed-size pool of parked worker threads.
pub(crate) struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl ThreadPool {
    /// Spawn `max(1, available_parallelism)` workers, each invoking
    /// `callback` once per submitted action.
    pub(crate) fn new(callback: PoolCallback) -> Self {
        let shared = Arc::new(PoolShared {
            wake: Mutex::new(WakeState {
                calls: 0,
                terminate: false,
            }),
            wake_cond: Condvar::new(),
            active: Mutex::new(0),
            active_cond: Condvar::new(),
            callback,
        });

        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let shared = Arc::clone(&shared);
            workers.push(thread::spawn(move || worker_loop(shared)));
        }

        ThreadPool {
            shared,
            workers: Mutex::new(workers),
            terminated: AtomicBool::new(false),
        }
    }

    /// Queue one callback invocation and wake a worker.
    pub(crate) fn submit(&self) {
        {
            let mut active = lock(&self.shared.active);
            *active += 1;
        }
        {
            let mut wake = lock(&self.shared.wake);
            wake.calls += 1;
        }
        self.shared.wake_cond.notify_one();
        POOL_WAKEUPS.increment();
    }

    /// Stop the pool: wake every worker, wait until all entered actions have
    /// acknowledged completion, then join. A worker terminating its own pool
    /// detaches itself instead of joining (safe self-termination).
    pub(crate) fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut wake = lock(&self.shared.wake);
            wake.terminate = true;
        }
        self.shared.wake_cond.notify_all();

        {
            let mut active = lock(&self.shared.active);
            while *active != 0 {
                active = self
                    .shared
                    .active_cond
                    .wait(active)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }

        let workers = std::mem::take(&mut *lock(&self.workers));
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() == me {
                // Called from inside a pool callback; dropping the handle
                // detaches this thread so it can finish unwinding.
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let mut wake = lock(&shared.wake);
    loop {
        while wake.calls == 0 && !wake.terminate {
            wake = shared
                .wake_cond
                .wait(wake)
                .unwrap_or_else(|e| e.into_inner());
        }
        if wake.terminate {
            break;
        }
        wake.calls -= 1;
        drop(wake);

        let token = ActionComplete {
            shared: Arc::clone(&shared),
            done: false,
        };
        (shared.callback)(token);

        wake = lock(&shared.wake);
    }
}

/// Handshake token for one pool action. Consuming it (or dropping it when
/// the callback returns) decrements the pool's active-call count; consuming
/// it early releases the pool to be terminated from inside the callback.
pub(crate) struct ActionComplete {
    shared: Arc<PoolShared>,
    done: bool,
}

impl ActionComplete {
    /// Acknowledge the action before the callback unwinds.
    pub(crate) fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let mut active = lock(&self.shared.active);
        *active -= 1;
        drop(active);
        self.shared.active_cond.notify_all();
    }
}

impl Drop for ActionComplete {
    fn drop(&mut self) {
        self.finish();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn submit_invokes_callback() {
        let ran = Arc::new(AtomicU32::new(0));
        let pool = {
            let ran = Arc::clone(&ran);
            ThreadPool::new(Arc::new(move |_token| {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
        };

        for _ in 0..8 {
            pool.submit();
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) != 8 && std::time::Instant::now() < deadline {
            thread::yield_now();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
        pool.terminate();
    }

    #[test]
    fn terminate_waits_for_unacknowledged_actions() {
        let pool = ThreadPool::new(Arc::new(move |token| {
            thread::sleep(Duration::from_millis(20));
            token.complete();
        }));
        pool.submit();
        // Terminate must block until the sleeping action acknowledges.
        pool.terminate();
    }

    #[test]
    fn early_complete_lets_callback_outlive_acknowledgement() {
        let after_ack = Arc::new(AtomicU32::new(0));
        let pool = {
            let after_ack = Arc::clone(&after_ack);
            ThreadPool::new(Arc::new(move |token| {
                token.complete();
                // Still running after acknowledging; must not break
                // termination accounting.
                after_ack.fetch_add(1, Ordering::SeqCst);
            }))
        };
        pool.submit();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while after_ack.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::yield_now();
        }
        pool.terminate();
        assert_eq!(after_ack.load(Ordering::SeqCst), 1);
    }
}
