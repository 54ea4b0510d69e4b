//! Dual-lane callback queue.
//!
//! An [`AsyncQueue`] carries two ordered callback lanes — Work and
//! Completion — each with its own dispatch mode. Entries are FIFO per
//! (queue, lane); there is no ordering between lanes or between queues.
//! Queues derived with [`new_shared`](AsyncQueue::new_shared) share the
//! parent's worker pool and timer but keep their own lanes.
//!
//! Handles are cheap clones. Dropping the last handle closes the queue:
//! further submissions fail, pool lanes drain what was already queued, and
//! the family's pool and timer shut down once the drain finishes — even if
//! the last handle was dropped from inside one of the queue's own callbacks
//! (the pool's action-complete handshake makes that re-entrant close safe).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::list::LocklessList;
use crate::metrics::{CALLBACKS_DISPATCHED, CALLBACKS_REMOVED, CALLBACKS_SUBMITTED};
use crate::pool::{ActionComplete, ThreadPool};
use crate::timer::{TimerThread, TimerToken};

/// Which lane of a queue a callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Background work for an operation.
    Work,
    /// Delivery of an operation's completion.
    Completion,
}

/// How a lane delivers its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Callbacks accumulate until the caller pumps [`AsyncQueue::dispatch`].
    Manual,
    /// Like `Manual`, but only the thread that created the queue may pump.
    FixedThread,
    /// Callbacks run on the queue family's worker pool.
    ThreadPool,
    /// Callbacks run inline on the submitting thread.
    Immediate,
    /// Like `ThreadPool`, but at most one callback from this lane runs at a
    /// time, in submission order.
    SerializedThreadPool,
}

impl DispatchMode {
    fn uses_pool(self) -> bool {
        matches!(self, DispatchMode::ThreadPool | DispatchMode::SerializedThreadPool)
    }
}

type CallbackFn = Box<dyn FnOnce() + Send + 'static>;
type SubmitHook = Arc<dyn Fn(CallbackKind) + Send + Sync + 'static>;

struct Entry {
    tag: usize,
    run: CallbackFn,
}

struct LaneSync {
    serialized_active: bool,
}

struct Lane {
    mode: DispatchMode,
    owner: Option<ThreadId>,
    entries: LocklessList<Entry>,
    pending: AtomicUsize,
    sync: Mutex<LaneSync>,
    ready: Condvar,
}

impl Lane {
    fn new(mode: DispatchMode) -> Self {
        let owner = match mode {
            DispatchMode::FixedThread => Some(thread::current().id()),
            _ => None,
        };
        Lane {
            mode,
            owner,
            entries: LocklessList::new(),
            pending: AtomicUsize::new(0),
            sync: Mutex::new(LaneSync {
                serialized_active: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn take_entry(&self) -> Option<Entry> {
        let entry = self.entries.pop_front()?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }
}

/// Shared machinery of a queue family: one worker pool and one timer thread
/// serving a parent queue and everything derived from it.
struct Family {
    pool: Mutex<Option<Arc<ThreadPool>>>,
    actions: Arc<LocklessList<PoolAction>>,
    timer: Mutex<Option<Arc<TimerThread>>>,
}

struct PoolAction {
    core: Arc<QueueCore>,
    kind: CallbackKind,
}

impl Family {
    fn new() -> Arc<Self> {
        Arc::new(Family {
            pool: Mutex::new(None),
            actions: Arc::new(LocklessList::new()),
            timer: Mutex::new(None),
        })
    }

    fn ensure_pool(&self) -> Arc<ThreadPool> {
        let mut pool = lock(&self.pool);
        if let Some(pool) = pool.as_ref() {
            return Arc::clone(pool);
        }
        let actions = Arc::clone(&self.actions);
        let created = Arc::new(ThreadPool::new(Arc::new(move |token: ActionComplete| {
            if let Some(action) = actions.pop_front() {
                let PoolAction { core, kind } = action;
                core.pool_dispatch(kind, token);
                // `core` drops here, after the action acknowledged; a close
                // triggered by that drop sees the action already accounted.
            }
        })));
        *pool = Some(Arc::clone(&created));
        created
    }

    fn ensure_timer(&self) -> Arc<TimerThread> {
        let mut timer = lock(&self.timer);
        if let Some(timer) = timer.as_ref() {
            return Arc::clone(timer);
        }
        let created = Arc::new(TimerThread::start());
        *timer = Some(Arc::clone(&created));
        created
    }
}

struct QueueCore {
    work: Lane,
    completion: Lane,
    family: Arc<Family>,
    handles: AtomicUsize,
    closed: AtomicBool,
    hooks: Mutex<Vec<(u64, SubmitHook)>>,
    next_hook_id: AtomicU64,
}

impl QueueCore {
    fn lane(&self, kind: CallbackKind) -> &Lane {
        match kind {
            CallbackKind::Work => &self.work,
            CallbackKind::Completion => &self.completion,
        }
    }

    fn submit_entry(core: &Arc<QueueCore>, kind: CallbackKind, tag: usize, run: CallbackFn) -> Result<()> {
        if core.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let lane = core.lane(kind);
        CALLBACKS_SUBMITTED.increment();

        match lane.mode {
            DispatchMode::Immediate => {
                core.notify_hooks(kind);
                run();
                CALLBACKS_DISPATCHED.increment();
            }
            DispatchMode::Manual | DispatchMode::FixedThread => {
                lane.entries.push_back(Entry { tag, run });
                lane.pending.fetch_add(1, Ordering::AcqRel);
                // Pairing with the dispatcher's check-then-wait; an empty
                // critical section is enough to avoid a lost wakeup.
                drop(lock(&lane.sync));
                lane.ready.notify_all();
                core.notify_hooks(kind);
            }
            DispatchMode::ThreadPool | DispatchMode::SerializedThreadPool => {
                lane.entries.push_back(Entry { tag, run });
                lane.pending.fetch_add(1, Ordering::AcqRel);
                let pool = core.family.ensure_pool();
                core.family.actions.push_back(PoolAction {
                    core: Arc::clone(core),
                    kind,
                });
                pool.submit();
                core.notify_hooks(kind);
            }
        }
        Ok(())
    }

    fn pool_dispatch(&self, kind: CallbackKind, token: ActionComplete) {
        let lane = self.lane(kind);
        match lane.mode {
            DispatchMode::ThreadPool => {
                if let Some(entry) = lane.take_entry() {
                    (entry.run)();
                    CALLBACKS_DISPATCHED.increment();
                }
                token.complete();
            }
            DispatchMode::SerializedThreadPool => {
                loop {
                    {
                        let mut sync = lock(&lane.sync);
                        if sync.serialized_active {
                            // Another worker is draining this lane; the
                            // entry for this action will be picked up there.
                            break;
                        }
                        sync.serialized_active = true;
                    }
                    while let Some(entry) = lane.take_entry() {
                        (entry.run)();
                        CALLBACKS_DISPATCHED.increment();
                    }
                    {
                        let mut sync = lock(&lane.sync);
                        sync.serialized_active = false;
                    }
                    if lane.entries.empty() {
                        break;
                    }
                    // New entries landed between the drain and the flag
                    // clear; try to reclaim the lane.
                }
                token.complete();
            }
            _ => token.complete(),
        }
    }

    fn notify_hooks(&self, kind: CallbackKind) {
        let hooks: Vec<SubmitHook> = lock(&self.hooks)
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook(kind);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for lane in [&self.work, &self.completion] {
            drop(lock(&lane.sync));
            lane.ready.notify_all();
        }
    }
}

/// Handle to a dual-lane callback queue. Clone to duplicate; dropping the
/// last handle closes the queue.
pub struct AsyncQueue {
    core: Arc<QueueCore>,
}

impl AsyncQueue {
    /// Create a queue with independent dispatch modes for its Work and
    /// Completion lanes. `FixedThread` lanes are pinned to the calling
    /// thread.
    pub fn new(work_mode: DispatchMode, completion_mode: DispatchMode) -> AsyncQueue {
        Self::with_family(Family::new(), work_mode, completion_mode)
    }

    /// Create a queue that shares this queue's worker pool and timer but has
    /// its own callback lanes.
    pub fn new_shared(&self, work_mode: DispatchMode, completion_mode: DispatchMode) -> AsyncQueue {
        Self::with_family(Arc::clone(&self.core.family), work_mode, completion_mode)
    }

    fn with_family(
        family: Arc<Family>,
        work_mode: DispatchMode,
        completion_mode: DispatchMode,
    ) -> AsyncQueue {
        let core = Arc::new(QueueCore {
            work: Lane::new(work_mode),
            completion: Lane::new(completion_mode),
            family,
            handles: AtomicUsize::new(1),
            closed: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
        });
        if work_mode.uses_pool() || completion_mode.uses_pool() {
            core.family.ensure_pool();
        }
        AsyncQueue { core }
    }

    /// Submit a callback to a lane. The only failable path: submission to a
    /// closed queue returns [`Error::Closed`].
    pub fn submit(&self, kind: CallbackKind, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.submit_callback(kind, 0, f)
    }

    /// Submit a callback carrying an opaque `tag`, the revocation key for
    /// [`remove_callbacks`](Self::remove_callbacks).
    pub fn submit_callback(
        &self,
        kind: CallbackKind,
        tag: usize,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        QueueCore::submit_entry(&self.core, kind, tag, Box::new(f))
    }

    /// Submit a callback after `delay`. A zero delay submits immediately and
    /// returns `None`; otherwise the returned token cancels the pending
    /// submission, dropping the callback and everything it captured.
    pub fn submit_callback_after(
        &self,
        kind: CallbackKind,
        tag: usize,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<Option<TimerToken>> {
        if delay.is_zero() {
            self.submit_callback(kind, tag, f)?;
            return Ok(None);
        }
        if self.core.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let timer = self.core.family.ensure_timer();
        let weak: Weak<QueueCore> = Arc::downgrade(&self.core);
        let token = timer.arm(delay, move || {
            if let Some(core) = weak.upgrade() {
                let _ = QueueCore::submit_entry(&core, kind, tag, Box::new(f));
            }
        });
        Ok(Some(token))
    }

    /// Run the next queued callback on the calling thread, waiting up to
    /// `timeout` for one to arrive. Returns whether a callback ran. Valid
    /// only for `Manual` lanes and, from the owning thread, `FixedThread`
    /// lanes.
    pub fn dispatch(&self, kind: CallbackKind, timeout: Duration) -> Result<bool> {
        let lane = self.core.lane(kind);
        match lane.mode {
            DispatchMode::Manual => {}
            DispatchMode::FixedThread => {
                if lane.owner != Some(thread::current().id()) {
                    return Err(Error::InvalidArg);
                }
            }
            _ => return Err(Error::InvalidArg),
        }

        let deadline = Instant::now() + timeout;
        let mut sync = lock(&lane.sync);
        loop {
            if let Some(entry) = lane.take_entry() {
                drop(sync);
                (entry.run)();
                CALLBACKS_DISPATCHED.increment();
                return Ok(true);
            }
            if self.core.closed.load(Ordering::Acquire) {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (guard, _) = lane
                .ready
                .wait_timeout(sync, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            sync = guard;
        }
    }

    /// Drop every queued callback in `kind` whose tag satisfies `predicate`.
    /// Dropped callbacks release whatever they captured before this returns.
    /// Surviving entries keep their relative order.
    pub fn remove_callbacks(&self, kind: CallbackKind, mut predicate: impl FnMut(usize) -> bool) {
        let lane = self.core.lane(kind);
        let survivors = LocklessList::new();
        let mut removed = Vec::new();

        while let Some(entry) = lane.entries.pop_front_node() {
            if predicate(entry.value().tag) {
                lane.pending.fetch_sub(1, Ordering::AcqRel);
                CALLBACKS_REMOVED.increment();
                removed.push(entry.into_value());
            } else {
                survivors.push_back_node(entry);
            }
        }
        while let Some(entry) = survivors.pop_front_node() {
            lane.entries.push_back_node(entry);
        }

        drop(removed);
    }

    /// Whether a lane has no queued callbacks. Approximate while other
    /// threads are submitting or dispatching.
    pub fn is_empty(&self, kind: CallbackKind) -> bool {
        self.core.lane(kind).pending.load(Ordering::Acquire) == 0
    }

    /// Register a hook invoked after every submission to this queue.
    /// Returns an id for [`unregister_submit_hook`](Self::unregister_submit_hook).
    pub fn register_submit_hook(&self, hook: impl Fn(CallbackKind) + Send + Sync + 'static) -> u64 {
        let id = self.core.next_hook_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.core.hooks).push((id, Arc::new(hook)));
        id
    }

    /// Remove a previously registered submit hook.
    pub fn unregister_submit_hook(&self, id: u64) {
        lock(&self.core.hooks).retain(|(hook_id, _)| *hook_id != id);
    }
}

impl Clone for AsyncQueue {
    fn clone(&self) -> Self {
        self.core.handles.fetch_add(1, Ordering::AcqRel);
        AsyncQueue {
            core: Arc::clone(&self.core),
        }
    }
}

impl Drop for AsyncQueue {
    fn drop(&mut self) {
        if self.core.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.close();
        }
    }
}

impl std::fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("work_mode", &self.core.work.mode)
            .field("completion_mode", &self.core.completion.mode)
            .field("closed", &self.core.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
