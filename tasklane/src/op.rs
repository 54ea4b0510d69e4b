//! Async operation protocol: blocks, providers, and the state machine
//! between them.
//!
//! An [`AsyncBlock`] is caller-created shared storage for one in-flight
//! operation. A provider implements [`AsyncProvider`] and is driven by the
//! runtime: [`schedule_async`] queues `do_work` on the block's Work lane;
//! the provider reports its terminal status through [`complete_async`];
//! callers observe it with [`get_async_status`] / [`get_async_result`] or
//! through the block's one-shot completion callback, delivered on the
//! Completion lane.
//!
//! The internal `(state, status)` pair is guarded by a spin lock held only
//! for pointer-sized work. The status makes a single transition from pending
//! to terminal, the completion callback fires at most once, and the block's
//! wait latch is signaled exactly once per operation.

use std::cell::{RefCell, UnsafeCell};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_utils::Backoff;

use crate::error::{Error, Result};
use crate::metrics::{OPS_CANCELED, OPS_COMPLETED};
use crate::queue::{AsyncQueue, CallbackKind, DispatchMode};
use crate::timer::TimerToken;
use crate::wait::WaitSignal;

const STATE_SIGNATURE: u32 = 0x4153_5445;

/// Token used by [`run_async`] operations for result retrieval.
pub const RUN_ASYNC_TOKEN: usize = 0x52_4e41;

static ACTIVE_STATES: AtomicIsize = AtomicIsize::new(0);

/// Number of live internal operation states. Returns to its prior value
/// after every completed or canceled operation; used by tests to confirm
/// nothing leaks.
pub fn active_state_count() -> usize {
    ACTIVE_STATES.load(Ordering::SeqCst).max(0) as usize
}

// ── Provider protocol ───────────────────────────────────────────────────

/// Call context handed to every provider invocation.
pub struct ProviderData {
    queue: AsyncQueue,
    block: Arc<AsyncBlock>,
}

impl ProviderData {
    /// The queue driving this operation.
    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    /// The block this operation is bound to.
    pub fn block(&self) -> &Arc<AsyncBlock> {
        &self.block
    }
}

/// The state machine a caller supplies for one async operation.
///
/// The runtime drives it in a strict order: zero or more `do_work` calls,
/// then (for successful payload-carrying operations) one `get_result`, with
/// `cancel` injected by [`cancel_async`] and exactly one `cleanup` at the
/// end of the operation's life.
pub trait AsyncProvider: Send + Sync + 'static {
    /// One unit of background work. Returning `Err(Error::Pending)` means
    /// the provider will call [`complete_async`] later; `Ok(())` means it
    /// already completed during this call (anything else is a provider bug
    /// surfaced to the caller as [`Error::Unexpected`]). Any other error
    /// becomes the operation's terminal status.
    fn do_work(&self, data: &ProviderData) -> Result<()>;

    /// Copy the operation's payload into `buffer`, returning the bytes
    /// written. Only called after a successful completion that declared a
    /// nonzero payload size.
    fn get_result(&self, data: &ProviderData, buffer: &mut [u8]) -> Result<usize> {
        let _ = (data, buffer);
        Ok(0)
    }

    /// The operation was canceled. Called at most once.
    fn cancel(&self, data: &ProviderData) {
        let _ = data;
    }

    /// Last call the provider will ever receive for this operation.
    fn cleanup(&self, data: &ProviderData) {
        let _ = data;
    }
}

impl<T: AsyncProvider + ?Sized> AsyncProvider for Arc<T> {
    fn do_work(&self, data: &ProviderData) -> Result<()> {
        (**self).do_work(data)
    }

    fn get_result(&self, data: &ProviderData, buffer: &mut [u8]) -> Result<usize> {
        (**self).get_result(data, buffer)
    }

    fn cancel(&self, data: &ProviderData) {
        (**self).cancel(data)
    }

    fn cleanup(&self, data: &ProviderData) {
        (**self).cleanup(data)
    }
}

// ── Block storage ───────────────────────────────────────────────────────

/// One-shot completion callback, invoked on the block's Completion lane.
pub type CompletionFn = Box<dyn FnOnce(&Arc<AsyncBlock>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Pending,
    Terminal(std::result::Result<(), Error>),
}

struct Internal {
    state: Option<Arc<AsyncState>>,
    phase: Phase,
}

/// Caller-owned storage representing one in-flight async operation.
///
/// A block binds an optional queue (operations fall back to a per-thread
/// shared queue when none is given) and an optional completion callback.
/// After an operation reaches a terminal state the block can be
/// [`reset`](Self::reset) and reused.
pub struct AsyncBlock {
    queue: Option<AsyncQueue>,
    callback: Mutex<Option<CompletionFn>>,
    internal: SpinLock<Internal>,
}

impl AsyncBlock {
    /// Create a block bound to `queue` (or the per-thread default when
    /// `None`), with no completion callback: completion is observed through
    /// [`get_async_status`].
    pub fn new(queue: Option<AsyncQueue>) -> Arc<AsyncBlock> {
        Arc::new(AsyncBlock {
            queue,
            callback: Mutex::new(None),
            internal: SpinLock::new(Internal {
                state: None,
                phase: Phase::Idle,
            }),
        })
    }

    /// Create a block whose completion is delivered by invoking `callback`
    /// exactly once on the queue's Completion lane.
    pub fn with_callback(
        queue: Option<AsyncQueue>,
        callback: impl FnOnce(&Arc<AsyncBlock>) + Send + 'static,
    ) -> Arc<AsyncBlock> {
        let block = AsyncBlock::new(queue);
        block.set_callback(callback);
        block
    }

    /// Install or replace the completion callback. Only meaningful before
    /// [`begin_async`].
    pub fn set_callback(&self, callback: impl FnOnce(&Arc<AsyncBlock>) + Send + 'static) {
        *lock(&self.callback) = Some(Box::new(callback));
    }

    /// The queue this block was bound to, if any.
    pub fn queue(&self) -> Option<&AsyncQueue> {
        self.queue.as_ref()
    }

    /// Return a terminal (or never-begun) block to its pristine state so it
    /// can host another operation. Fails with [`Error::InvalidArg`] while an
    /// operation is still pending.
    pub fn reset(&self) -> Result<()> {
        let state = {
            let mut internal = self.internal.lock();
            if internal.phase == Phase::Pending {
                return Err(Error::InvalidArg);
            }
            internal.phase = Phase::Idle;
            internal.state.take()
        };
        if let Some(state) = state {
            cleanup_state(state);
        }
        Ok(())
    }
}

impl std::fmt::Debug for AsyncBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let internal = self.internal.lock();
        f.debug_struct("AsyncBlock")
            .field("phase", &internal.phase)
            .field("attached", &internal.state.is_some())
            .finish()
    }
}

// ── Internal state ──────────────────────────────────────────────────────

struct AsyncState {
    signature: u32,
    work_scheduled: AtomicBool,
    canceled: AtomicBool,
    cleaned: AtomicBool,
    provider: Box<dyn AsyncProvider>,
    data: ProviderData,
    payload_size: AtomicUsize,
    wait: WaitSignal,
    timer: Mutex<Option<TimerToken>>,
    token: usize,
    function: &'static str,
}

impl AsyncState {
    fn new(
        provider: Box<dyn AsyncProvider>,
        queue: AsyncQueue,
        block: Arc<AsyncBlock>,
        token: usize,
        function: &'static str,
    ) -> Arc<AsyncState> {
        ACTIVE_STATES.fetch_add(1, Ordering::SeqCst);
        Arc::new(AsyncState {
            signature: STATE_SIGNATURE,
            work_scheduled: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            provider,
            data: ProviderData { queue, block },
            payload_size: AtomicUsize::new(0),
            wait: WaitSignal::new(),
            timer: Mutex::new(None),
            token,
            function,
        })
    }
}

impl Drop for AsyncState {
    fn drop(&mut self) {
        ACTIVE_STATES.fetch_sub(1, Ordering::SeqCst);
    }
}

fn state_tag(state: &Arc<AsyncState>) -> usize {
    Arc::as_ptr(state) as usize
}

thread_local! {
    /// Shared fallback queue for blocks created without one: work on the
    /// family pool, completions pinned to this thread.
    static DEFAULT_QUEUE: RefCell<Option<AsyncQueue>> = const { RefCell::new(None) };
}

fn default_queue() -> AsyncQueue {
    DEFAULT_QUEUE.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(queue) = slot.as_ref() {
            return queue.clone();
        }
        let queue = AsyncQueue::new(
            DispatchMode::SerializedThreadPool,
            DispatchMode::FixedThread,
        );
        *slot = Some(queue.clone());
        queue
    })
}

// ── Operations ──────────────────────────────────────────────────────────

/// Attach a provider to a pristine block. The operation is inert until
/// [`schedule_async`] queues its first work callback (or the provider
/// completes it from the outside).
///
/// `token` is echoed to [`get_async_result`] to catch cross-wired retrieval;
/// `function` names the initiating call in diagnostics.
pub fn begin_async(
    block: &Arc<AsyncBlock>,
    token: usize,
    function: &'static str,
    provider: impl AsyncProvider,
) -> Result<()> {
    {
        let internal = block.internal.lock();
        if internal.phase != Phase::Idle || internal.state.is_some() {
            // Double-begin or unreset block.
            return Err(Error::InvalidArg);
        }
    }

    let queue = match &block.queue {
        Some(queue) => queue.clone(),
        None => default_queue(),
    };
    let state = AsyncState::new(
        Box::new(provider),
        queue,
        Arc::clone(block),
        token,
        function,
    );

    let mut internal = block.internal.lock();
    if internal.phase != Phase::Idle || internal.state.is_some() {
        return Err(Error::InvalidArg);
    }
    internal.state = Some(state);
    internal.phase = Phase::Pending;
    Ok(())
}

/// Queue the provider's `do_work` on the Work lane, after `delay` if
/// nonzero. At most one schedule may be outstanding: a second call before
/// the work runs fails with [`Error::Unexpected`].
pub fn schedule_async(block: &Arc<AsyncBlock>, delay: Duration) -> Result<()> {
    let Some(state) = attached_state(block) else {
        return Err(Error::InvalidArg);
    };

    if state.work_scheduled.swap(true, Ordering::AcqRel) {
        return Err(Error::Unexpected);
    }

    let tag = state_tag(&state);
    let queue = state.data.queue.clone();
    let work_state = Arc::clone(&state);
    let token = queue.submit_callback_after(CallbackKind::Work, tag, delay, move || {
        worker_callback(work_state)
    })?;
    if let Some(token) = token {
        *lock(&state.timer) = Some(token);
    }
    Ok(())
}

/// Record the operation's terminal status. Called by providers when their
/// work reaches a terminal condition; `Err(Error::Pending)` is ignored so a
/// provider can forward an in-progress status harmlessly.
///
/// `required_size` declares the payload a later [`get_async_result`] will
/// drain; zero completes and cleans up immediately.
pub fn complete_async(
    block: &Arc<AsyncBlock>,
    status: std::result::Result<(), Error>,
    required_size: usize,
) {
    if status == Err(Error::Pending) {
        return;
    }

    let (completed_now, do_cleanup, state) = {
        let mut internal = block.internal.lock();
        let was_aborted = internal.phase == Phase::Terminal(Err(Error::Aborted));
        let completed_now = try_set_terminal(&mut internal, status);
        if required_size == 0 || was_aborted {
            (completed_now, true, internal.state.take())
        } else {
            (completed_now, false, internal.state.clone())
        }
    };

    let Some(state) = state else {
        return;
    };
    if completed_now {
        state.payload_size.store(required_size, Ordering::Release);
        signal_completion(&state);
    }
    if do_cleanup {
        cleanup_state(state);
    }
}

/// Current status of the operation; with `wait` set, blocks on the
/// operation's latch until completion has been delivered.
pub fn get_async_status(block: &Arc<AsyncBlock>, wait: bool) -> Result<()> {
    let (phase, state) = snapshot(block);
    let current = phase_result(phase);
    if !wait {
        return current;
    }

    match state {
        None => {
            // Nothing to wait on; only legal once terminal.
            if current == Err(Error::Pending) {
                Err(Error::InvalidArg)
            } else {
                current
            }
        }
        Some(state) => {
            state.wait.wait();
            let (phase, _) = snapshot(block);
            phase_result(phase)
        }
    }
}

/// Size of the payload a successful operation left behind; zero when the
/// operation carried none.
pub fn get_async_result_size(block: &Arc<AsyncBlock>) -> Result<usize> {
    let (phase, state) = snapshot(block);
    match phase {
        Phase::Terminal(Ok(())) => Ok(state
            .map(|s| s.payload_size.load(Ordering::Acquire))
            .unwrap_or(0)),
        Phase::Terminal(Err(e)) => Err(e),
        Phase::Pending => Err(Error::Pending),
        Phase::Idle => Err(Error::InvalidArg),
    }
}

/// Drain the operation's payload into `buffer` and detach the operation
/// from the block. `token` must match the one given to [`begin_async`].
///
/// An undersized buffer fails with [`Error::BufferTooSmall`] and leaves the
/// operation retrievable; every other outcome consumes it.
pub fn get_async_result(
    block: &Arc<AsyncBlock>,
    token: usize,
    buffer: &mut [u8],
) -> Result<usize> {
    // Phase check and extraction happen under one lock hold so concurrent
    // retrievals cannot both drain; a pending operation stays attached.
    let (status, state) = {
        let mut internal = block.internal.lock();
        match phase_result(internal.phase) {
            Err(Error::Pending) => (Err(Error::Pending), None),
            other => (other, internal.state.take()),
        }
    };

    match status {
        Err(Error::Pending) => return Err(Error::Pending),
        Err(e) => {
            // Retrieval of a failed operation surfaces the failure and
            // releases what is left of it.
            if let Some(state) = state {
                cleanup_state(state);
            }
            return Err(e);
        }
        Ok(()) => {}
    }

    let Some(state) = state else {
        // Already drained once.
        return Err(Error::InvalidArg);
    };

    if token != state.token {
        debug_assert!(
            false,
            "call/result mismatch: operation begun by '{}'",
            state.function
        );
        cleanup_state(state);
        return Err(Error::InvalidArg);
    }

    let size = state.payload_size.load(Ordering::Acquire);
    if size == 0 {
        cleanup_state(state);
        return Err(Error::FeatureNotPresent);
    }
    if buffer.len() < size {
        let mut internal = block.internal.lock();
        internal.state = Some(state);
        return Err(Error::BufferTooSmall);
    }

    let copied = state.provider.get_result(&state.data, buffer);
    cleanup_state(state);
    copied
}

/// Cancel the operation. The terminal status becomes [`Error::Aborted`], a
/// pending delayed submission is disarmed, the provider observes one
/// `cancel`, and completion is still delivered (callback and latch).
/// Idempotent: a second call is a no-op.
pub fn cancel_async(block: &Arc<AsyncBlock>) {
    let state = {
        let mut internal = block.internal.lock();
        if !try_set_terminal(&mut internal, Err(Error::Aborted)) {
            return;
        }
        internal.state.take()
    };
    let Some(state) = state else {
        return;
    };

    OPS_CANCELED.increment();
    state.canceled.store(true, Ordering::Release);

    let timer = lock(&state.timer).take();
    if let Some(timer) = timer {
        // An unfired delay still owns a queued work submission; canceling
        // drops it together with its state reference.
        timer.cancel();
    }

    state.provider.cancel(&state.data);
    signal_completion(&state);
    cleanup_state(state);
}

/// Run `work` asynchronously on the block's Work lane and complete with its
/// returned status.
pub fn run_async(
    block: &Arc<AsyncBlock>,
    work: impl FnOnce(&Arc<AsyncBlock>) -> Result<()> + Send + 'static,
) -> Result<()> {
    begin_async(
        block,
        RUN_ASYNC_TOKEN,
        "run_async",
        RunProvider {
            work: Mutex::new(Some(work)),
        },
    )?;
    schedule_async(block, Duration::ZERO)
}

struct RunProvider<F> {
    work: Mutex<Option<F>>,
}

impl<F> AsyncProvider for RunProvider<F>
where
    F: FnOnce(&Arc<AsyncBlock>) -> Result<()> + Send + 'static,
{
    fn do_work(&self, data: &ProviderData) -> Result<()> {
        let work = lock(&self.work).take();
        if let Some(work) = work {
            let status = work(data.block());
            complete_async(data.block(), status, 0);
        }
        Ok(())
    }
}

// ── Machinery ───────────────────────────────────────────────────────────

fn worker_callback(state: Arc<AsyncState>) {
    state.work_scheduled.store(false, Ordering::Release);
    if state.canceled.load(Ordering::Acquire) {
        return;
    }

    let result = state.provider.do_work(&state.data);

    // Pending means the provider owns completion from here. Otherwise it
    // either failed, or it must have completed during do_work; success
    // without completion is a provider bug.
    if result == Err(Error::Pending) || state.canceled.load(Ordering::Acquire) {
        return;
    }

    let terminal = match result {
        Ok(()) => Err(Error::Unexpected),
        Err(e) => Err(e),
    };

    let completed_now = {
        let mut internal = state.data.block.internal.lock();
        try_set_terminal(&mut internal, terminal)
    };
    if completed_now {
        signal_completion(&state);
    }
}

fn try_set_terminal(internal: &mut Internal, status: std::result::Result<(), Error>) -> bool {
    if internal.phase == Phase::Pending {
        internal.phase = Phase::Terminal(status);
        true
    } else {
        false
    }
}

fn phase_result(phase: Phase) -> Result<()> {
    match phase {
        Phase::Idle => Err(Error::InvalidArg),
        Phase::Pending => Err(Error::Pending),
        Phase::Terminal(result) => result,
    }
}

fn snapshot(block: &Arc<AsyncBlock>) -> (Phase, Option<Arc<AsyncState>>) {
    let internal = block.internal.lock();
    let state = internal.state.clone();
    if let Some(state) = &state {
        if state.signature != STATE_SIGNATURE {
            debug_assert!(false, "attached state failed its signature check");
            return (internal.phase, None);
        }
    }
    (internal.phase, state)
}

fn attached_state(block: &Arc<AsyncBlock>) -> Option<Arc<AsyncState>> {
    snapshot(block).1
}

/// Deliver completion exactly once: through the completion callback when the
/// block has one (the latch is signaled after the callback returns),
/// directly through the latch otherwise.
fn signal_completion(state: &Arc<AsyncState>) {
    OPS_COMPLETED.increment();
    let has_callback = lock(&state.data.block.callback).is_some();
    if has_callback {
        let cb_state = Arc::clone(state);
        let tag = state_tag(state);
        let submitted = state
            .data
            .queue
            .submit_callback(CallbackKind::Completion, tag, move || {
                let block = Arc::clone(&cb_state.data.block);
                let callback = lock(&block.callback).take();
                if let Some(callback) = callback {
                    callback(&block);
                }
                cb_state.wait.signal();
            });
        if submitted.is_err() {
            // The queue refused the delivery; waiters must still wake.
            state.wait.signal();
        }
    } else {
        state.wait.signal();
    }
}

/// Final teardown: one provider `cleanup`, then revocation of any work
/// callbacks still queued for this state so their references drop.
fn cleanup_state(state: Arc<AsyncState>) {
    if state.cleaned.swap(true, Ordering::AcqRel) {
        return;
    }
    state.provider.cleanup(&state.data);
    let tag = state_tag(&state);
    state
        .data
        .queue
        .remove_callbacks(CallbackKind::Work, |entry_tag| entry_tag == tag);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Spin lock ───────────────────────────────────────────────────────────

/// One-byte spin lock guarding the block's internal pair. Held only for
/// O(1) work, never across provider calls or queue submissions.
struct SpinLock<T> {
    flag: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    fn new(value: T) -> Self {
        SpinLock {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    fn lock(&self) -> SpinGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SpinGuard { lock: self }
    }
}

struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::Release);
    }
}
