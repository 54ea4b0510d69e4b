//! tasklane — a callback-queue async runtime.
//!
//! tasklane drives asynchronous operations through explicit state machines
//! rather than futures: a caller binds an [`AsyncBlock`] to a queue, a
//! provider implements the [`AsyncProvider`] capability set, and the runtime
//! pumps the provider's work through the queue's Work lane while delivering
//! completion through its Completion lane.
//!
//! # Quick start
//!
//! ```rust
//! use std::time::Duration;
//! use tasklane::{AsyncBlock, AsyncQueue, DispatchMode, get_async_status, run_async};
//!
//! let queue = AsyncQueue::new(DispatchMode::ThreadPool, DispatchMode::ThreadPool);
//! let block = AsyncBlock::new(Some(queue));
//!
//! run_async(&block, |_block| {
//!     // background work
//!     Ok(())
//! })?;
//!
//! get_async_status(&block, true)?;
//! # Ok::<(), tasklane::Error>(())
//! ```
//!
//! # Pieces
//!
//! - [`LocklessList`] — the MPMC intrusive list underneath the callback
//!   lanes, with allocation-free node transfer between lists.
//! - [`AsyncQueue`] — dual-lane callback queue with per-lane dispatch modes
//!   and hierarchical composition over a shared worker pool.
//! - [`AsyncBlock`] / [`AsyncProvider`] — the per-operation protocol:
//!   begin, schedule, complete, cancel, retrieve.
//!
//! There is no global event loop and no cooperative scheduler; everything
//! runs on OS threads the queues own.

// ── Modules ─────────────────────────────────────────────────────────────
mod error;
mod list;
pub mod metrics;
mod op;
mod pool;
mod queue;
mod timer;
mod wait;

// ── Re-exports: errors ──────────────────────────────────────────────────
pub use error::Error;
pub use error::Result;

// ── Re-exports: list ────────────────────────────────────────────────────
pub use list::ListNode;
pub use list::LocklessList;

// ── Re-exports: queue ───────────────────────────────────────────────────
pub use queue::AsyncQueue;
pub use queue::CallbackKind;
pub use queue::DispatchMode;
pub use timer::TimerToken;

// ── Re-exports: operations ──────────────────────────────────────────────
pub use op::AsyncBlock;
pub use op::AsyncProvider;
pub use op::CompletionFn;
pub use op::ProviderData;
pub use op::RUN_ASYNC_TOKEN;
pub use op::active_state_count;
pub use op::begin_async;
pub use op::cancel_async;
pub use op::complete_async;
pub use op::get_async_result;
pub use op::get_async_result_size;
pub use op::get_async_status;
pub use op::run_async;
pub use op::schedule_async;
