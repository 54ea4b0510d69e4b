//! tasklane-http — an HTTP call object model on the tasklane runtime.
//!
//! The crate does not speak HTTP itself; a per-platform backend does. What
//! it owns is everything around that: the call object (request fields,
//! ordered headers, retry metadata, response slots), the mock table that
//! short-circuits the network path, the exponential retry policy, and the
//! dispatcher that drives a call through the tasklane async protocol.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tasklane::{AsyncBlock, AsyncQueue, DispatchMode, get_async_status};
//! use tasklane_http::{HttpCall, MockCall, add_mock, global_cleanup, global_initialize,
//!                     perform, set_mocks_enabled};
//!
//! global_initialize()?;
//! set_mocks_enabled(true)?;
//! add_mock(MockCall::new("*", "*").status(200).body("hello"))?;
//!
//! let mut call = HttpCall::new()?;
//! call.set_url("GET", "http://example.test/")?;
//! let call = Arc::new(call);
//!
//! let queue = AsyncQueue::new(DispatchMode::ThreadPool, DispatchMode::ThreadPool);
//! let block = AsyncBlock::new(Some(queue));
//! perform(&call, &block)?;
//! get_async_status(&block, true).map_err(tasklane_http::HttpError::from)?;
//!
//! assert_eq!(call.response_status(), 200);
//! assert_eq!(call.response_string()?, "hello");
//! global_cleanup();
//! # Ok::<(), tasklane_http::HttpError>(())
//! ```

// ── Modules ─────────────────────────────────────────────────────────────
pub mod backend;
mod body;
mod call;
mod error;
mod global;
pub mod metrics;
mod mock;
mod perform;

// ── Re-exports: call object ─────────────────────────────────────────────
pub use body::Body;
pub use call::HttpCall;

// ── Re-exports: errors ──────────────────────────────────────────────────
pub use error::HttpError;
pub use error::NetworkError;
pub use error::NetworkErrorKind;

// ── Re-exports: runtime lifecycle ───────────────────────────────────────
pub use global::GlobalOptions;
pub use global::default_options;
pub use global::global_cleanup;
pub use global::global_initialize;
pub use global::set_backend;
pub use global::set_default_retry_delay;
pub use global::set_default_timeout_window;

// ── Re-exports: mocks ───────────────────────────────────────────────────
pub use mock::MockCall;
pub use mock::add_mock;
pub use mock::clear_mocks;
pub use mock::last_matching_mock;
pub use mock::set_mocks_enabled;

// ── Re-exports: dispatcher ──────────────────────────────────────────────
pub use backend::AttemptSink;
pub use backend::HttpBackend;
pub use backend::StubBackend;
pub use perform::PERFORM_TOKEN;
pub use perform::perform;
