//! Process-wide HTTP runtime state.
//!
//! The runtime is a single explicitly-constructed value owned by
//! [`global_initialize`] and torn down by [`global_cleanup`]. There is no
//! lazy initialization: every API that needs the runtime fails with
//! [`HttpError::NotInitialized`] when it is absent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::backend::{HttpBackend, StubBackend};
use crate::error::HttpError;
use crate::mock::MockRegistry;

const DEFAULT_TIMEOUT_WINDOW: Duration = Duration::from_secs(20);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

static GLOBAL: Mutex<Option<Arc<HttpGlobal>>> = Mutex::new(None);

/// Per-process defaults applied to newly created calls.
#[derive(Debug, Clone, Copy)]
pub struct GlobalOptions {
    pub timeout_window: Duration,
    pub retry_delay: Duration,
}

pub(crate) struct HttpGlobal {
    next_call_id: AtomicU64,
    options: Mutex<GlobalOptions>,
    mocks: Mutex<MockRegistry>,
    backend: Mutex<Arc<dyn HttpBackend>>,
}

impl HttpGlobal {
    fn new() -> HttpGlobal {
        HttpGlobal {
            next_call_id: AtomicU64::new(1),
            options: Mutex::new(GlobalOptions {
                timeout_window: DEFAULT_TIMEOUT_WINDOW,
                retry_delay: DEFAULT_RETRY_DELAY,
            }),
            mocks: Mutex::new(MockRegistry::new()),
            backend: Mutex::new(Arc::new(StubBackend)),
        }
    }

    pub(crate) fn next_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn options(&self) -> GlobalOptions {
        *lock(&self.options)
    }

    pub(crate) fn mocks(&self) -> MutexGuard<'_, MockRegistry> {
        lock(&self.mocks)
    }

    pub(crate) fn backend(&self) -> Arc<dyn HttpBackend> {
        Arc::clone(&lock(&self.backend))
    }

    fn set_backend(&self, backend: Arc<dyn HttpBackend>) {
        *lock(&self.backend) = backend;
    }

    fn set_options(&self, apply: impl FnOnce(&mut GlobalOptions)) {
        apply(&mut lock(&self.options));
    }
}

/// Construct the HTTP runtime. Idempotent: a second call while initialized
/// is a no-op.
pub fn global_initialize() -> Result<(), HttpError> {
    let mut slot = lock(&GLOBAL);
    if slot.is_none() {
        *slot = Some(Arc::new(HttpGlobal::new()));
        tracing::debug!("http runtime initialized");
    }
    Ok(())
}

/// Tear the runtime down: clears mocks (releasing their references), drops
/// the backend, and invalidates every outstanding default.
pub fn global_cleanup() {
    let taken = lock(&GLOBAL).take();
    if let Some(global) = taken {
        global.mocks().clear();
        tracing::debug!("http runtime cleaned up");
    }
}

/// Replace the backend that performs live attempts.
pub fn set_backend(backend: Arc<dyn HttpBackend>) -> Result<(), HttpError> {
    handle()?.set_backend(backend);
    Ok(())
}

/// Change the default retry window applied to new calls.
pub fn set_default_timeout_window(window: Duration) -> Result<(), HttpError> {
    handle()?.set_options(|options| options.timeout_window = window);
    Ok(())
}

/// Change the default retry base delay applied to new calls.
pub fn set_default_retry_delay(delay: Duration) -> Result<(), HttpError> {
    handle()?.set_options(|options| options.retry_delay = delay);
    Ok(())
}

/// Snapshot of the current defaults.
pub fn default_options() -> Result<GlobalOptions, HttpError> {
    Ok(handle()?.options())
}

pub(crate) fn handle() -> Result<Arc<HttpGlobal>, HttpError> {
    lock(&GLOBAL)
        .as_ref()
        .map(Arc::clone)
        .ok_or(HttpError::NotInitialized)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serialize unit tests that touch the process-wide runtime.
#[cfg(test)]
pub(crate) fn test_guard() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
