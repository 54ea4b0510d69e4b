//! Perform dispatcher behavior: retry policy, transport-error surfacing,
//! and lifecycle guards.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tasklane::{AsyncBlock, AsyncQueue, DispatchMode, Error, get_async_status};
use tasklane_http::{
    AttemptSink, HttpBackend, HttpCall, NetworkErrorKind, global_cleanup, global_initialize,
    perform, set_backend,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn pool_block() -> Arc<AsyncBlock> {
    let queue = AsyncQueue::new(DispatchMode::ThreadPool, DispatchMode::ThreadPool);
    AsyncBlock::new(Some(queue))
}

/// Backend that fails every attempt with a retryable transport error.
struct AlwaysFailing {
    attempts: Arc<AtomicU32>,
}

impl HttpBackend for AlwaysFailing {
    fn perform(&self, call: &Arc<HttpCall>, sink: AttemptSink) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        call.set_network_error(NetworkErrorKind::ConnectFailure, 111);
        sink.complete();
    }
}

/// Backend that fails a fixed number of times, then succeeds.
struct FlakyBackend {
    attempts: Arc<AtomicU32>,
    failures: u32,
}

impl HttpBackend for FlakyBackend {
    fn perform(&self, call: &Arc<HttpCall>, sink: AttemptSink) {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            call.set_network_error(NetworkErrorKind::Timeout, 0);
        } else {
            call.set_response_status(200);
            call.append_response_body(b"made it");
        }
        sink.complete();
    }
}

/// Backend that answers with a given status code.
struct StatusBackend {
    status: u16,
    attempts: Arc<AtomicU32>,
}

impl HttpBackend for StatusBackend {
    fn perform(&self, call: &Arc<HttpCall>, sink: AttemptSink) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        call.set_response_status(self.status);
        sink.complete();
    }
}

/// Retry bound: with base delay `d` and window `w`, a perpetually failing
/// retryable call makes at most `⌊log2(w/d)⌋ + 1` attempts, then surfaces
/// the last transport error while completing the async operation cleanly.
#[test]
fn retry_attempts_respect_the_window() {
    let _serial = serial();
    global_initialize().unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    set_backend(Arc::new(AlwaysFailing {
        attempts: Arc::clone(&attempts),
    }))
    .unwrap();

    let mut call = HttpCall::new().unwrap();
    call.set_url("GET", "http://unreachable.test/").unwrap();
    call.set_retry_delay(Duration::from_millis(25));
    call.set_timeout_window(Duration::from_millis(200));
    let call = Arc::new(call);

    let block = pool_block();
    perform(&call, &block).unwrap();

    // Transport failures complete the async op successfully.
    assert_eq!(get_async_status(&block, true), Ok(()));

    // d=25ms, w=200ms: floor(log2(8)) + 1 = 4 attempts at most.
    let made = attempts.load(Ordering::SeqCst);
    assert!((2..=4).contains(&made), "made {made} attempts");

    let error = call.network_error().expect("last error surfaced");
    assert_eq!(error.kind, NetworkErrorKind::ConnectFailure);
    assert_eq!(error.platform_code, 111);

    global_cleanup();
}

/// A transient failure recovers: the successful attempt's response replaces
/// the earlier errors.
#[test]
fn transient_failures_recover() {
    let _serial = serial();
    global_initialize().unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    set_backend(Arc::new(FlakyBackend {
        attempts: Arc::clone(&attempts),
        failures: 2,
    }))
    .unwrap();

    let mut call = HttpCall::new().unwrap();
    call.set_url("GET", "http://flaky.test/").unwrap();
    call.set_retry_delay(Duration::from_millis(10));
    call.set_timeout_window(Duration::from_secs(5));
    let call = Arc::new(call);

    let block = pool_block();
    perform(&call, &block).unwrap();
    assert_eq!(get_async_status(&block, true), Ok(()));

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(call.response_status(), 200);
    assert_eq!(call.response_string().unwrap(), "made it");
    assert_eq!(call.network_error(), None);

    global_cleanup();
}

/// Retry-eligible status codes (here 503) re-attempt; disallowing retries
/// stops after the first.
#[test]
fn server_errors_retry_only_when_allowed() {
    let _serial = serial();
    global_initialize().unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    set_backend(Arc::new(StatusBackend {
        status: 503,
        attempts: Arc::clone(&attempts),
    }))
    .unwrap();

    let mut call = HttpCall::new().unwrap();
    call.set_url("GET", "http://busy.test/").unwrap();
    call.set_retry_delay(Duration::from_millis(10));
    call.set_timeout_window(Duration::from_millis(50));
    let call = Arc::new(call);

    let block = pool_block();
    perform(&call, &block).unwrap();
    assert_eq!(get_async_status(&block, true), Ok(()));
    assert!(attempts.load(Ordering::SeqCst) > 1, "503 should retry");
    assert_eq!(call.response_status(), 503);

    // Same backend, retries forbidden: exactly one attempt.
    attempts.store(0, Ordering::SeqCst);
    let mut call = HttpCall::new().unwrap();
    call.set_url("GET", "http://busy.test/").unwrap();
    call.set_retry_allowed(false);
    let call = Arc::new(call);

    let block = pool_block();
    perform(&call, &block).unwrap();
    assert_eq!(get_async_status(&block, true), Ok(()));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    global_cleanup();
}

/// Success status codes never retry.
#[test]
fn success_does_not_retry() {
    let _serial = serial();
    global_initialize().unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    set_backend(Arc::new(StatusBackend {
        status: 200,
        attempts: Arc::clone(&attempts),
    }))
    .unwrap();

    let mut call = HttpCall::new().unwrap();
    call.set_url("GET", "http://fine.test/").unwrap();
    let call = Arc::new(call);

    let block = pool_block();
    perform(&call, &block).unwrap();
    assert_eq!(get_async_status(&block, true), Ok(()));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    global_cleanup();
}

/// The default stub backend reports an unreachable network but still
/// completes the operation.
#[test]
fn stub_backend_completes_with_no_backend_error() {
    let _serial = serial();
    global_initialize().unwrap();

    let mut call = HttpCall::new().unwrap();
    call.set_url("GET", "http://nowhere.test/").unwrap();
    let call = Arc::new(call);

    let block = pool_block();
    perform(&call, &block).unwrap();
    assert_eq!(get_async_status(&block, true), Ok(()));

    let error = call.network_error().expect("stub records an error");
    assert_eq!(error.kind, NetworkErrorKind::NoBackend);
    assert_eq!(call.response_status(), 0);

    global_cleanup();
}

/// Performing without the global runtime fails up front.
#[test]
fn perform_requires_initialization() {
    let _serial = serial();

    // Build the call while initialized, then tear the runtime down.
    global_initialize().unwrap();
    let mut call = HttpCall::new().unwrap();
    call.set_url("GET", "http://example.test/").unwrap();
    let call = Arc::new(call);
    global_cleanup();

    let block = pool_block();
    assert!(perform(&call, &block).is_err());
    // The block never started; its status reflects that.
    assert_eq!(get_async_status(&block, false), Err(Error::InvalidArg));
}

/// Canceling a call mid-retry delivers Aborted and stops the attempts.
#[test]
fn cancel_during_retry_backoff() {
    let _serial = serial();
    global_initialize().unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    set_backend(Arc::new(AlwaysFailing {
        attempts: Arc::clone(&attempts),
    }))
    .unwrap();

    let mut call = HttpCall::new().unwrap();
    call.set_url("GET", "http://unreachable.test/").unwrap();
    call.set_retry_delay(Duration::from_secs(10));
    call.set_timeout_window(Duration::from_secs(60));
    let call = Arc::new(call);

    let block = pool_block();
    perform(&call, &block).unwrap();

    // Let the first attempt fail and the long backoff arm.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while attempts.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline);
        std::thread::yield_now();
    }
    std::thread::sleep(Duration::from_millis(20));

    tasklane::cancel_async(&block);
    assert_eq!(get_async_status(&block, true), Err(Error::Aborted));

    // The armed retry was disarmed; no further attempts happen.
    let made = attempts.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(attempts.load(Ordering::SeqCst), made);

    global_cleanup();
}
