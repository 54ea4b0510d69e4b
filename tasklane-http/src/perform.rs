//! The perform dispatcher: the only path that touches the network.
//!
//! A call is driven through the async protocol by a provider that consults
//! the mock table, dispatches live attempts to the registered backend, and
//! applies the exponential retry policy. Transport failures complete the
//! async operation *successfully*: the runtime's status says the machinery
//! worked, and the caller inspects the call object for the network error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tasklane::{
    AsyncBlock, AsyncProvider, ProviderData, begin_async, complete_async, schedule_async,
};

use crate::backend::AttemptSink;
use crate::call::HttpCall;
use crate::error::HttpError;
use crate::global::{self, HttpGlobal};
use crate::metrics::{CALLS_FAILED, CALLS_MOCKED, CALLS_PERFORMED, CALLS_RETRIED};
use crate::mock::MockCall;

/// Token identifying perform operations for result retrieval diagnostics.
pub const PERFORM_TOKEN: usize = 0x4850_4652;

/// Kick off `call` on `block`'s Work lane.
///
/// Returns as soon as the first attempt is scheduled; completion arrives
/// through the block (callback, wait, or polling). The response lives on
/// the call object.
pub fn perform(call: &Arc<HttpCall>, block: &Arc<AsyncBlock>) -> Result<(), HttpError> {
    let global = global::handle()?;
    let mock = global.mocks().find_match(call.method(), call.url());

    let provider = PerformProvider {
        call: Arc::clone(call),
        global,
        mock,
        attempts: AtomicU32::new(0),
        started: Instant::now(),
    };

    begin_async(block, PERFORM_TOKEN, "http_call_perform", provider)?;
    schedule_async(block, Duration::ZERO)?;
    CALLS_PERFORMED.increment();
    Ok(())
}

struct PerformProvider {
    call: Arc<HttpCall>,
    global: Arc<HttpGlobal>,
    mock: Option<Arc<MockCall>>,
    attempts: AtomicU32,
    started: Instant,
}

impl AsyncProvider for PerformProvider {
    fn do_work(&self, data: &ProviderData) -> tasklane::Result<()> {
        if let Some(mock) = &self.mock {
            apply_mock(&self.call, mock);
            CALLS_MOCKED.increment();
            tracing::debug!(id = self.call.id(), status = mock.response_status(), "served from mock");
            complete_async(data.block(), Ok(()), 0);
            return Ok(());
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.call.reset_response();
        tracing::debug!(id = self.call.id(), attempt, url = self.call.url(), "dispatching attempt");

        let sink = {
            let call = Arc::clone(&self.call);
            let block = Arc::clone(data.block());
            let started = self.started;
            AttemptSink::new(move || finish_attempt(&call, &block, attempt, started))
        };
        self.global.backend().perform(&self.call, sink);

        // The sink owns completion from here; it may already have fired.
        Err(tasklane::Error::Pending)
    }
}

/// Terminal handling for one backend attempt: either reschedule under the
/// retry policy or complete the operation.
fn finish_attempt(call: &Arc<HttpCall>, block: &Arc<AsyncBlock>, attempt: u32, started: Instant) {
    if should_retry(call) {
        let delay = call
            .retry_delay()
            .saturating_mul(2u32.saturating_pow(attempt));
        if started.elapsed() + delay <= call.timeout_window() {
            CALLS_RETRIED.increment();
            tracing::debug!(
                id = call.id(),
                next_attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "retrying"
            );
            if schedule_async(block, delay).is_ok() {
                return;
            }
            // A canceled operation has no state to schedule on; fall through
            // and let the terminal-status CAS sort it out.
        } else {
            tracing::debug!(id = call.id(), "retry window exhausted; surfacing last error");
        }
    }

    if call.network_error().is_some() {
        CALLS_FAILED.increment();
    }
    complete_async(block, Ok(()), 0);
}

fn should_retry(call: &HttpCall) -> bool {
    if !call.retry_allowed() {
        return false;
    }
    if let Some(error) = call.network_error() {
        return error.kind.retryable();
    }
    matches!(call.response_status(), 408 | 429 | 500..=599)
}

fn apply_mock(call: &Arc<HttpCall>, mock: &Arc<MockCall>) {
    call.reset_response();
    call.set_response_status(mock.response_status());
    for (name, value) in mock.response_headers() {
        call.add_response_header(name, value);
    }
    call.set_response_body(mock.response_body().clone());
    call.set_mocked_from(Arc::clone(mock));
}
