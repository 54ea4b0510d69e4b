//! Backend seam: the capability a platform HTTP stack implements.
//!
//! The dispatcher hands the backend a call and an [`AttemptSink`]; the
//! backend populates the call's response slots (status, headers, body, or a
//! network error) from whatever threads it owns, then fires the sink. The
//! async protocol above takes it from there — the backend never sees the
//! retry policy or the mock table.

use std::sync::Arc;

use crate::call::HttpCall;
use crate::error::NetworkErrorKind;

/// A platform HTTP stack.
pub trait HttpBackend: Send + Sync + 'static {
    /// Drive one attempt of `call` to a terminal condition and fire `sink`.
    /// May complete synchronously or from the backend's own threads.
    fn perform(&self, call: &Arc<HttpCall>, sink: AttemptSink);
}

/// One-shot completion for a backend attempt. Firing it (or dropping it)
/// tells the dispatcher the call's response slots are final for this
/// attempt.
pub struct AttemptSink {
    notify: Option<Box<dyn FnOnce() + Send>>,
}

impl AttemptSink {
    pub(crate) fn new(notify: impl FnOnce() + Send + 'static) -> AttemptSink {
        AttemptSink {
            notify: Some(Box::new(notify)),
        }
    }

    /// Declare the attempt finished.
    pub fn complete(mut self) {
        if let Some(notify) = self.notify.take() {
            notify();
        }
    }
}

impl Drop for AttemptSink {
    fn drop(&mut self) {
        // A backend that drops the sink without completing still finishes
        // the attempt; the call's error slots hold whatever it recorded.
        if let Some(notify) = self.notify.take() {
            notify();
        }
    }
}

/// Fallback used on platforms with no registered stack: every attempt
/// reports an unreachable network so the async contract is still honored.
pub struct StubBackend;

impl HttpBackend for StubBackend {
    fn perform(&self, call: &Arc<HttpCall>, sink: AttemptSink) {
        call.set_network_error(NetworkErrorKind::NoBackend, 0);
        sink.complete();
    }
}
