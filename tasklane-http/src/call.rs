//! The HTTP call object: a request/response data bag with retry metadata.
//!
//! The request side is populated before the call is performed; the response
//! side sits behind a mutex so backend threads can fill it in while the
//! caller polls the async block. Getters on the response side clone out
//! under the lock.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;

use crate::body::Body;
use crate::error::{HttpError, NetworkError, NetworkErrorKind};
use crate::global;
use crate::metrics::CALLS_CREATED;
use crate::mock::MockCall;

#[derive(Default)]
struct ResponseData {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    network_error: Option<NetworkError>,
    mocked_from: Option<Arc<MockCall>>,
}

/// One HTTP call: request fields, retry policy, and the response slots the
/// backend populates during [`perform`](crate::perform).
pub struct HttpCall {
    id: u64,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Body,
    retry_allowed: bool,
    retry_delay: Duration,
    timeout_window: Duration,
    status: AtomicU16,
    response: Mutex<ResponseData>,
}

impl HttpCall {
    /// Create a call with defaults taken from the global runtime. Fails with
    /// [`HttpError::NotInitialized`] before `global_initialize`.
    pub fn new() -> Result<HttpCall, HttpError> {
        let global = global::handle()?;
        let options = global.options();
        CALLS_CREATED.increment();
        Ok(HttpCall {
            id: global.next_call_id(),
            method: String::from("GET"),
            url: String::new(),
            headers: Vec::new(),
            body: Body::Empty,
            retry_allowed: true,
            retry_delay: options.retry_delay,
            timeout_window: options.timeout_window,
            status: AtomicU16::new(0),
            response: Mutex::new(ResponseData::default()),
        })
    }

    // ── Request side ────────────────────────────────────────────────────

    /// Set the request method and URL.
    pub fn set_url(&mut self, method: &str, url: &str) -> Result<(), HttpError> {
        if method.is_empty() || url.is_empty() {
            return Err(HttpError::InvalidArg);
        }
        self.method = method.to_string();
        self.url = url.to_string();
        Ok(())
    }

    /// Set a request header. A duplicate name (ASCII case-insensitive)
    /// overwrites the value in place; insertion order is preserved.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some((_, existing)) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            *existing = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Set the request body.
    pub fn set_request_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Set the request body from a string.
    pub fn set_request_body_string(&mut self, body: &str) {
        self.body = Body::from(body);
    }

    /// Allow or forbid the retry policy for this call.
    pub fn set_retry_allowed(&mut self, allowed: bool) {
        self.retry_allowed = allowed;
    }

    /// Base delay for the exponential retry backoff.
    pub fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }

    /// Wall-clock window within which retries may be attempted.
    pub fn set_timeout_window(&mut self, window: Duration) {
        self.timeout_window = window;
    }

    /// Process-unique, monotonically increasing call id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request header by name (ASCII case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request header by insertion index.
    pub fn header_at(&self, index: usize) -> Option<(&str, &str)> {
        self.headers
            .get(index)
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn num_headers(&self) -> usize {
        self.headers.len()
    }

    pub fn request_body(&self) -> &Body {
        &self.body
    }

    pub fn retry_allowed(&self) -> bool {
        self.retry_allowed
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn timeout_window(&self) -> Duration {
        self.timeout_window
    }

    // ── Response side: backend-facing setters ───────────────────────────

    /// Record the response status line.
    pub fn set_response_status(&self, status: u16) {
        self.status.store(status, Ordering::Release);
    }

    /// Record a response header. Duplicate names concatenate their values
    /// with `", "`, the way intermediaries fold repeated headers.
    pub fn add_response_header(&self, name: &str, value: &str) {
        let mut response = self.lock_response();
        if let Some((_, existing)) = response
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            existing.push_str(", ");
            existing.push_str(value);
        } else {
            response.headers.push((name.to_string(), value.to_string()));
        }
    }

    /// Append a chunk of response body.
    pub fn append_response_body(&self, chunk: &[u8]) {
        self.lock_response().body.extend_from_slice(chunk);
    }

    /// Replace the response body wholesale.
    pub fn set_response_body(&self, body: impl Into<Bytes>) {
        let bytes = body.into();
        self.lock_response().body = bytes.to_vec();
    }

    /// Record a transport failure for this attempt.
    pub fn set_network_error(&self, kind: NetworkErrorKind, platform_code: u32) {
        self.lock_response().network_error = Some(NetworkError {
            kind,
            platform_code,
        });
    }

    pub(crate) fn set_mocked_from(&self, mock: Arc<MockCall>) {
        self.lock_response().mocked_from = Some(mock);
    }

    /// Clear the response slots between retry attempts.
    pub(crate) fn reset_response(&self) {
        self.status.store(0, Ordering::Release);
        let mut response = self.lock_response();
        response.headers.clear();
        response.body.clear();
        response.network_error = None;
    }

    // ── Response side: getters ──────────────────────────────────────────

    /// Response status code; zero until a response line was recorded.
    pub fn response_status(&self) -> u16 {
        self.status.load(Ordering::Acquire)
    }

    /// Response header by name (ASCII case-insensitive).
    pub fn response_header(&self, name: &str) -> Option<String> {
        self.lock_response()
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    /// Response header by index.
    pub fn response_header_at(&self, index: usize) -> Option<(String, String)> {
        self.lock_response().headers.get(index).cloned()
    }

    pub fn response_num_headers(&self) -> usize {
        self.lock_response().headers.len()
    }

    /// The response body bytes.
    pub fn response_body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock_response().body)
    }

    /// The response body as UTF-8 text.
    pub fn response_string(&self) -> Result<String, HttpError> {
        String::from_utf8(self.lock_response().body.clone()).map_err(|_| HttpError::Parse)
    }

    /// The transport failure recorded for the final attempt, if any.
    pub fn network_error(&self) -> Option<NetworkError> {
        self.lock_response().network_error
    }

    /// The mock this call was served from, when mocks intercepted it.
    pub fn mocked_from(&self) -> Option<Arc<MockCall>> {
        self.lock_response().mocked_from.clone()
    }

    fn lock_response(&self) -> MutexGuard<'_, ResponseData> {
        self.response.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for HttpCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("status", &self.response_status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::{global_cleanup, global_initialize, test_guard};

    #[test]
    fn header_overwrite_preserves_position() {
        let _guard = test_guard();
        global_initialize().unwrap();

        let mut call = HttpCall::new().unwrap();
        call.set_header("Accept", "text/plain");
        call.set_header("X-Trace", "1");
        call.set_header("accept", "application/json");

        assert_eq!(call.num_headers(), 2);
        assert_eq!(call.header_at(0), Some(("Accept", "application/json")));
        assert_eq!(call.header_at(1), Some(("X-Trace", "1")));
        assert_eq!(call.header("ACCEPT"), Some("application/json"));

        global_cleanup();
    }

    #[test]
    fn ids_are_monotonic() {
        let _guard = test_guard();
        global_initialize().unwrap();

        let first = HttpCall::new().unwrap();
        let second = HttpCall::new().unwrap();
        assert!(second.id() > first.id());

        global_cleanup();
    }

    #[test]
    fn create_requires_initialization() {
        let _guard = test_guard();
        assert_eq!(HttpCall::new().err(), Some(HttpError::NotInitialized));
    }

    #[test]
    fn response_headers_fold_duplicates() {
        let _guard = test_guard();
        global_initialize().unwrap();

        let call = HttpCall::new().unwrap();
        call.add_response_header("Set-Cookie", "a=1");
        call.add_response_header("set-cookie", "b=2");
        assert_eq!(call.response_header("Set-Cookie").as_deref(), Some("a=1, b=2"));
        assert_eq!(call.response_num_headers(), 1);

        global_cleanup();
    }

    #[test]
    fn reset_response_clears_attempt_state() {
        let _guard = test_guard();
        global_initialize().unwrap();

        let call = HttpCall::new().unwrap();
        call.set_response_status(500);
        call.append_response_body(b"oops");
        call.set_network_error(NetworkErrorKind::Io, 42);

        call.reset_response();
        assert_eq!(call.response_status(), 0);
        assert!(call.response_body().is_empty());
        assert_eq!(call.network_error(), None);

        global_cleanup();
    }
}
