//! Mock engine: canned responses that short-circuit the network path.
//!
//! Mocks live in an ordered list inside the global runtime. Lookup walks
//! from the most recently added mock and picks the first whose method and
//! URL filters match (`"*"` matches anything), recording it as the last
//! matching mock for test introspection.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::HttpError;
use crate::global;

/// A canned response with method and URL filters.
#[derive(Debug, Clone)]
pub struct MockCall {
    method: String,
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl MockCall {
    /// Create a mock matching `method` and `url`; either may be `"*"` to
    /// match anything. The canned response defaults to an empty 200.
    pub fn new(method: &str, url: &str) -> MockCall {
        MockCall {
            method: method.to_string(),
            url: url.to_string(),
            status: 200,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Set the canned status code.
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Add a canned response header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Set the canned response body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method_filter(&self) -> &str {
        &self.method
    }

    pub fn url_filter(&self) -> &str {
        &self.url
    }

    pub fn response_status(&self) -> u16 {
        self.status
    }

    pub fn response_headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn response_body(&self) -> &Bytes {
        &self.body
    }

    fn matches(&self, method: &str, url: &str) -> bool {
        let method_ok = self.method == "*" || self.method.eq_ignore_ascii_case(method);
        let url_ok = self.url == "*" || self.url == url;
        method_ok && url_ok
    }
}

/// Ordered mock list plus the enable flag, owned by the global runtime.
pub(crate) struct MockRegistry {
    enabled: bool,
    mocks: Vec<Arc<MockCall>>,
    last_matching: Option<Arc<MockCall>>,
}

impl MockRegistry {
    pub(crate) fn new() -> MockRegistry {
        MockRegistry {
            enabled: false,
            mocks: Vec::new(),
            last_matching: None,
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn add(&mut self, mock: Arc<MockCall>) {
        self.mocks.push(mock);
    }

    pub(crate) fn clear(&mut self) {
        self.mocks.clear();
        self.last_matching = None;
    }

    pub(crate) fn last_matching(&self) -> Option<Arc<MockCall>> {
        self.last_matching.clone()
    }

    /// Most recently added mock whose filters accept the request, if mocks
    /// are enabled. Records the hit.
    pub(crate) fn find_match(&mut self, method: &str, url: &str) -> Option<Arc<MockCall>> {
        if !self.enabled {
            return None;
        }
        let hit = self
            .mocks
            .iter()
            .rev()
            .find(|mock| mock.matches(method, url))
            .cloned()?;
        self.last_matching = Some(Arc::clone(&hit));
        Some(hit)
    }
}

// ── Flat API over the global registry ───────────────────────────────────

/// Turn mock interception on or off.
pub fn set_mocks_enabled(enabled: bool) -> Result<(), HttpError> {
    let global = global::handle()?;
    global.mocks().set_enabled(enabled);
    Ok(())
}

/// Register a mock. Later additions take precedence over earlier ones.
pub fn add_mock(mock: MockCall) -> Result<Arc<MockCall>, HttpError> {
    let global = global::handle()?;
    let mock = Arc::new(mock);
    global.mocks().add(Arc::clone(&mock));
    Ok(mock)
}

/// Drop every registered mock and forget the last match.
pub fn clear_mocks() -> Result<(), HttpError> {
    let global = global::handle()?;
    global.mocks().clear();
    Ok(())
}

/// The mock most recently selected by a perform, for test introspection.
pub fn last_matching_mock() -> Result<Option<Arc<MockCall>>, HttpError> {
    let global = global::handle()?;
    Ok(global.mocks().last_matching())
}
