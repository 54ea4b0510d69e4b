use thiserror::Error;

/// Errors produced by the HTTP call layer.
///
/// Transport failures are deliberately absent: they complete the async
/// operation successfully and are reported on the call object itself as a
/// [`NetworkError`], so callers inspect the call rather than the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HttpError {
    /// `global_initialize` has not been called (or cleanup already ran).
    #[error("http runtime not initialized")]
    NotInitialized,

    /// A malformed request argument (empty method or URL).
    #[error("invalid argument")]
    InvalidArg,

    /// The response body is not valid UTF-8.
    #[error("response body is not valid utf-8")]
    Parse,

    /// Failure surfaced by the async runtime underneath.
    #[error("runtime error: {0}")]
    Runtime(#[from] tasklane::Error),
}

/// Classification of a transport failure, recorded on the call object by
/// the backend together with a platform-specific code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// The attempt exceeded its transport-level deadline.
    Timeout,
    /// TCP connect failed.
    ConnectFailure,
    /// Name resolution failed.
    Dns,
    /// TLS negotiation failed.
    Tls,
    /// The connection dropped mid-exchange.
    Io,
    /// No backend is registered on this platform.
    NoBackend,
    /// Anything the backend could not classify.
    Unknown,
}

impl NetworkErrorKind {
    /// Whether the retry policy may attempt the call again after this
    /// failure.
    pub fn retryable(self) -> bool {
        match self {
            NetworkErrorKind::Timeout
            | NetworkErrorKind::ConnectFailure
            | NetworkErrorKind::Dns
            | NetworkErrorKind::Io
            | NetworkErrorKind::Unknown => true,
            NetworkErrorKind::Tls | NetworkErrorKind::NoBackend => false,
        }
    }
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::ConnectFailure => "connect failure",
            NetworkErrorKind::Dns => "dns failure",
            NetworkErrorKind::Tls => "tls failure",
            NetworkErrorKind::Io => "io failure",
            NetworkErrorKind::NoBackend => "no backend",
            NetworkErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A transport failure recorded on a call: the abstract kind plus whatever
/// code the platform stack reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub platform_code: u32,
}
