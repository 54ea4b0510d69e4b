use thiserror::Error;

/// Errors produced by the tasklane runtime.
///
/// The runtime uses a flat result-code style: every fallible operation
/// returns one of these, and the terminal status of an async operation is a
/// `Result<(), Error>` stored in its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Generic failure with no more specific classification.
    #[error("operation failed")]
    Fail,

    /// A required argument was missing or malformed (reused block, wrong
    /// result token, dispatch from the wrong thread).
    #[error("invalid argument")]
    InvalidArg,

    /// Allocation or OS resource creation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The supplied buffer is smaller than the operation's payload.
    #[error("buffer too small")]
    BufferTooSmall,

    /// The global runtime has not been initialized.
    #[error("not initialized")]
    NotInitialized,

    /// The requested capability is absent (no payload to retrieve, no
    /// backend registered on this platform).
    #[error("feature not present")]
    FeatureNotPresent,

    /// The operation has not reached a terminal state yet. Also returned by
    /// a provider's work invocation to mean "completion will arrive later".
    #[error("operation pending")]
    Pending,

    /// The operation was canceled.
    #[error("operation aborted")]
    Aborted,

    /// Internal contract violation: a provider returned success without
    /// completing, or an attached state failed its signature check.
    #[error("unexpected internal state")]
    Unexpected,

    /// The queue was closed; no further submissions are accepted.
    #[error("queue closed")]
    Closed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
