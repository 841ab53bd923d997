use thiserror::Error;

/// Error taxonomy shared by the store, queue, and driver layers.
///
/// The binary wraps these in `anyhow` at the top level; library code keeps
/// the typed variants so callers can tell a retryable teardown race
/// (`Busy`) from a fatal misconfiguration (`Config`).
#[derive(Debug, Error)]
pub enum Error {
    /// The backend is unreachable or produced an invalid handle.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Invalid test parameters, e.g. a zero worker-thread count.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An admitted asynchronous operation completed with a nonzero
    /// backend error code. Surfaces to whichever thread reaped the
    /// completion; other in-flight operations are unaffected.
    #[error("operation completed with backend error code {code}")]
    Completion { code: i32 },

    /// Teardown was attempted while operations are still outstanding.
    /// Retryable.
    #[error("resource is busy with outstanding operations")]
    Busy,

    /// A bounded retry or wait budget was exhausted.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A handle referenced something the backend no longer knows about.
    #[error("no such {0}")]
    NotFound(&'static str),

    /// Backend-side failure of a synchronous operation.
    #[error("backend error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;
