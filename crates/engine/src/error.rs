use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the transcode engine.
///
/// An ineligible path or an undeclared capability is a policy decision
/// (passthrough or transcode), never an error. Nothing here is downgraded
/// to serving mismatched content: a reader that was promised transcoded
/// output sees the failure instead of the original bytes.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The media identity the handle was resolved from no longer exists.
    #[error("no media found at {}", .0.display())]
    NotFound(PathBuf),

    /// The codec service failed while producing the artifact. Every waiter
    /// on the same in-flight build receives this same failure.
    #[error("transcode failed: {0}")]
    CodecFailure(String),

    /// The cache entry was invalidated (source deleted or replaced) while
    /// a handle was still attached to it.
    #[error("cache entry invalidated")]
    Invalidated,

    /// A reader waited longer than the configured bound for bytes the
    /// producer had not yet written.
    #[error("timed out waiting for transcoded bytes")]
    Timeout,

    /// Read through a handle that was already closed.
    #[error("handle is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TranscodeError>;
