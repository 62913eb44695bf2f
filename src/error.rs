//! Error taxonomy for the operation queue: one `thiserror` enum, `From`
//! conversions at the boundary, string payloads so the error type stays
//! `Clone` (needed to fan a single commit failure out to every completion
//! still pending in a chunk).

use std::io;

pub type CacheResult<T> = Result<T, CacheError>;

/// The error kinds a caller can observe on a completion.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// BEGIN failed due to contention. The chunk was re-enqueued; this
    /// variant only ever appears in logs, never on a completion, because a
    /// transient failure is retried rather than surfaced.
    #[error("storage busy, begin failed: {0}")]
    TransientStorageBusy(String),

    /// A single statement's bind/step failed mid-chunk.
    #[error("operation failed: {0}")]
    ItemExecutionFailed(String),

    /// The chunk's COMMIT failed; every not-yet-terminated completion in
    /// the chunk receives this.
    #[error("commit failed: {0}")]
    CommitFailed(String),

    /// The worker observed an op kind it has no dispatch arm for.
    #[error("unknown operation kind: {0}")]
    UnknownOp(String),

    /// A request was enqueued after the queue was disposed.
    #[error("operation queue has been disposed")]
    Disposed,
}

impl From<rusqlite::Error> for CacheError {
    fn from(error: rusqlite::Error) -> CacheError {
        CacheError::ItemExecutionFailed(error.to_string())
    }
}

impl From<io::Error> for CacheError {
    fn from(error: io::Error) -> CacheError {
        CacheError::ItemExecutionFailed(error.to_string())
    }
}
