use thiserror::Error;

use crate::{codec::CodecError, id::AllocError, store::StoreError};

/// Errors surfaced by a clustering compaction run.
#[derive(Debug, Error)]
pub enum Error {
    /// The plan failed validation: wrong type, broken schema, or empty inputs.
    #[error("illegal compaction plan: {0}")]
    IllegalPlan(String),
    /// A binlog, delete log, or analyzer artifact failed to parse or encode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// Object storage download or upload failed.
    #[error("blob store error: {0}")]
    Store(#[from] StoreError),
    /// The id allocator could not issue a new segment or log id.
    #[error("id allocation error: {0}")]
    Alloc(#[from] AllocError),
    /// The task was cancelled before it could finish.
    #[error("compaction task cancelled")]
    Cancelled,
    /// The plan deadline elapsed before the task finished.
    #[error("compaction task timed out after {0}s")]
    Timeout(u64),
    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
