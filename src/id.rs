use std::sync::atomic::{AtomicI64, Ordering};

use thiserror::Error;

/// Error returned when the allocator cannot issue another id.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AllocError(pub String);

/// Issuer of globally unique 64-bit ids for output segments and log files.
///
/// Implementations are injected by the embedding process; ids need no
/// ordering relationship, only uniqueness.
pub trait IdAllocator: Send + Sync {
    /// Produce the next unique id.
    fn alloc_one(&self) -> Result<i64, AllocError>;
}

/// Process-local allocator backed by an atomic counter.
///
/// Suitable for tests and single-node embedding; a cluster deployment
/// injects an allocator backed by the coordinator instead.
pub struct AtomicIdAllocator {
    next: AtomicI64,
}

impl AtomicIdAllocator {
    /// Create an allocator that issues ids starting at `start`.
    pub fn new(start: i64) -> Self {
        Self {
            next: AtomicI64::new(start),
        }
    }
}

impl Default for AtomicIdAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdAllocator for AtomicIdAllocator {
    fn alloc_one(&self) -> Result<i64, AllocError> {
        Ok(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
