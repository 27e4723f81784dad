//! Task-level counters observable while a compaction runs.

use std::sync::atomic::{AtomicI64, Ordering};

/// Counters shared between a running task and its caller.
///
/// Obtained from [`ClusteringCompactionTask::metrics`] before the task is
/// consumed; all reads are monotonic snapshots.
///
/// [`ClusteringCompactionTask::metrics`]: crate::compaction::ClusteringCompactionTask::metrics
#[derive(Debug, Default)]
pub struct CompactionMetrics {
    written_rows: AtomicI64,
    deleted_rows: AtomicI64,
    expired_rows: AtomicI64,
    flush_count: AtomicI64,
    peak_buffer_memory: AtomicI64,
}

impl CompactionMetrics {
    /// Rows routed into cluster buffers so far.
    pub fn written_rows(&self) -> i64 {
        self.written_rows.load(Ordering::Relaxed)
    }

    /// Rows dropped by the tombstone filter.
    pub fn deleted_rows(&self) -> i64 {
        self.deleted_rows.load(Ordering::Relaxed)
    }

    /// Rows dropped by the TTL filter.
    pub fn expired_rows(&self) -> i64 {
        self.expired_rows.load(Ordering::Relaxed)
    }

    /// Completed binlog flushes.
    pub fn flush_count(&self) -> i64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    /// Highest total buffer residency observed, in bytes.
    pub fn peak_buffer_memory(&self) -> i64 {
        self.peak_buffer_memory.load(Ordering::Relaxed)
    }

    pub(crate) fn record_written(&self) {
        self.written_rows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deleted(&self, rows: i64) {
        self.deleted_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, rows: i64) {
        self.expired_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_buffer_memory(&self, bytes: i64) {
        self.peak_buffer_memory.fetch_max(bytes, Ordering::Relaxed);
    }
}
