use std::time::Duration;

use sysinfo::System;

const DEFAULT_WORKER_POOL_SIZE: usize = 8;
const DEFAULT_MEMORY_BUFFER_RATIO: f64 = 0.1;
const DEFAULT_BINLOG_MAX_BYTES: i64 = 16 * 1024 * 1024;
const DEFAULT_FLUSH_CHANNEL_CAPACITY: usize = 100;
const DEFAULT_BACKPRESSURE_POLL: Duration = Duration::from_millis(200);

/// Configure the operating parameters of a clustering compaction task.
#[derive(Clone, Debug)]
pub struct CompactionOptions {
    /// Number of concurrent mapping jobs; also caps concurrent flush jobs.
    pub(crate) worker_pool_size: usize,

    /// Fraction of host memory granted to cluster buffers when no explicit
    /// budget is set.
    pub(crate) memory_buffer_ratio: f64,

    /// Explicit memory budget in bytes, overriding the host-memory ratio.
    pub(crate) memory_buffer_size: Option<i64>,

    /// Byte threshold at which an open segment writer reports itself full.
    pub(crate) binlog_max_bytes: i64,

    /// Capacity of the flush signal channel.
    pub(crate) flush_channel_capacity: usize,

    /// Poll interval of the cooperative backpressure loop.
    pub(crate) backpressure_poll: Duration,

    /// Key prefix under which output binlogs and stats logs are stored.
    pub(crate) storage_root: String,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            memory_buffer_ratio: DEFAULT_MEMORY_BUFFER_RATIO,
            memory_buffer_size: None,
            binlog_max_bytes: DEFAULT_BINLOG_MAX_BYTES,
            flush_channel_capacity: DEFAULT_FLUSH_CHANNEL_CAPACITY,
            backpressure_poll: DEFAULT_BACKPRESSURE_POLL,
            storage_root: "files".to_string(),
        }
    }
}

impl CompactionOptions {
    /// Set the mapping/flush worker pool size.
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set the fraction of host memory granted to cluster buffers.
    pub fn with_memory_buffer_ratio(mut self, ratio: f64) -> Self {
        self.memory_buffer_ratio = ratio;
        self
    }

    /// Pin the memory budget to an explicit byte count instead of deriving
    /// it from host memory.
    pub fn with_memory_buffer_size(mut self, bytes: i64) -> Self {
        self.memory_buffer_size = Some(bytes);
        self
    }

    /// Set the byte threshold at which an open writer reports itself full.
    pub fn with_binlog_max_bytes(mut self, bytes: i64) -> Self {
        self.binlog_max_bytes = bytes;
        self
    }

    /// Set the poll interval of the backpressure loop.
    pub fn with_backpressure_poll(mut self, poll: Duration) -> Self {
        self.backpressure_poll = poll;
        self
    }

    /// Set the key prefix for output blobs.
    pub fn with_storage_root(mut self, root: impl Into<String>) -> Self {
        self.storage_root = root.into();
        self
    }

    pub(crate) fn worker_pool_size(&self) -> usize {
        self.worker_pool_size.max(1)
    }

    /// Resolve the memory budget: the explicit override if set, otherwise
    /// `ratio` of the host's total memory.
    pub(crate) fn memory_budget(&self) -> i64 {
        if let Some(bytes) = self.memory_buffer_size {
            return bytes.max(1);
        }
        let mut sys = System::new();
        sys.refresh_memory();
        ((sys.total_memory() as f64) * self.memory_buffer_ratio) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_budget_wins_over_ratio() {
        let opts = CompactionOptions::default()
            .with_memory_buffer_ratio(0.5)
            .with_memory_buffer_size(1024);
        assert_eq!(opts.memory_budget(), 1024);
    }

    #[test]
    fn pool_size_floor_is_one() {
        let opts = CompactionOptions::default().with_worker_pool_size(0);
        assert_eq!(opts.worker_pool_size(), 1);
    }
}
