//! The streaming re-bucketing core: buffers, planners, mapping workers,
//! the flush scheduler, and the task driver that sequences them.

/// Per-bucket accumulators.
mod buffer;
/// Flush scheduling and segment sealing.
mod flush;
/// Parallel per-segment mapping workers.
mod mapping;
/// Scalar and vector bucket planners.
mod planner;
/// Task driver and run-scoped shared state.
mod task;

pub use task::{ClusteringCompactionTask, StopHandle};
