//! Streaming re-bucketing engine for clustering compaction.
//!
//! A [`ClusteringCompactionTask`] ingests sealed column-oriented segments
//! of one partition, classifies every surviving row into one of N output
//! buckets (by scalar key range or by external centroid assignment), and
//! writes bucket-local segments back to object storage while a cooperative
//! flush scheduler keeps in-memory residency under a configured budget.
//! The run ends by publishing a versioned partition statistics snapshot
//! for the query planner.
//!
//! Object storage and id allocation are injected; see [`store::BlobStore`]
//! and [`id::IdAllocator`].

/// Binlog payload codec: field columns, delete logs, row reassembly.
pub mod codec;
/// The re-bucketing core.
pub mod compaction;
/// Crate error types.
pub mod error;
/// Injected id allocation.
pub mod id;
mod logging;
/// Task counters.
pub mod metrics;
/// Task configuration.
pub mod option;
/// Plan and result descriptors.
pub mod plan;
/// Collection schema types.
pub mod schema;
/// Field, segment, and partition statistics.
pub mod stats;
/// Object-storage seam and blob key layout.
pub mod store;
/// Hybrid logical timestamps.
pub mod timestamp;
mod tombstone;
/// Dynamic row values.
pub mod value;
mod writer;

pub use crate::{
    compaction::{ClusteringCompactionTask, StopHandle},
    error::{Error, Result},
    option::CompactionOptions,
};
