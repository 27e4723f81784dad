//! Compaction plan and result descriptors exchanged with the coordinator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::schema::CollectionSchema;

/// Kind of compaction a plan requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionType {
    /// Plain merge of small segments.
    Mix,
    /// Re-bucket rows by clustering-key proximity.
    Clustering,
}

/// Terminal state reported in a plan result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionTaskState {
    /// Still running.
    Executing,
    /// Finished successfully.
    Completed,
    /// Aborted with an error.
    Failed,
}

/// One immutable blob holding one field's values for a contiguous row range.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Binlog {
    /// Number of rows serialized into the blob.
    pub entries_num: i64,
    /// Blob size in bytes.
    pub log_size: i64,
    /// Object-store key of the blob.
    pub log_path: String,
}

/// Ordered binlog list of one field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldBinlog {
    /// Field the binlogs belong to.
    pub field_id: i64,
    /// Blobs in row order; every field of a segment has the same count.
    pub binlogs: Vec<Binlog>,
}

/// Input segment descriptor: per-field insert logs plus delete logs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentBinlogs {
    /// Segment id.
    pub segment_id: i64,
    /// Insert logs, one list per persisted field.
    pub field_binlogs: Vec<FieldBinlog>,
    /// Delete logs recorded against the segment.
    pub deltalogs: Vec<Binlog>,
}

impl SegmentBinlogs {
    /// Number of binlogs per field, taken from the first non-empty field
    /// list. Zero means the segment carries no data at all.
    pub(crate) fn binlog_count(&self) -> usize {
        self.field_binlogs
            .iter()
            .find(|f| !f.binlogs.is_empty())
            .map(|f| f.binlogs.len())
            .unwrap_or(0)
    }
}

/// Immutable clustering compaction plan handed down by the coordinator.
#[derive(Clone, Debug)]
pub struct CompactionPlan {
    /// Unique plan id; doubles as the partition-stats version.
    pub plan_id: i64,
    /// Must be [`CompactionType::Clustering`].
    pub task_type: CompactionType,
    /// Collection the inputs belong to.
    pub collection_id: i64,
    /// Partition the inputs belong to.
    pub partition_id: i64,
    /// Logical channel name of the partition.
    pub channel: String,
    /// Wall-clock deadline in seconds; zero disables the deadline.
    pub timeout_secs: u64,
    /// Collection schema covering every persisted field.
    pub schema: Arc<CollectionSchema>,
    /// Field id of the nominated clustering key.
    pub clustering_key_field: i64,
    /// Collection TTL as a hybrid-timestamp delta; zero disables expiry.
    pub collection_ttl: u64,
    /// Hard cap on rows per output segment.
    pub max_segment_rows: i64,
    /// Preferred rows per output segment; at most `max_segment_rows`.
    pub prefer_segment_rows: i64,
    /// Input segments to re-bucket.
    pub segments: Vec<SegmentBinlogs>,
    /// Root key of the external analyzer's output; empty in scalar mode.
    pub analyze_result_path: String,
    /// Segment ids whose row-to-centroid mapping files exist.
    pub analyze_segment_ids: Vec<i64>,
}

/// One sealed output segment of a finished compaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactionSegment {
    /// Plan that produced the segment.
    pub plan_id: i64,
    /// Allocated segment id.
    pub segment_id: i64,
    /// Total rows sealed into the segment.
    pub num_rows: i64,
    /// Insert logs, one list per field, one binlog appended per flush.
    pub insert_logs: Vec<FieldBinlog>,
    /// Primary-key stats log of the segment.
    pub stats_logs: Vec<FieldBinlog>,
    /// Channel the segment belongs to.
    pub channel: String,
}

/// Result of a finished compaction plan.
#[derive(Clone, Debug)]
pub struct CompactionPlanResult {
    /// Terminal state; always `Completed` on the success path.
    pub state: CompactionTaskState,
    /// Plan id echoed back.
    pub plan_id: i64,
    /// Output segments in unspecified order.
    pub segments: Vec<CompactionSegment>,
    /// Compaction kind echoed back.
    pub task_type: CompactionType,
    /// Channel echoed back.
    pub channel: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binlog_count_skips_empty_field_lists() {
        let seg = SegmentBinlogs {
            segment_id: 1,
            field_binlogs: vec![
                FieldBinlog {
                    field_id: 0,
                    binlogs: vec![],
                },
                FieldBinlog {
                    field_id: 1,
                    binlogs: vec![Binlog {
                        entries_num: 10,
                        log_size: 100,
                        log_path: "p".into(),
                    }],
                },
            ],
            deltalogs: vec![],
        };
        assert_eq!(seg.binlog_count(), 1);

        let empty = SegmentBinlogs {
            segment_id: 2,
            field_binlogs: vec![],
            deltalogs: vec![],
        };
        assert_eq!(empty.binlog_count(), 0);
    }
}
