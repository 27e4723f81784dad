//! Per-bucket in-memory row accumulator.
//!
//! Two locks guard a buffer. The bucket mutex covers the open writer slot
//! and is held only for synchronous work (appends, writer swaps). The
//! flush lock covers everything a flush job mutates and is held across
//! uploads, so it is an async mutex. `flushed_rows` and the pending-upload
//! byte count are atomics readable from either side.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    id::IdAllocator,
    plan::{CompactionSegment, FieldBinlog},
    stats::{FieldStats, SegmentStats},
    value::Row,
    writer::{SegmentWriter, WriterConfig},
};

/// State owned by the flush lock: binlogs of the open output segment,
/// accumulated primary-key stats, and everything already sealed.
pub(crate) struct FlushedState {
    /// Uploaded binlogs of the open segment, keyed by field id.
    pub(crate) binlogs: HashMap<i64, FieldBinlog>,
    /// Primary-key stats over every row flushed into the open segment.
    pub(crate) pk_stats: FieldStats,
    /// Output segments sealed by this buffer so far.
    pub(crate) uploaded_segments: Vec<CompactionSegment>,
    /// Stats of each sealed segment, keyed by segment id.
    pub(crate) uploaded_stats: HashMap<i64, SegmentStats>,
}

struct BufferState {
    writer: Option<SegmentWriter>,
}

/// One output bucket: an open writer plus the flush-side bookkeeping.
pub(crate) struct ClusterBuffer {
    id: usize,
    state: Mutex<BufferState>,
    pending_bytes: AtomicI64,
    flushed_rows: AtomicI64,
    flushed: tokio::sync::Mutex<FlushedState>,
    clustering_key_stats: FieldStats,
}

impl ClusterBuffer {
    pub(crate) fn new(id: usize, clustering_key_stats: FieldStats, pk_stats: FieldStats) -> Self {
        Self {
            id,
            state: Mutex::new(BufferState { writer: None }),
            pending_bytes: AtomicI64::new(0),
            flushed_rows: AtomicI64::new(0),
            flushed: tokio::sync::Mutex::new(FlushedState {
                binlogs: HashMap::new(),
                pk_stats,
                uploaded_segments: Vec::new(),
                uploaded_stats: HashMap::new(),
            }),
            clustering_key_stats,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn clustering_key_stats(&self) -> &FieldStats {
        &self.clustering_key_stats
    }

    pub(crate) fn flushed(&self) -> &tokio::sync::Mutex<FlushedState> {
        &self.flushed
    }

    /// Rows already spilled into the open segment but not yet sealed.
    pub(crate) fn flushed_rows(&self) -> i64 {
        self.flushed_rows.load(Ordering::Relaxed)
    }

    pub(crate) fn add_flushed_rows(&self, rows: i64) {
        self.flushed_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub(crate) fn reset_flushed_rows(&self) {
        self.flushed_rows.store(0, Ordering::Relaxed);
    }

    pub(crate) fn sub_pending_bytes(&self, bytes: i64) {
        self.pending_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Rows currently sitting in the open writer.
    pub(crate) fn writer_row_num(&self) -> i64 {
        self.state
            .lock()
            .writer
            .as_ref()
            .map(|w| w.row_num())
            .unwrap_or(0)
    }

    /// Whether the open writer hit its byte threshold.
    pub(crate) fn writer_is_full(&self) -> bool {
        self.state
            .lock()
            .writer
            .as_ref()
            .map(|w| w.is_full())
            .unwrap_or(false)
    }

    /// Bytes resident for this bucket: open-writer rows plus snapshots
    /// handed to flush jobs and not yet uploaded.
    pub(crate) fn memory_in_use(&self) -> i64 {
        let writer_bytes = self
            .state
            .lock()
            .writer
            .as_ref()
            .map(|w| w.written_memory_size())
            .unwrap_or(0);
        writer_bytes + self.pending_bytes.load(Ordering::Relaxed)
    }

    /// Append one routed row, sealing the open segment first when the row
    /// would push it past `max_segment_rows`.
    ///
    /// Returns the retired writer when a seal happened; the caller must
    /// hand it to the flush scheduler with `pack` set. Doing the cap check
    /// under the bucket lock on every append keeps sealed segments at or
    /// below the cap exactly.
    pub(crate) fn write_routed(
        &self,
        row: Row,
        allocator: &dyn IdAllocator,
        cfg: &Arc<WriterConfig>,
        max_segment_rows: i64,
    ) -> Result<Option<SegmentWriter>> {
        let mut state = self.state.lock();
        let writer = state.writer.as_mut().ok_or_else(|| {
            Error::Internal(format!("bucket {} has no open writer", self.id))
        })?;
        let mut retired = None;
        if writer.row_num() > 0 && self.flushed_rows() + writer.row_num() >= max_segment_rows {
            let fresh = SegmentWriter::new(Arc::clone(cfg), allocator.alloc_one()?);
            let old = std::mem::replace(writer, fresh);
            self.pending_bytes
                .fetch_add(old.written_memory_size(), Ordering::Relaxed);
            retired = Some(old);
        }
        writer.write(row);
        Ok(retired)
    }

    /// Swap in a fresh writer, returning whether the old one must be
    /// packed and the old writer itself (absent only on first call).
    ///
    /// A new segment id is allocated exactly when the seal condition is
    /// met; otherwise the fresh writer continues the open segment.
    pub(crate) fn refresh_writer(
        &self,
        allocator: &dyn IdAllocator,
        cfg: &Arc<WriterConfig>,
        max_segment_rows: i64,
    ) -> Result<(bool, Option<SegmentWriter>)> {
        let mut state = self.state.lock();
        let (pack, segment_id) = match state.writer.as_ref() {
            None => (true, 0),
            Some(w) => {
                self.pending_bytes
                    .fetch_add(w.written_memory_size(), Ordering::Relaxed);
                let seal = self.flushed_rows() + w.row_num() > max_segment_rows;
                (seal, w.segment_id())
            }
        };
        let segment_id = if pack {
            allocator.alloc_one()?
        } else {
            segment_id
        };
        let fresh = SegmentWriter::new(Arc::clone(cfg), segment_id);
        Ok((pack, state.writer.replace(fresh)))
    }

    /// Remove the open writer for the final drain, moving its bytes into
    /// the pending-upload account.
    pub(crate) fn take_writer(&self) -> Option<SegmentWriter> {
        let mut state = self.state.lock();
        let writer = state.writer.take();
        if let Some(w) = &writer {
            self.pending_bytes
                .fetch_add(w.written_memory_size(), Ordering::Relaxed);
        }
        writer
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        id::AtomicIdAllocator,
        schema::{CollectionSchema, DataType, FieldSchema},
        value::{FieldValue, ScalarValue},
    };

    fn cfg() -> Arc<WriterConfig> {
        let pk = FieldSchema::new(100, "pk", DataType::Int64).primary_key();
        Arc::new(WriterConfig {
            schema: Arc::new(CollectionSchema::with_system_fields(vec![pk.clone()])),
            pk_field: pk,
            binlog_max_bytes: 1 << 20,
            storage_root: "files".into(),
            collection_id: 1,
            partition_id: 1,
        })
    }

    fn buffer() -> ClusterBuffer {
        ClusterBuffer::new(
            0,
            FieldStats::new(101, DataType::Int64),
            FieldStats::new(100, DataType::Int64),
        )
    }

    fn row(pk: i64) -> Row {
        let mut fields = BTreeMap::new();
        fields.insert(0, FieldValue::Scalar(ScalarValue::Int64(pk)));
        fields.insert(1, FieldValue::Scalar(ScalarValue::Int64(1)));
        fields.insert(100, FieldValue::Scalar(ScalarValue::Int64(pk)));
        Row {
            pk: ScalarValue::Int64(pk),
            timestamp: 1,
            fields,
        }
    }

    #[test]
    fn first_refresh_allocates_and_packs() {
        let buf = buffer();
        let alloc = AtomicIdAllocator::new(10);
        let (pack, old) = buf.refresh_writer(&alloc, &cfg(), 100).unwrap();
        assert!(pack);
        assert!(old.is_none());
        assert_eq!(buf.writer_row_num(), 0);
    }

    #[test]
    fn refresh_below_cap_keeps_segment_id() {
        let buf = buffer();
        let alloc = AtomicIdAllocator::new(10);
        buf.refresh_writer(&alloc, &cfg(), 100).unwrap();
        buf.write_routed(row(1), &alloc, &cfg(), 100).unwrap();

        let (pack, old) = buf.refresh_writer(&alloc, &cfg(), 100).unwrap();
        assert!(!pack);
        let old = old.unwrap();
        assert_eq!(old.segment_id(), 10);
        assert_eq!(old.row_num(), 1);
        // retired bytes are accounted as pending until uploaded
        assert_eq!(buf.memory_in_use(), old.written_memory_size());
        buf.sub_pending_bytes(old.written_memory_size());
        assert_eq!(buf.memory_in_use(), 0);
    }

    #[test]
    fn write_routed_seals_exactly_at_cap() {
        let buf = buffer();
        let alloc = AtomicIdAllocator::new(10);
        buf.refresh_writer(&alloc, &cfg(), 3).unwrap();

        assert!(buf.write_routed(row(1), &alloc, &cfg(), 3).unwrap().is_none());
        assert!(buf.write_routed(row(2), &alloc, &cfg(), 3).unwrap().is_none());
        assert!(buf.write_routed(row(3), &alloc, &cfg(), 3).unwrap().is_none());
        // fourth append retires the full writer before writing
        let retired = buf.write_routed(row(4), &alloc, &cfg(), 3).unwrap().unwrap();
        assert_eq!(retired.row_num(), 3);
        assert_eq!(retired.segment_id(), 10);
        assert_eq!(buf.writer_row_num(), 1);
    }

    #[test]
    fn take_writer_moves_bytes_to_pending() {
        let buf = buffer();
        let alloc = AtomicIdAllocator::new(10);
        buf.refresh_writer(&alloc, &cfg(), 100).unwrap();
        buf.write_routed(row(1), &alloc, &cfg(), 100).unwrap();

        let before = buf.memory_in_use();
        let writer = buf.take_writer().unwrap();
        assert_eq!(buf.memory_in_use(), before);
        assert_eq!(writer.row_num(), 1);
        assert!(buf.take_writer().is_none());
    }
}
