//! Open-segment row accumulator.
//!
//! A writer owns the in-memory row batch of one in-flight output segment.
//! Sealing a batch serializes every schema field into its own binlog blob;
//! the flush machinery swaps writers in and out of cluster buffers.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;

use crate::{
    codec,
    error::{Error, Result},
    id::IdAllocator,
    plan::{Binlog, FieldBinlog},
    schema::{CollectionSchema, FieldSchema},
    stats::FieldStats,
    store::insert_log_path,
    value::Row,
};

/// Construction parameters shared by every writer of one task.
#[derive(Clone)]
pub(crate) struct WriterConfig {
    pub(crate) schema: Arc<CollectionSchema>,
    pub(crate) pk_field: FieldSchema,
    pub(crate) binlog_max_bytes: i64,
    pub(crate) storage_root: String,
    pub(crate) collection_id: i64,
    pub(crate) partition_id: i64,
}

/// In-memory accumulator for one in-flight output segment.
pub(crate) struct SegmentWriter {
    cfg: Arc<WriterConfig>,
    segment_id: i64,
    rows: Vec<Row>,
    written_bytes: i64,
    pk_stats: FieldStats,
}

impl SegmentWriter {
    pub(crate) fn new(cfg: Arc<WriterConfig>, segment_id: i64) -> Self {
        let pk_stats = FieldStats::new(cfg.pk_field.field_id, cfg.pk_field.data_type);
        Self {
            cfg,
            segment_id,
            rows: Vec::new(),
            written_bytes: 0,
            pk_stats,
        }
    }

    pub(crate) fn segment_id(&self) -> i64 {
        self.segment_id
    }

    pub(crate) fn row_num(&self) -> i64 {
        self.rows.len() as i64
    }

    pub(crate) fn written_memory_size(&self) -> i64 {
        self.written_bytes
    }

    /// Whether the accumulated batch has reached the binlog byte threshold.
    pub(crate) fn is_full(&self) -> bool {
        self.written_bytes >= self.cfg.binlog_max_bytes
    }

    /// Primary-key stats over the rows written so far.
    pub(crate) fn pk_stats(&self) -> &FieldStats {
        &self.pk_stats
    }

    pub(crate) fn write(&mut self, row: Row) {
        self.written_bytes += row.memory_size();
        self.pk_stats.update_min_max(&row.pk);
        self.rows.push(row);
    }

    /// Serialize the batch: one blob per schema field, all rows in write
    /// order, plus the matching binlog descriptors. Allocates one log id
    /// shared by every field of this flush.
    pub(crate) fn serialize_write(
        &self,
        allocator: &dyn IdAllocator,
    ) -> Result<(HashMap<String, Bytes>, HashMap<i64, FieldBinlog>)> {
        let log_id = allocator.alloc_one()?;
        let row_num = self.row_num();
        let mut kvs = HashMap::with_capacity(self.cfg.schema.fields.len());
        let mut binlogs = HashMap::with_capacity(self.cfg.schema.fields.len());
        for field in &self.cfg.schema.fields {
            let column = self
                .rows
                .iter()
                .map(|row| {
                    row.fields
                        .get(&field.field_id)
                        .cloned()
                        .ok_or_else(|| {
                            Error::Internal(format!(
                                "row in segment {} lacks field {}",
                                self.segment_id, field.field_id
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            let bytes = codec::encode_column(&column)?;
            let path = insert_log_path(
                &self.cfg.storage_root,
                self.cfg.collection_id,
                self.cfg.partition_id,
                self.segment_id,
                field.field_id,
                log_id,
            );
            binlogs.insert(
                field.field_id,
                FieldBinlog {
                    field_id: field.field_id,
                    binlogs: vec![Binlog {
                        entries_num: row_num,
                        log_size: bytes.len() as i64,
                        log_path: path.clone(),
                    }],
                },
            );
            kvs.insert(path, bytes);
        }
        Ok((kvs, binlogs))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        id::AtomicIdAllocator,
        schema::DataType,
        value::{FieldValue, ScalarValue},
    };

    fn test_cfg() -> Arc<WriterConfig> {
        let pk = FieldSchema::new(100, "pk", DataType::Int64).primary_key();
        let schema = Arc::new(CollectionSchema::with_system_fields(vec![
            pk.clone(),
            FieldSchema::new(101, "key", DataType::Int64),
        ]));
        Arc::new(WriterConfig {
            schema,
            pk_field: pk,
            binlog_max_bytes: 1024,
            storage_root: "files".into(),
            collection_id: 1,
            partition_id: 2,
        })
    }

    fn row(pk: i64, ts: i64, key: i64) -> Row {
        let mut fields = BTreeMap::new();
        fields.insert(0, FieldValue::Scalar(ScalarValue::Int64(pk)));
        fields.insert(1, FieldValue::Scalar(ScalarValue::Int64(ts)));
        fields.insert(100, FieldValue::Scalar(ScalarValue::Int64(pk)));
        fields.insert(101, FieldValue::Scalar(ScalarValue::Int64(key)));
        Row {
            pk: ScalarValue::Int64(pk),
            timestamp: ts as u64,
            fields,
        }
    }

    #[test]
    fn write_tracks_rows_bytes_and_pk_range() {
        let mut writer = SegmentWriter::new(test_cfg(), 7);
        writer.write(row(5, 1, 50));
        writer.write(row(2, 2, 20));
        assert_eq!(writer.segment_id(), 7);
        assert_eq!(writer.row_num(), 2);
        assert!(writer.written_memory_size() > 0);
        assert!(!writer.is_full());
        assert_eq!(writer.pk_stats().min, Some(ScalarValue::Int64(2)));
        assert_eq!(writer.pk_stats().max, Some(ScalarValue::Int64(5)));
    }

    #[test]
    fn fullness_trips_at_byte_threshold() {
        let mut cfg = (*test_cfg()).clone();
        cfg.binlog_max_bytes = 1;
        let mut writer = SegmentWriter::new(Arc::new(cfg), 7);
        writer.write(row(1, 1, 1));
        assert!(writer.is_full());
    }

    #[test]
    fn serialize_emits_one_blob_per_field() {
        let cfg = test_cfg();
        let mut writer = SegmentWriter::new(Arc::clone(&cfg), 7);
        writer.write(row(1, 1, 10));
        writer.write(row(2, 2, 20));

        let allocator = AtomicIdAllocator::new(500);
        let (kvs, binlogs) = writer.serialize_write(&allocator).unwrap();
        assert_eq!(kvs.len(), cfg.schema.fields.len());
        assert_eq!(binlogs.len(), cfg.schema.fields.len());

        let key_log = &binlogs[&101].binlogs[0];
        assert_eq!(key_log.entries_num, 2);
        let column = codec::decode_column(&kvs[&key_log.log_path]).unwrap();
        assert_eq!(
            column,
            vec![
                FieldValue::Scalar(ScalarValue::Int64(10)),
                FieldValue::Scalar(ScalarValue::Int64(20)),
            ]
        );
    }
}
