//! Tombstone index built from the inputs' delete logs.

use std::collections::HashMap;

use crate::{
    codec,
    error::Result,
    logging::rb_log,
    plan::SegmentBinlogs,
    store::BlobStore,
    timestamp::Timestamp,
    value::ScalarValue,
};

/// Frozen map of primary key to the latest delete timestamp recorded
/// against it. Built once before mapping starts, read-only afterwards.
#[derive(Debug, Default)]
pub(crate) struct TombstoneIndex {
    map: HashMap<ScalarValue, Timestamp>,
}

impl TombstoneIndex {
    /// Download every delete log of every input segment and fold the
    /// entries into the index, keeping the highest timestamp per key.
    pub(crate) async fn load(store: &dyn BlobStore, segments: &[SegmentBinlogs]) -> Result<Self> {
        let paths: Vec<String> = segments
            .iter()
            .flat_map(|s| s.deltalogs.iter().map(|d| d.log_path.clone()))
            .collect();
        if paths.is_empty() {
            return Ok(Self::default());
        }
        let blobs = store.download(&paths).await?;
        let mut map: HashMap<ScalarValue, Timestamp> = HashMap::new();
        for blob in &blobs {
            for entry in codec::decode_delete_log(blob)? {
                map.entry(entry.pk)
                    .and_modify(|ts| {
                        if *ts < entry.timestamp {
                            *ts = entry.timestamp;
                        }
                    })
                    .or_insert(entry.timestamp);
            }
        }
        rb_log!(
            log::Level::Info,
            "tombstones_loaded",
            "deltalogs={} keys={}",
            paths.len(),
            map.len()
        );
        Ok(Self { map })
    }

    /// Whether a row version is shadowed by a tombstone.
    ///
    /// Strictly less-than: an insert and a delete sharing a timestamp form
    /// an upsert, and the inserted row survives.
    pub(crate) fn is_deleted(&self, pk: &ScalarValue, ts: Timestamp) -> bool {
        matches!(self.map.get(pk), Some(&deleted_at) if ts < deleted_at)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::DeleteLog,
        plan::Binlog,
        store::MemoryBlobStore,
    };

    fn deltalog(path: &str, entries: &[DeleteLog], store: &MemoryBlobStore) -> Binlog {
        let bytes = codec::encode_delete_log(entries).unwrap();
        store.insert(path, bytes.clone());
        Binlog {
            entries_num: entries.len() as i64,
            log_size: bytes.len() as i64,
            log_path: path.to_string(),
        }
    }

    fn segment(id: i64, deltalogs: Vec<Binlog>) -> SegmentBinlogs {
        SegmentBinlogs {
            segment_id: id,
            field_binlogs: vec![],
            deltalogs,
        }
    }

    #[tokio::test]
    async fn keeps_highest_timestamp_per_key() {
        let store = MemoryBlobStore::new();
        let a = deltalog(
            "d/1",
            &[
                DeleteLog {
                    pk: ScalarValue::Int64(1),
                    timestamp: 10,
                },
                DeleteLog {
                    pk: ScalarValue::Int64(2),
                    timestamp: 5,
                },
            ],
            &store,
        );
        let b = deltalog(
            "d/2",
            &[DeleteLog {
                pk: ScalarValue::Int64(1),
                timestamp: 30,
            }],
            &store,
        );
        let index = TombstoneIndex::load(&store, &[segment(1, vec![a]), segment(2, vec![b])])
            .await
            .unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.is_deleted(&ScalarValue::Int64(1), 29));
        assert!(!index.is_deleted(&ScalarValue::Int64(1), 30));
        assert!(!index.is_deleted(&ScalarValue::Int64(2), 5));
    }

    #[tokio::test]
    async fn equal_timestamps_preserve_upserts() {
        let store = MemoryBlobStore::new();
        let d = deltalog(
            "d/1",
            &[DeleteLog {
                pk: ScalarValue::VarChar("k".into()),
                timestamp: 100,
            }],
            &store,
        );
        let index = TombstoneIndex::load(&store, &[segment(1, vec![d])]).await.unwrap();
        assert!(!index.is_deleted(&ScalarValue::VarChar("k".into()), 100));
        assert!(index.is_deleted(&ScalarValue::VarChar("k".into()), 99));
    }

    #[tokio::test]
    async fn no_deltalogs_yields_empty_index() {
        let store = MemoryBlobStore::new();
        let index = TombstoneIndex::load(&store, &[segment(1, vec![])]).await.unwrap();
        assert_eq!(index.len(), 0);
    }
}
