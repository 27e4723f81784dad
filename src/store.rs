//! Object-storage seam and blob key layout.
//!
//! The engine never talks to a concrete object store; the embedding process
//! injects a [`BlobStore`]. [`MemoryBlobStore`] backs tests and single-node
//! embedding.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;

/// Directory component of input/output analyzer artifacts.
pub const ANALYZE_STATS_DIR: &str = "analyze_stats";
/// Directory component of published partition stats snapshots.
pub const PARTITION_STATS_DIR: &str = "partition_stats";
/// File name of a partition's centroid list.
pub const CENTROIDS_FILE: &str = "centroids";
/// File name of a segment's row-to-centroid mapping.
pub const OFFSET_MAPPING_FILE: &str = "offset_mapping";

/// Errors surfaced by a blob store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A requested key does not exist.
    #[error("blob not found: {0}")]
    NotFound(String),
    /// The store could not serve the request.
    #[error("object store failure: {0}")]
    Io(String),
}

/// Object storage as the engine sees it: batched downloads and uploads of
/// opaque blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch every path, preserving input order.
    async fn download(&self, paths: &[String]) -> Result<Vec<Bytes>, StoreError>;

    /// Persist every key/value pair.
    async fn upload(&self, kvs: HashMap<String, Bytes>) -> Result<(), StoreError>;
}

/// In-memory [`BlobStore`] backed by a locked map.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob directly, bypassing the async interface.
    pub fn insert(&self, key: impl Into<String>, value: Bytes) {
        self.blobs.write().insert(key.into(), value);
    }

    /// Read a blob directly, if present.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.blobs.read().get(key).cloned()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// All keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.blobs
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn download(&self, paths: &[String]) -> Result<Vec<Bytes>, StoreError> {
        let blobs = self.blobs.read();
        paths
            .iter()
            .map(|p| {
                blobs
                    .get(p)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(p.clone()))
            })
            .collect()
    }

    async fn upload(&self, kvs: HashMap<String, Bytes>) -> Result<(), StoreError> {
        self.blobs.write().extend(kvs);
        Ok(())
    }
}

/// Key of one insert-log blob.
pub fn insert_log_path(
    root: &str,
    collection_id: i64,
    partition_id: i64,
    segment_id: i64,
    field_id: i64,
    log_id: i64,
) -> String {
    format!("{root}/insert_log/{collection_id}/{partition_id}/{segment_id}/{field_id}/{log_id}")
}

/// Key of one stats-log blob.
pub fn stats_log_path(
    root: &str,
    collection_id: i64,
    partition_id: i64,
    segment_id: i64,
    field_id: i64,
    log_id: i64,
) -> String {
    format!("{root}/stats_log/{collection_id}/{partition_id}/{segment_id}/{field_id}/{log_id}")
}

/// Key of a partition's centroid list produced by the external analyzer.
pub fn centroids_path(
    analyze_root: &str,
    collection_id: i64,
    partition_id: i64,
    field_id: i64,
) -> String {
    format!("{analyze_root}/{collection_id}/{partition_id}/{field_id}/{CENTROIDS_FILE}")
}

/// Key of one segment's row-to-centroid mapping produced by the analyzer.
pub fn offset_mapping_path(
    analyze_root: &str,
    collection_id: i64,
    partition_id: i64,
    field_id: i64,
    segment_id: i64,
) -> String {
    format!(
        "{analyze_root}/{collection_id}/{partition_id}/{field_id}/{segment_id}/{OFFSET_MAPPING_FILE}"
    )
}

/// Key of the published partition stats snapshot.
///
/// The snapshot lives beside (not under) the analyzer output: the analyze
/// root is truncated at its `analyze_stats` component.
pub fn partition_stats_path(
    analyze_root: &str,
    collection_id: i64,
    partition_id: i64,
    channel: &str,
    version: i64,
) -> String {
    let root = match analyze_root.find(ANALYZE_STATS_DIR) {
        Some(idx) => analyze_root[..idx].trim_end_matches('/'),
        None => "",
    };
    let tail =
        format!("{PARTITION_STATS_DIR}/{collection_id}/{partition_id}/{channel}/{version}");
    if root.is_empty() {
        tail
    } else {
        format!("{root}/{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn download_preserves_order_and_reports_missing() {
        let store = MemoryBlobStore::new();
        store.insert("a", Bytes::from_static(b"1"));
        store.insert("b", Bytes::from_static(b"2"));

        let got = store
            .download(&["b".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert_eq!(got, vec![Bytes::from_static(b"2"), Bytes::from_static(b"1")]);

        let err = store.download(&["missing".to_string()]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn partition_stats_key_strips_analyze_root() {
        let key = partition_stats_path("files/analyze_stats", 1, 2, "ch-0", 99);
        assert_eq!(key, "files/partition_stats/1/2/ch-0/99");

        let bare = partition_stats_path("", 1, 2, "ch-0", 99);
        assert_eq!(bare, "partition_stats/1/2/ch-0/99");
    }
}
