//! Bucket planning: scalar histogram range-bucketing and vector centroid
//! loading.

use std::{collections::HashMap, sync::Arc, time::Instant};

use futures::stream::{FuturesUnordered, StreamExt};

use crate::{
    codec::{self, CodecError},
    compaction::{buffer::ClusterBuffer, task::TaskContext},
    error::{Error, Result},
    logging::rb_log,
    plan::SegmentBinlogs,
    schema::{ROW_ID_FIELD_ID, TIMESTAMP_FIELD_ID},
    stats::{CentroidIdMapping, CentroidStats, FieldStats},
    store::{centroids_path, offset_mapping_path},
    timestamp::is_expired,
    value::ScalarValue,
};

/// Routes each surviving row to its output bucket.
pub(crate) enum Classifier {
    /// Scalar mode: planner-emitted key membership.
    Scalar {
        /// Clustering-key value to bucket index.
        membership: HashMap<ScalarValue, usize>,
    },
    /// Vector mode: per-segment row-to-centroid mappings, fetched lazily
    /// by each mapping worker.
    Vector {
        /// Segment id to mapping-blob key.
        mapping_paths: HashMap<i64, String>,
    },
}

/// Planner output: one buffer per bucket plus the row classifier.
pub(crate) struct BucketPlan {
    pub(crate) buffers: Vec<Arc<ClusterBuffer>>,
    pub(crate) classifier: Classifier,
}

/// Greedy range-bucketing over a sorted clustering-key histogram.
///
/// Keys whose own count exceeds `prefer_rows` become singleton buckets;
/// otherwise keys accumulate until a bucket would pass `max_rows` (the key
/// starts the next bucket) or passes `prefer_rows` (the key still joins,
/// then the bucket seals). The residual bucket is emitted even when empty.
pub(crate) fn greedy_bucket_keys(
    histogram: &HashMap<ScalarValue, i64>,
    max_rows: i64,
    prefer_rows: i64,
) -> Vec<Vec<ScalarValue>> {
    let mut keys: Vec<ScalarValue> = histogram.keys().cloned().collect();
    keys.sort();

    let mut buckets: Vec<Vec<ScalarValue>> = Vec::new();
    let mut current: Vec<ScalarValue> = Vec::new();
    let mut current_size: i64 = 0;
    for key in keys {
        let count = histogram.get(&key).copied().unwrap_or(0);
        if count > prefer_rows {
            if !current.is_empty() {
                buckets.push(std::mem::take(&mut current));
                current_size = 0;
            }
            buckets.push(vec![key]);
        } else if current_size + count > max_rows {
            buckets.push(std::mem::replace(&mut current, vec![key]));
            current_size = count;
        } else if current_size + count > prefer_rows {
            current.push(key);
            buckets.push(std::mem::take(&mut current));
            current_size = 0;
        } else {
            current.push(key);
            current_size += count;
        }
    }
    buckets.push(current);
    buckets
}

/// Scalar planner: analyze the clustering-key distribution, cut it into
/// buckets, and materialize one buffer per bucket.
pub(crate) async fn plan_scalar_buckets(ctx: &Arc<TaskContext>) -> Result<BucketPlan> {
    let histogram = analyze_histogram(ctx).await?;
    let buckets = greedy_bucket_keys(
        &histogram,
        ctx.plan.max_segment_rows,
        ctx.plan.prefer_segment_rows,
    );

    let field = &ctx.clustering_field;
    let mut buffers = Vec::with_capacity(buckets.len());
    let mut membership = HashMap::with_capacity(histogram.len());
    for (id, bucket) in buckets.into_iter().enumerate() {
        let mut stats = FieldStats::new(field.field_id, field.data_type);
        for key in &bucket {
            stats.update_min_max(key);
        }
        let buffer = Arc::new(ClusterBuffer::new(
            id,
            stats,
            FieldStats::new(ctx.pk_field.field_id, ctx.pk_field.data_type),
        ));
        buffer.refresh_writer(
            ctx.allocator.as_ref(),
            &ctx.writer_cfg,
            ctx.plan.max_segment_rows,
        )?;
        for key in bucket {
            membership.insert(key, id);
        }
        buffers.push(buffer);
    }
    rb_log!(
        log::Level::Info,
        "scalar_plan_done",
        "distinct_keys={} buckets={}",
        histogram.len(),
        buffers.len()
    );
    Ok(BucketPlan {
        buffers,
        classifier: Classifier::Scalar { membership },
    })
}

/// Vector planner: load the analyzer's centroids, one buffer per centroid,
/// and record where each segment's row-to-centroid mapping lives.
pub(crate) async fn plan_vector_buckets(ctx: &Arc<TaskContext>) -> Result<BucketPlan> {
    let path = centroids_path(
        &ctx.plan.analyze_result_path,
        ctx.plan.collection_id,
        ctx.plan.partition_id,
        ctx.clustering_field.field_id,
    );
    let blobs = ctx.store.download(std::slice::from_ref(&path)).await?;
    let centroids = CentroidStats::from_bytes(&blobs[0])?;
    rb_log!(
        log::Level::Debug,
        "centroids_loaded",
        "path={} centroids={}",
        path,
        centroids.centroids.len()
    );

    let field = &ctx.clustering_field;
    let mut buffers = Vec::with_capacity(centroids.centroids.len());
    for (id, centroid) in centroids.centroids.into_iter().enumerate() {
        let mut stats = FieldStats::new(field.field_id, field.data_type);
        stats.set_centroid(centroid);
        let buffer = Arc::new(ClusterBuffer::new(
            id,
            stats,
            FieldStats::new(ctx.pk_field.field_id, ctx.pk_field.data_type),
        ));
        buffer.refresh_writer(
            ctx.allocator.as_ref(),
            &ctx.writer_cfg,
            ctx.plan.max_segment_rows,
        )?;
        buffers.push(buffer);
    }

    let mapping_paths = ctx
        .plan
        .analyze_segment_ids
        .iter()
        .map(|segment_id| {
            (
                *segment_id,
                offset_mapping_path(
                    &ctx.plan.analyze_result_path,
                    ctx.plan.collection_id,
                    ctx.plan.partition_id,
                    ctx.clustering_field.field_id,
                    *segment_id,
                ),
            )
        })
        .collect();
    Ok(BucketPlan {
        buffers,
        classifier: Classifier::Vector { mapping_paths },
    })
}

/// Fetch one segment's row-to-centroid mapping.
pub(crate) async fn load_centroid_mapping(
    ctx: &TaskContext,
    mapping_paths: &HashMap<i64, String>,
    segment_id: i64,
) -> Result<Vec<u32>> {
    let path = mapping_paths.get(&segment_id).ok_or_else(|| {
        Error::IllegalPlan(format!("segment {segment_id} has no offset mapping file"))
    })?;
    let blobs = ctx.store.download(std::slice::from_ref(path)).await?;
    Ok(CentroidIdMapping::from_bytes(&blobs[0])?.centroid_id_mapping)
}

/// One-pass histogram of the clustering key across all input segments,
/// parallel per segment, merged in arrival order.
async fn analyze_histogram(ctx: &Arc<TaskContext>) -> Result<HashMap<ScalarValue, i64>> {
    let start = Instant::now();
    let mut jobs = FuturesUnordered::new();
    for segment in &ctx.plan.segments {
        let sem = Arc::clone(&ctx.mapping_pool);
        jobs.push(async move {
            let _permit = sem.acquire_owned().await.map_err(|_| Error::Cancelled)?;
            analyze_segment(ctx, segment).await
        });
    }
    let mut histogram: HashMap<ScalarValue, i64> = HashMap::new();
    while let Some(local) = jobs.next().await {
        for (key, count) in local? {
            *histogram.entry(key).or_insert(0) += count;
        }
    }
    rb_log!(
        log::Level::Info,
        "analyze_done",
        "segments={} distinct_keys={} elapsed_ms={}",
        ctx.plan.segments.len(),
        histogram.len(),
        start.elapsed().as_millis()
    );
    Ok(histogram)
}

/// Histogram of one segment. Reads only the primary-key, clustering-key,
/// row-id, and timestamp columns; expired rows are skipped, soft-deleted
/// rows are kept (bucket sizes are advisory).
async fn analyze_segment(
    ctx: &TaskContext,
    segment: &SegmentBinlogs,
) -> Result<HashMap<ScalarValue, i64>> {
    let binlog_count = segment.binlog_count();
    if binlog_count == 0 {
        rb_log!(
            log::Level::Warn,
            "analyze_empty_segment",
            "segment_id={}",
            segment.segment_id
        );
        return Err(Error::IllegalPlan(format!(
            "segment {} has no binlogs",
            segment.segment_id
        )));
    }
    let wanted = [
        ctx.pk_field.field_id,
        ctx.clustering_field.field_id,
        ROW_ID_FIELD_ID,
        TIMESTAMP_FIELD_ID,
    ];

    let mut histogram: HashMap<ScalarValue, i64> = HashMap::new();
    let mut expired: i64 = 0;
    for idx in 0..binlog_count {
        let mut field_ids = Vec::new();
        let mut paths = Vec::new();
        for field in &segment.field_binlogs {
            if !wanted.contains(&field.field_id) {
                continue;
            }
            let binlog = field.binlogs.get(idx).ok_or_else(|| {
                Error::IllegalPlan(format!(
                    "field {} of segment {} has misaligned binlogs",
                    field.field_id, segment.segment_id
                ))
            })?;
            field_ids.push(field.field_id);
            paths.push(binlog.log_path.clone());
        }
        let blobs = ctx.store.download(&paths).await?;

        let mut timestamps = None;
        let mut keys = None;
        for (field_id, blob) in field_ids.iter().zip(&blobs) {
            if *field_id == TIMESTAMP_FIELD_ID {
                timestamps = Some(codec::timestamp_column(codec::decode_column(blob)?)?);
            } else if *field_id == ctx.clustering_field.field_id {
                keys = Some(codec::scalar_column(*field_id, codec::decode_column(blob)?)?);
            }
        }
        let timestamps =
            timestamps.ok_or(Error::Codec(CodecError::MissingColumn(TIMESTAMP_FIELD_ID)))?;
        let keys = keys.ok_or(Error::Codec(CodecError::MissingColumn(
            ctx.clustering_field.field_id,
        )))?;
        if timestamps.len() != keys.len() {
            return Err(Error::Codec(CodecError::ColumnLength {
                field_id: ctx.clustering_field.field_id,
                got: keys.len(),
                expected: timestamps.len(),
            }));
        }

        for (ts, key) in timestamps.iter().zip(keys) {
            if is_expired(ctx.plan.collection_ttl, ctx.current_ts, *ts) {
                expired += 1;
                continue;
            }
            *histogram.entry(key).or_insert(0) += 1;
        }
    }
    rb_log!(
        log::Level::Debug,
        "analyze_segment_done",
        "segment_id={} distinct_keys={} expired={}",
        segment.segment_id,
        histogram.len(),
        expired
    );
    Ok(histogram)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(entries: &[(i64, i64)]) -> HashMap<ScalarValue, i64> {
        entries
            .iter()
            .map(|(k, c)| (ScalarValue::Int64(*k), *c))
            .collect()
    }

    fn flat(buckets: &[Vec<ScalarValue>]) -> Vec<Vec<i64>> {
        buckets
            .iter()
            .map(|b| {
                b.iter()
                    .map(|k| match k {
                        ScalarValue::Int64(v) => *v,
                        other => panic!("unexpected key {other:?}"),
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn oversized_key_becomes_singleton_bucket() {
        // A and B accumulate, C seals a singleton, residual is empty
        let buckets = greedy_bucket_keys(&hist(&[(1, 1000), (2, 1000), (3, 2500)]), 2000, 1500);
        assert_eq!(flat(&buckets), vec![vec![1, 2], vec![3], vec![]]);
    }

    #[test]
    fn crossing_prefer_appends_then_seals() {
        let buckets = greedy_bucket_keys(&hist(&[(1, 900), (2, 700), (3, 100)]), 5000, 1500);
        assert_eq!(flat(&buckets), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn crossing_max_starts_new_bucket_with_key() {
        // 900 + 1400 passes max, so key 2 opens the next bucket alone
        let buckets = greedy_bucket_keys(&hist(&[(1, 900), (2, 1400)]), 2000, 1500);
        assert_eq!(flat(&buckets), vec![vec![1], vec![2]]);
    }

    #[test]
    fn small_keys_accumulate_into_one_bucket() {
        let buckets = greedy_bucket_keys(&hist(&[(1, 10), (2, 10), (3, 10)]), 2000, 1500);
        assert_eq!(flat(&buckets), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn empty_histogram_yields_single_empty_bucket() {
        let buckets = greedy_bucket_keys(&HashMap::new(), 2000, 1500);
        assert_eq!(flat(&buckets), vec![Vec::<i64>::new()]);
    }
}
