//! Mapping workers: read input segments, filter, classify, and append.

use std::{sync::Arc, time::Instant};

use futures::stream::{FuturesUnordered, StreamExt};

use crate::{
    codec,
    compaction::{
        flush::FlushSignal,
        planner::{load_centroid_mapping, Classifier},
        task::TaskShared,
    },
    error::{Error, Result},
    logging::rb_log,
    plan::SegmentBinlogs,
    timestamp::is_expired,
    value::{FieldValue, Row},
};

/// Interval, in surviving rows per worker, between flush-trigger and
/// backpressure checks.
const FLUSH_CHECK_INTERVAL: i64 = 100;

/// Run one mapping job per input segment, bounded by the mapping pool.
/// The first failing job aborts the rest.
pub(crate) async fn run_mapping(shared: &Arc<TaskShared>) -> Result<()> {
    let mut jobs = FuturesUnordered::new();
    for segment in &shared.ctx.plan.segments {
        let sem = Arc::clone(&shared.ctx.mapping_pool);
        jobs.push(async move {
            let _permit = sem.acquire_owned().await.map_err(|_| Error::Cancelled)?;
            mapping_segment(shared, segment).await
        });
    }
    while let Some(result) = jobs.next().await {
        result?;
    }
    Ok(())
}

/// Re-bucket every surviving row of one input segment.
async fn mapping_segment(shared: &Arc<TaskShared>, segment: &SegmentBinlogs) -> Result<()> {
    let ctx = &shared.ctx;
    let start = Instant::now();
    rb_log!(
        log::Level::Info,
        "mapping_segment_start",
        "plan_id={} segment_id={}",
        ctx.plan.plan_id,
        segment.segment_id
    );

    let centroid_mapping = match &shared.classifier {
        Classifier::Vector { mapping_paths } => {
            Some(load_centroid_mapping(ctx, mapping_paths, segment.segment_id).await?)
        }
        Classifier::Scalar { .. } => None,
    };

    let binlog_count = segment.binlog_count();
    if binlog_count == 0 {
        rb_log!(
            log::Level::Warn,
            "mapping_empty_segment",
            "segment_id={}",
            segment.segment_id
        );
        return Err(Error::IllegalPlan(format!(
            "segment {} has no binlogs",
            segment.segment_id
        )));
    }

    let mut remained: i64 = 0;
    let mut deleted: i64 = 0;
    let mut expired: i64 = 0;
    // row offset is segment-global so it can index the centroid mapping
    let mut offset: i64 = -1;
    for idx in 0..binlog_count {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut field_ids = Vec::with_capacity(segment.field_binlogs.len());
        let mut paths = Vec::with_capacity(segment.field_binlogs.len());
        for field in &segment.field_binlogs {
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
        let columns = field_ids
            .into_iter()
            .zip(blobs)
            .map(|(field_id, blob)| Ok((field_id, codec::decode_column(&blob)?)))
            .collect::<Result<Vec<_>>>()?;
        let rows = codec::decode_rows(ctx.pk_field.field_id, columns)?;

        for row in rows {
            offset += 1;
            if shared.tombstones.is_deleted(&row.pk, row.timestamp) {
                deleted += 1;
                continue;
            }
            if is_expired(ctx.plan.collection_ttl, ctx.current_ts, row.timestamp) {
                expired += 1;
                continue;
            }
            let bucket = classify(shared, &row, offset, centroid_mapping.as_deref())?;
            let retired = shared.buffers[bucket].write_routed(
                row,
                ctx.allocator.as_ref(),
                &ctx.writer_cfg,
                ctx.plan.max_segment_rows,
            )?;
            if let Some(writer) = retired {
                rb_log!(
                    log::Level::Debug,
                    "segment_cap_rotate",
                    "bucket={} segment_id={} rows={}",
                    bucket,
                    writer.segment_id(),
                    writer.row_num()
                );
                send_flush(shared, FlushSignal::Buffer {
                    bucket,
                    writer,
                    pack: true,
                })
                .await?;
            }
            ctx.metrics.record_written();
            remained += 1;

            if remained % FLUSH_CHECK_INTERVAL == 0 {
                check_flush_and_backpressure(shared, bucket).await?;
            }
        }
    }

    ctx.metrics.record_deleted(deleted);
    ctx.metrics.record_expired(expired);
    rb_log!(
        log::Level::Info,
        "mapping_segment_end",
        "segment_id={} remained={} deleted={} expired={} elapsed_ms={}",
        segment.segment_id,
        remained,
        deleted,
        expired,
        start.elapsed().as_millis()
    );
    Ok(())
}

fn classify(
    shared: &TaskShared,
    row: &Row,
    offset: i64,
    centroid_mapping: Option<&[u32]>,
) -> Result<usize> {
    match &shared.classifier {
        Classifier::Scalar { membership } => {
            let key = row
                .fields
                .get(&shared.ctx.clustering_field.field_id)
                .and_then(FieldValue::as_scalar)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "row lacks a scalar clustering key for field {}",
                        shared.ctx.clustering_field.field_id
                    ))
                })?;
            // the histogram saw every unexpired key, so a miss is corruption
            membership.get(key).copied().ok_or_else(|| {
                Error::Internal(format!("clustering key {key:?} outside every planned bucket"))
            })
        }
        Classifier::Vector { .. } => {
            let mapping = centroid_mapping
                .ok_or_else(|| Error::Internal("centroid mapping not loaded".to_string()))?;
            let centroid = mapping.get(offset as usize).copied().ok_or_else(|| {
                Error::Internal(format!("row offset {offset} outside centroid mapping"))
            })?;
            let bucket = centroid as usize;
            if bucket >= shared.buffers.len() {
                return Err(Error::Internal(format!(
                    "centroid {centroid} outside bucket range"
                )));
            }
            Ok(bucket)
        }
    }
}

/// The per-interval trigger policy: rotate a full writer, nudge the
/// scheduler when residency passes the block threshold, then pause while
/// it stays above it.
async fn check_flush_and_backpressure(shared: &Arc<TaskShared>, bucket: usize) -> Result<()> {
    let ctx = &shared.ctx;
    let total = shared.total_buffer_memory();
    ctx.metrics.observe_buffer_memory(total);

    let buffer = &shared.buffers[bucket];
    if buffer.writer_is_full() {
        let (pack, retired) = buffer.refresh_writer(
            ctx.allocator.as_ref(),
            &ctx.writer_cfg,
            ctx.plan.max_segment_rows,
        )?;
        if let Some(writer) = retired {
            rb_log!(
                log::Level::Debug,
                "full_writer_rotate",
                "bucket={} segment_id={} pack={} rows={}",
                bucket,
                writer.segment_id(),
                pack,
                writer.row_num()
            );
            send_flush(shared, FlushSignal::Buffer {
                bucket,
                writer,
                pack,
            })
            .await?;
        }
    } else if total > ctx.block_threshold()
        && !shared.has_signal.load(std::sync::atomic::Ordering::Acquire)
    {
        rb_log!(
            log::Level::Debug,
            "spill_signal",
            "total_buffer_memory={}",
            total
        );
        send_flush(shared, FlushSignal::Spill).await?;
        shared
            .has_signal
            .store(true, std::sync::atomic::Ordering::Release);
    }

    if shared.total_buffer_memory() > ctx.block_threshold() {
        rb_log!(
            log::Level::Debug,
            "backpressure_pause",
            "total_buffer_memory={}",
            shared.total_buffer_memory()
        );
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if shared.total_buffer_memory() < ctx.block_threshold() {
                break;
            }
            tokio::time::sleep(ctx.options.backpressure_poll).await;
        }
        rb_log!(
            log::Level::Debug,
            "backpressure_resume",
            "total_buffer_memory={}",
            shared.total_buffer_memory()
        );
    }
    Ok(())
}

async fn send_flush(shared: &TaskShared, signal: FlushSignal) -> Result<()> {
    if shared.flush_tx.send(signal).await.is_err() {
        return Err(if shared.ctx.cancel.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Internal("flush scheduler stopped".to_string())
        });
    }
    Ok(())
}
