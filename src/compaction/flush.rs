//! Flush scheduling and the segment-sealing protocol.
//!
//! One consumer task drains the signal channel. Specific-buffer signals
//! carry a retired writer snapshot and are flushed in order; a spill
//! signal drains the largest buffers until residency falls under the low
//! watermark; the done signal publishes completion. The final drain
//! (`flush_all`) is driven by the task itself after mapping finishes.

use std::{collections::hash_map::Entry, collections::HashMap, sync::Arc, time::Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::{
    compaction::{
        buffer::{ClusterBuffer, FlushedState},
        task::{TaskContext, TaskShared},
    },
    error::{Error, Result},
    logging::rb_log,
    plan::{CompactionSegment, FieldBinlog},
    stats::{FieldStats, PrimaryKeyStats, SegmentStats},
    store::stats_log_path,
    writer::SegmentWriter,
};

/// One message on the flush channel.
pub(crate) enum FlushSignal {
    /// Drain this retired writer of one buffer, sealing its segment when
    /// `pack` is set.
    Buffer {
        bucket: usize,
        writer: SegmentWriter,
        pack: bool,
    },
    /// Drain the largest buffers until residency falls below the low
    /// watermark.
    Spill,
    /// Mapping finished; publish completion and stop consuming.
    Done,
}

/// The single flush-scheduler consumer. Runs until the done signal, task
/// cancellation, or a flush failure (which aborts the whole task).
pub(crate) async fn run_flush_scheduler(
    shared: Arc<TaskShared>,
    mut rx: mpsc::Receiver<FlushSignal>,
    done_tx: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = shared.ctx.cancel.cancelled() => {
                rb_log!(log::Level::Info, "flush_scheduler_cancelled", "plan_id={}", shared.ctx.plan.plan_id);
                return;
            }
            signal = rx.recv() => {
                let Some(signal) = signal else { return };
                match signal {
                    FlushSignal::Done => {
                        let _ = done_tx.send(());
                        rb_log!(log::Level::Info, "flush_scheduler_done", "plan_id={}", shared.ctx.plan.plan_id);
                        return;
                    }
                    FlushSignal::Spill => {
                        let result = flush_largest_buffers(&shared).await;
                        shared.has_signal.store(false, std::sync::atomic::Ordering::Release);
                        if let Err(err) = result {
                            rb_log!(log::Level::Warn, "flush_failed", "error={err}");
                            shared.abort_with(err);
                            return;
                        }
                    }
                    FlushSignal::Buffer { bucket, writer, pack } => {
                        let result = flush_one(&shared, bucket, writer, pack).await;
                        if let Err(err) = result {
                            rb_log!(log::Level::Warn, "flush_failed", "error={err}");
                            shared.abort_with(err);
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn flush_one(
    shared: &Arc<TaskShared>,
    bucket: usize,
    writer: SegmentWriter,
    pack: bool,
) -> Result<()> {
    let _permit = shared
        .ctx
        .flush_pool
        .acquire()
        .await
        .map_err(|_| Error::Cancelled)?;
    flush_binlog(shared, &shared.buffers[bucket], writer, pack).await
}

/// Drain buffers largest-first until projected residency falls under the
/// low watermark. A no-op when the final drain already holds the flush
/// mutex.
pub(crate) async fn flush_largest_buffers(shared: &Arc<TaskShared>) -> Result<()> {
    let Ok(_guard) = shared.flush_mutex.try_lock() else {
        return Ok(());
    };
    let mut projected = shared.total_buffer_memory();
    let low = shared.ctx.low_watermark();
    if projected <= low {
        return Ok(());
    }
    let mut order: Vec<(usize, i64)> = shared
        .buffers
        .iter()
        .map(|b| (b.id(), b.writer_row_num()))
        .collect();
    order.sort_by(|a, b| b.1.cmp(&a.1));
    rb_log!(
        log::Level::Info,
        "spill_start",
        "total_buffer_memory={} buffers={}",
        projected,
        order.len()
    );

    let mut jobs = FuturesUnordered::new();
    for (bucket, _) in order {
        let buffer = Arc::clone(&shared.buffers[bucket]);
        let (pack, retired) = buffer.refresh_writer(
            shared.ctx.allocator.as_ref(),
            &shared.ctx.writer_cfg,
            shared.ctx.plan.max_segment_rows,
        )?;
        if let Some(writer) = retired {
            projected -= writer.written_memory_size();
            let sem = Arc::clone(&shared.ctx.flush_pool);
            let shared = Arc::clone(shared);
            jobs.push(async move {
                let _permit = sem.acquire_owned().await.map_err(|_| Error::Cancelled)?;
                flush_binlog(&shared, &buffer, writer, pack).await
            });
        }
        if projected <= low {
            break;
        }
    }
    while let Some(result) = jobs.next().await {
        result?;
    }
    rb_log!(
        log::Level::Info,
        "spill_end",
        "total_buffer_memory={}",
        shared.total_buffer_memory()
    );
    Ok(())
}

/// Final drain: seal every buffer's open segment. Blocks until any
/// in-flight spill completes.
pub(crate) async fn flush_all(shared: &Arc<TaskShared>) -> Result<()> {
    let _guard = shared.flush_mutex.lock().await;
    let mut jobs = FuturesUnordered::new();
    for buffer in &shared.buffers {
        let buffer = Arc::clone(buffer);
        let sem = Arc::clone(&shared.ctx.flush_pool);
        let shared = Arc::clone(shared);
        jobs.push(async move {
            let _permit = sem.acquire_owned().await.map_err(|_| Error::Cancelled)?;
            match buffer.take_writer() {
                Some(writer) => flush_binlog(&shared, &buffer, writer, true).await,
                None => Ok(()),
            }
        });
    }
    while let Some(result) = jobs.next().await {
        result?;
    }
    Ok(())
}

/// Serialize and upload one retired writer, appending its binlogs to the
/// buffer's open segment; seal the segment when `pack` is set.
pub(crate) async fn flush_binlog(
    shared: &Arc<TaskShared>,
    buffer: &ClusterBuffer,
    writer: SegmentWriter,
    pack: bool,
) -> Result<()> {
    let ctx = &shared.ctx;
    let mut flushed = buffer.flushed().lock().await;
    let written_bytes = writer.written_memory_size();
    let row_num = writer.row_num();
    rb_log!(
        log::Level::Debug,
        "flush_start",
        "bucket={} segment_id={} pack={} rows={} bytes={}",
        buffer.id(),
        writer.segment_id(),
        pack,
        row_num,
        written_bytes
    );

    if row_num == 0 {
        if pack {
            return pack_buffer_to_segment(ctx, buffer, &mut flushed, writer.segment_id()).await;
        }
        return Ok(());
    }

    let start = Instant::now();
    let (kvs, field_binlogs) = writer.serialize_write(ctx.allocator.as_ref())?;
    ctx.store.upload(kvs).await?;

    for (field_id, binlog) in field_binlogs {
        match flushed.binlogs.entry(field_id) {
            Entry::Occupied(mut existing) => existing.get_mut().binlogs.extend(binlog.binlogs),
            Entry::Vacant(slot) => {
                slot.insert(binlog);
            }
        }
    }
    flushed.pk_stats.merge(writer.pk_stats());
    buffer.add_flushed_rows(row_num);
    buffer.sub_pending_bytes(written_bytes);
    ctx.metrics.record_flush();

    if pack {
        pack_buffer_to_segment(ctx, buffer, &mut flushed, writer.segment_id()).await?;
    }
    rb_log!(
        log::Level::Debug,
        "flush_end",
        "bucket={} segment_id={} flush_count={} elapsed_ms={}",
        buffer.id(),
        writer.segment_id(),
        ctx.metrics.flush_count(),
        start.elapsed().as_millis()
    );
    Ok(())
}

/// Assemble the buffer's accumulated binlogs into a sealed output segment.
/// A no-op when nothing was flushed, so sealing an untouched buffer emits
/// no segment.
async fn pack_buffer_to_segment(
    ctx: &Arc<TaskContext>,
    buffer: &ClusterBuffer,
    flushed: &mut FlushedState,
    segment_id: i64,
) -> Result<()> {
    if flushed.binlogs.is_empty() {
        return Ok(());
    }
    let num_rows = buffer.flushed_rows();
    let insert_logs: Vec<FieldBinlog> = flushed.binlogs.values().cloned().collect();
    let stats_log = write_stats_log(ctx, segment_id, &flushed.pk_stats, num_rows).await?;

    let segment = CompactionSegment {
        plan_id: ctx.plan.plan_id,
        segment_id,
        num_rows,
        insert_logs,
        stats_logs: vec![stats_log],
        channel: ctx.plan.channel.clone(),
    };
    rb_log!(
        log::Level::Debug,
        "segment_sealed",
        "bucket={} segment_id={} rows={}",
        buffer.id(),
        segment_id,
        num_rows
    );
    flushed.uploaded_stats.insert(
        segment_id,
        SegmentStats {
            field_stats: vec![buffer.clustering_key_stats().clone()],
            num_rows,
        },
    );
    flushed.uploaded_segments.push(segment);
    flushed.binlogs.clear();
    flushed.pk_stats = FieldStats::new(ctx.pk_field.field_id, ctx.pk_field.data_type);
    buffer.reset_flushed_rows();
    Ok(())
}

/// Serialize and upload the primary-key stats of one sealed segment.
async fn write_stats_log(
    ctx: &Arc<TaskContext>,
    segment_id: i64,
    pk_stats: &FieldStats,
    num_rows: i64,
) -> Result<FieldBinlog> {
    let log_id = ctx.allocator.alloc_one()?;
    let payload = PrimaryKeyStats {
        field_id: ctx.pk_field.field_id,
        data_type: ctx.pk_field.data_type,
        min: pk_stats.min.clone(),
        max: pk_stats.max.clone(),
        row_count: num_rows,
    }
    .to_bytes()?;
    let path = stats_log_path(
        &ctx.options.storage_root,
        ctx.plan.collection_id,
        ctx.plan.partition_id,
        segment_id,
        ctx.pk_field.field_id,
        log_id,
    );
    let mut kvs = HashMap::with_capacity(1);
    kvs.insert(path.clone(), payload.clone());
    ctx.store.upload(kvs).await?;
    Ok(FieldBinlog {
        field_id: ctx.pk_field.field_id,
        binlogs: vec![crate::plan::Binlog {
            entries_num: num_rows,
            log_size: payload.len() as i64,
            log_path: path,
        }],
    })
}
