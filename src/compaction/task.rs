//! Clustering compaction task driver.

use std::{
    collections::HashMap,
    sync::{atomic::AtomicBool, Arc},
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, Semaphore};

use crate::{
    compaction::{
        buffer::ClusterBuffer,
        flush::{flush_all, run_flush_scheduler, FlushSignal},
        mapping::run_mapping,
        planner::{plan_scalar_buckets, plan_vector_buckets, Classifier},
    },
    error::{Error, Result},
    logging::rb_log,
    metrics::CompactionMetrics,
    option::CompactionOptions,
    plan::{
        CompactionPlan, CompactionPlanResult, CompactionTaskState, CompactionType,
    },
    schema::{FieldSchema, START_OF_USER_FIELD_ID},
    stats::PartitionStatsSnapshot,
    store::{partition_stats_path, BlobStore},
    id::IdAllocator,
    timestamp::{current_timestamp, Timestamp},
    tombstone::TombstoneIndex,
    writer::WriterConfig,
};

const LOW_WATERMARK_RATIO: f64 = 0.3;

/// Cooperative cancellation flag shared by the driver, the workers, and
/// the flush scheduler.
#[derive(Clone)]
pub(crate) struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Handle for stopping a running task from outside.
#[derive(Clone)]
pub struct StopHandle {
    token: CancelToken,
}

impl StopHandle {
    /// Cancel the task. Workers return promptly; partial uploads become
    /// orphans for the storage garbage collector.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

/// Immutable, init-derived state shared by every stage of the run.
pub(crate) struct TaskContext {
    pub(crate) store: Arc<dyn BlobStore>,
    pub(crate) allocator: Arc<dyn IdAllocator>,
    pub(crate) plan: CompactionPlan,
    pub(crate) options: CompactionOptions,
    pub(crate) pk_field: FieldSchema,
    pub(crate) clustering_field: FieldSchema,
    pub(crate) current_ts: Timestamp,
    pub(crate) memory_limit: i64,
    pub(crate) writer_cfg: Arc<WriterConfig>,
    pub(crate) mapping_pool: Arc<Semaphore>,
    pub(crate) flush_pool: Arc<Semaphore>,
    pub(crate) metrics: Arc<CompactionMetrics>,
    pub(crate) cancel: CancelToken,
}

impl TaskContext {
    /// Residency floor the spill path drains down to.
    pub(crate) fn low_watermark(&self) -> i64 {
        (self.memory_limit as f64 * LOW_WATERMARK_RATIO) as i64
    }

    /// Residency ceiling that triggers spills and pauses admission.
    pub(crate) fn block_threshold(&self) -> i64 {
        self.memory_limit
    }
}

/// Run-scoped shared state: the planned buffers, the classifier, the
/// frozen tombstone index, and the flush machinery.
pub(crate) struct TaskShared {
    pub(crate) ctx: Arc<TaskContext>,
    pub(crate) buffers: Vec<Arc<ClusterBuffer>>,
    pub(crate) classifier: Classifier,
    pub(crate) tombstones: TombstoneIndex,
    pub(crate) flush_tx: mpsc::Sender<FlushSignal>,
    pub(crate) flush_mutex: AsyncMutex<()>,
    pub(crate) has_signal: AtomicBool,
    first_error: parking_lot::Mutex<Option<Error>>,
}

impl TaskShared {
    /// Total bytes resident across every bucket: open writers plus
    /// snapshots pending upload.
    pub(crate) fn total_buffer_memory(&self) -> i64 {
        self.buffers.iter().map(|b| b.memory_in_use()).sum()
    }

    /// Record the first failure and cancel the task; later failures are
    /// logged by their call sites only.
    pub(crate) fn abort_with(&self, err: Error) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.ctx.cancel.cancel();
    }

    fn take_error(&self) -> Option<Error> {
        self.first_error.lock().take()
    }
}

/// A clustering compaction task: re-buckets rows from sealed input
/// segments by clustering-key proximity and publishes the resulting
/// partition statistics.
pub struct ClusteringCompactionTask {
    store: Arc<dyn BlobStore>,
    allocator: Arc<dyn IdAllocator>,
    plan: CompactionPlan,
    options: CompactionOptions,
    metrics: Arc<CompactionMetrics>,
    cancel: CancelToken,
}

impl ClusteringCompactionTask {
    /// Build a task over injected object storage and id allocation.
    pub fn new(
        store: Arc<dyn BlobStore>,
        allocator: Arc<dyn IdAllocator>,
        plan: CompactionPlan,
    ) -> Self {
        Self {
            store,
            allocator,
            plan,
            options: CompactionOptions::default(),
            metrics: Arc::new(CompactionMetrics::default()),
            cancel: CancelToken::new(),
        }
    }

    /// Replace the default options.
    pub fn with_options(mut self, options: CompactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Counters observable while (and after) the task runs.
    pub fn metrics(&self) -> Arc<CompactionMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Handle for cancelling the task from another thread of execution.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.cancel.clone(),
        }
    }

    /// Run the compaction to completion, honoring the plan's deadline.
    pub async fn compact(self) -> Result<CompactionPlanResult> {
        let timeout_secs = self.plan.timeout_secs;
        if timeout_secs == 0 {
            return self.run().await;
        }
        let cancel = self.cancel.clone();
        match tokio::time::timeout(Duration::from_secs(timeout_secs), self.run()).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(Error::Timeout(timeout_secs))
            }
        }
    }

    async fn run(self) -> Result<CompactionPlanResult> {
        let Self {
            store,
            allocator,
            plan,
            options,
            metrics,
            cancel,
        } = self;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (pk_field, clustering_field) = validate_plan(&plan)?;
        let is_vector = clustering_field.data_type.is_vector();
        let current_ts = current_timestamp();
        let memory_limit = options.memory_budget();
        let pool_size = options.worker_pool_size();
        let flush_channel_capacity = options.flush_channel_capacity.max(1);
        let writer_cfg = Arc::new(WriterConfig {
            schema: Arc::clone(&plan.schema),
            pk_field: pk_field.clone(),
            binlog_max_bytes: options.binlog_max_bytes,
            storage_root: options.storage_root.clone(),
            collection_id: plan.collection_id,
            partition_id: plan.partition_id,
        });
        let ctx = Arc::new(TaskContext {
            store,
            allocator,
            plan,
            options,
            pk_field,
            clustering_field,
            current_ts,
            memory_limit,
            writer_cfg,
            mapping_pool: Arc::new(Semaphore::new(pool_size)),
            flush_pool: Arc::new(Semaphore::new(pool_size)),
            metrics,
            cancel,
        });
        rb_log!(
            log::Level::Info,
            "task_init",
            "plan_id={} vector_mode={} memory_buffer_size={} worker_pool_size={}",
            ctx.plan.plan_id,
            is_vector,
            memory_limit,
            pool_size
        );

        let tombstones = TombstoneIndex::load(ctx.store.as_ref(), &ctx.plan.segments).await?;
        let bucket_plan = if is_vector {
            plan_vector_buckets(&ctx).await?
        } else {
            plan_scalar_buckets(&ctx).await?
        };
        rb_log!(
            log::Level::Info,
            "mapping_start",
            "plan_id={} buffers={} segments={}",
            ctx.plan.plan_id,
            bucket_plan.buffers.len(),
            ctx.plan.segments.len()
        );

        let map_start = Instant::now();
        let (flush_tx, flush_rx) = mpsc::channel(flush_channel_capacity);
        let (done_tx, done_rx) = oneshot::channel();
        let shared = Arc::new(TaskShared {
            ctx: Arc::clone(&ctx),
            buffers: bucket_plan.buffers,
            classifier: bucket_plan.classifier,
            tombstones,
            flush_tx,
            flush_mutex: AsyncMutex::new(()),
            has_signal: AtomicBool::new(false),
            first_error: parking_lot::Mutex::new(None),
        });
        let scheduler = tokio::spawn(run_flush_scheduler(Arc::clone(&shared), flush_rx, done_tx));

        if let Err(err) = run_mapping(&shared).await {
            shared.abort_with(err);
            let _ = scheduler.await;
            return Err(shared.take_error().unwrap_or(Error::Cancelled));
        }

        // wait for the scheduler to acknowledge in-flight flushes
        if shared.flush_tx.send(FlushSignal::Done).await.is_err() || done_rx.await.is_err() {
            let _ = scheduler.await;
            return Err(shared.take_error().unwrap_or(Error::Cancelled));
        }
        let _ = scheduler.await;
        if let Some(err) = shared.take_error() {
            return Err(err);
        }
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        flush_all(&shared).await?;

        let mut segments = Vec::new();
        let mut snapshot = PartitionStatsSnapshot::new(ctx.plan.plan_id);
        for buffer in &shared.buffers {
            let flushed = buffer.flushed().lock().await;
            segments.extend(flushed.uploaded_segments.iter().cloned());
            for (segment_id, stats) in &flushed.uploaded_stats {
                snapshot.segment_stats.insert(*segment_id, stats.clone());
            }
        }
        rb_log!(
            log::Level::Info,
            "mapping_end",
            "plan_id={} segments_in={} segments_out={} elapsed_ms={}",
            ctx.plan.plan_id,
            ctx.plan.segments.len(),
            segments.len(),
            map_start.elapsed().as_millis()
        );

        upload_partition_stats(&ctx, &snapshot).await?;
        rb_log!(
            log::Level::Info,
            "task_finished",
            "plan_id={} flush_count={} written_rows={}",
            ctx.plan.plan_id,
            ctx.metrics.flush_count(),
            ctx.metrics.written_rows()
        );

        Ok(CompactionPlanResult {
            state: CompactionTaskState::Completed,
            plan_id: ctx.plan.plan_id,
            segments,
            task_type: ctx.plan.task_type,
            channel: ctx.plan.channel.clone(),
        })
    }
}

/// Publish the versioned union of output-segment stats for the planner.
async fn upload_partition_stats(
    ctx: &Arc<TaskContext>,
    snapshot: &PartitionStatsSnapshot,
) -> Result<()> {
    let bytes = snapshot.to_bytes()?;
    let path = partition_stats_path(
        &ctx.plan.analyze_result_path,
        ctx.plan.collection_id,
        ctx.plan.partition_id,
        &ctx.plan.channel,
        snapshot.version,
    );
    let length = bytes.len();
    let mut kvs = HashMap::with_capacity(1);
    kvs.insert(path.clone(), bytes);
    ctx.store.upload(kvs).await?;
    rb_log!(
        log::Level::Info,
        "partition_stats_uploaded",
        "key={} bytes={}",
        path,
        length
    );
    Ok(())
}

fn validate_plan(plan: &CompactionPlan) -> Result<(FieldSchema, FieldSchema)> {
    if plan.task_type != CompactionType::Clustering {
        return Err(Error::IllegalPlan(format!(
            "expected a clustering compaction, got {:?}",
            plan.task_type
        )));
    }
    if plan.schema.fields.is_empty() {
        return Err(Error::IllegalPlan("empty schema".to_string()));
    }
    if plan.max_segment_rows <= 0 {
        return Err(Error::IllegalPlan(format!(
            "max_segment_rows must be positive, got {}",
            plan.max_segment_rows
        )));
    }
    if plan.prefer_segment_rows <= 0 || plan.prefer_segment_rows > plan.max_segment_rows {
        return Err(Error::IllegalPlan(format!(
            "prefer_segment_rows {} outside (0, {}]",
            plan.prefer_segment_rows, plan.max_segment_rows
        )));
    }
    if plan.segments.is_empty() {
        return Err(Error::IllegalPlan("no input segments".to_string()));
    }

    let mut pk_fields = plan.schema.fields.iter().filter(|f| {
        f.is_primary_key
            && f.field_id >= START_OF_USER_FIELD_ID
            && f.data_type.is_primary_key_type()
    });
    let pk_field = pk_fields
        .next()
        .ok_or_else(|| Error::IllegalPlan("no usable primary-key field".to_string()))?;
    if pk_fields.next().is_some() {
        return Err(Error::IllegalPlan(
            "more than one primary-key field".to_string(),
        ));
    }

    let clustering_field = plan.schema.field(plan.clustering_key_field).ok_or_else(|| {
        Error::IllegalPlan(format!(
            "clustering key field {} not in schema",
            plan.clustering_key_field
        ))
    })?;

    for segment in &plan.segments {
        for field_binlog in &segment.field_binlogs {
            if plan.schema.field(field_binlog.field_id).is_none() {
                return Err(Error::IllegalPlan(format!(
                    "segment {} references unknown field {}",
                    segment.segment_id, field_binlog.field_id
                )));
            }
        }
    }

    if clustering_field.data_type.is_vector() && plan.analyze_result_path.is_empty() {
        return Err(Error::IllegalPlan(
            "vector clustering key requires an analyze result path".to_string(),
        ));
    }

    Ok((pk_field.clone(), clustering_field.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        plan::{Binlog, FieldBinlog, SegmentBinlogs},
        schema::{CollectionSchema, DataType},
    };

    fn base_plan() -> CompactionPlan {
        let schema = Arc::new(CollectionSchema::with_system_fields(vec![
            FieldSchema::new(100, "pk", DataType::Int64).primary_key(),
            FieldSchema::new(101, "key", DataType::Int64),
        ]));
        CompactionPlan {
            plan_id: 1,
            task_type: CompactionType::Clustering,
            collection_id: 1,
            partition_id: 1,
            channel: "ch-0".to_string(),
            timeout_secs: 0,
            schema,
            clustering_key_field: 101,
            collection_ttl: 0,
            max_segment_rows: 100,
            prefer_segment_rows: 50,
            segments: vec![SegmentBinlogs {
                segment_id: 1,
                field_binlogs: vec![FieldBinlog {
                    field_id: 100,
                    binlogs: vec![Binlog {
                        entries_num: 1,
                        log_size: 1,
                        log_path: "p".to_string(),
                    }],
                }],
                deltalogs: vec![],
            }],
            analyze_result_path: String::new(),
            analyze_segment_ids: vec![],
        }
    }

    #[test]
    fn valid_plan_resolves_key_fields() {
        let (pk, clustering) = validate_plan(&base_plan()).unwrap();
        assert_eq!(pk.field_id, 100);
        assert_eq!(clustering.field_id, 101);
    }

    #[test]
    fn wrong_type_is_rejected() {
        let mut plan = base_plan();
        plan.task_type = CompactionType::Mix;
        assert!(matches!(
            validate_plan(&plan),
            Err(Error::IllegalPlan(_))
        ));
    }

    #[test]
    fn prefer_rows_above_max_is_rejected() {
        let mut plan = base_plan();
        plan.prefer_segment_rows = 200;
        assert!(matches!(validate_plan(&plan), Err(Error::IllegalPlan(_))));
    }

    #[test]
    fn missing_clustering_field_is_rejected() {
        let mut plan = base_plan();
        plan.clustering_key_field = 999;
        assert!(matches!(validate_plan(&plan), Err(Error::IllegalPlan(_))));
    }

    #[test]
    fn low_pk_field_id_is_rejected() {
        let mut plan = base_plan();
        let mut fields = (*plan.schema).clone();
        for field in &mut fields.fields {
            if field.field_id == 100 {
                field.field_id = 50;
            }
        }
        // the binlog descriptor still points at field 100, swap it too
        plan.segments[0].field_binlogs[0].field_id = 50;
        plan.clustering_key_field = 101;
        plan.schema = Arc::new(fields);
        assert!(matches!(validate_plan(&plan), Err(Error::IllegalPlan(_))));
    }

    #[test]
    fn vector_key_requires_analyze_path() {
        let mut plan = base_plan();
        let mut schema = (*plan.schema).clone();
        schema
            .fields
            .push(FieldSchema::new(102, "embedding", DataType::FloatVector));
        plan.schema = Arc::new(schema);
        plan.clustering_key_field = 102;
        assert!(matches!(validate_plan(&plan), Err(Error::IllegalPlan(_))));
    }

    #[test]
    fn unknown_binlog_field_is_rejected() {
        let mut plan = base_plan();
        plan.segments[0].field_binlogs[0].field_id = 404;
        assert!(matches!(validate_plan(&plan), Err(Error::IllegalPlan(_))));
    }
}
