//! Exchanges: the operators that redistribute rows between partitions.
//!
//! A [`ShuffleExchangeExec`] is a stage boundary. Its map side runs one task per
//! child partition, assigning each row a reduce partition and serializing it
//! into the context's [`ShuffleStore`](shuffle::ShuffleStore). Its reduce side
//! is a read view over those outputs, opened per consuming task. The map side
//! runs on demand the first time a reduce partition is requested, or ahead of
//! time when a harness calls [`ShuffleExchangeExec::materialize`].
//!
//! A [`BroadcastExchangeExec`] collects its child once and hands the complete
//! row set to every consumer partition.

pub mod coalesce;
pub mod partitioner;
pub mod reader;
pub mod shuffle;

pub use coalesce::{CoalescedPartitionSpec, CoalescedShuffleReadExec, coalesce_partitions};
pub use partitioner::Partitioner;
pub use reader::ShuffleRead;
pub use shuffle::{
    MapOutput, MapOutputStatistics, RowCodec, ShuffleDependency, ShuffleStore, ShuffleWriterKind,
};

use crate::context::ExecContext;
use crate::error::planning_err;
use crate::expr::{SortOrder, bind_all};
use crate::metrics::{
    BYTES_READ, BYTES_WRITTEN, DATA_SIZE, LOCAL_BLOCKS_FETCHED, MetricSet, NUM_OUTPUT_ROWS,
    RECORDS_READ, RECORDS_WRITTEN, REMOTE_BLOCKS_FETCHED,
};
use crate::partitioning::Partitioning;
use crate::plan::{ExecNode, FormatRequirement, MetricsEmitter, PlanRef, RowProducer, expect_children};
use crate::row::{BoxRowIter, Row, RowFormat, VecRowIter, collect_rows};
use crate::task::TaskContext;
use crate::types::{Schema, Value};
use anyhow::{Context, Result};
use partitioner::sample_range_bounds;
use std::any::Any;
use std::ops::Range;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, info};

#[derive(Debug)]
pub struct ShuffleExchangeExec {
    partitioning: Partitioning,
    child: PlanRef,
    codec: RowCodec,
    shuffle_id: OnceLock<u64>,
    range_bounds: Mutex<Option<Arc<Vec<Vec<Value>>>>>,
    /// Serializes map-stage runs triggered by concurrent reduce tasks.
    materializing: Mutex<()>,
    metrics: Arc<MetricSet>,
}

impl ShuffleExchangeExec {
    /// # Errors
    ///
    /// Returns a planning error if the partitioning cannot be produced by a
    /// shuffle or its keys do not bind to the child schema.
    pub fn new(partitioning: Partitioning, child: PlanRef) -> Result<Self> {
        match &partitioning {
            Partitioning::Hash { exprs, .. } => {
                bind_all(exprs, child.schema())?;
            }
            Partitioning::Range { ordering, .. } => {
                crate::expr::RowOrdering::new(ordering, child.schema())?;
            }
            Partitioning::Single | Partitioning::RoundRobin(_) => {}
            Partitioning::Unknown(_) | Partitioning::Broadcast => {
                return planning_err(format!("a shuffle cannot produce {partitioning}"));
            }
        }
        if partitioning.num_partitions() == 0 {
            return planning_err("a shuffle needs at least one output partition");
        }
        let codec = RowCodec::for_schema(child.schema());
        Ok(Self {
            partitioning,
            child,
            codec,
            shuffle_id: OnceLock::new(),
            range_bounds: Mutex::new(None),
            materializing: Mutex::new(()),
            metrics: Arc::new(MetricSet::new(&[
                RECORDS_WRITTEN,
                BYTES_WRITTEN,
                RECORDS_READ,
                BYTES_READ,
                LOCAL_BLOCKS_FETCHED,
                REMOTE_BLOCKS_FETCHED,
                DATA_SIZE,
            ])),
        })
    }

    #[must_use]
    pub const fn partitioning(&self) -> &Partitioning {
        &self.partitioning
    }

    #[must_use]
    pub fn child(&self) -> &PlanRef {
        &self.child
    }

    /// Same child, different target partitioning.
    ///
    /// # Errors
    ///
    /// See [`ShuffleExchangeExec::new`].
    pub fn with_partitioning(&self, partitioning: Partitioning) -> Result<Self> {
        Self::new(partitioning, Arc::clone(&self.child))
    }

    /// Shuffle id, assigned from the context on first use.
    pub fn shuffle_id(&self, ctx: &ExecContext) -> u64 {
        *self.shuffle_id.get_or_init(|| ctx.next_shuffle_id())
    }

    #[must_use]
    pub fn dependency(&self, ctx: &ExecContext) -> ShuffleDependency {
        ShuffleDependency {
            shuffle_id: self.shuffle_id(ctx),
            num_map_partitions: self.child.num_partitions(),
            num_reduce_partitions: self.partitioning.num_partitions(),
            partitioning: self.partitioning.clone(),
            codec: self.codec.clone(),
        }
    }

    fn bounds(&self, ctx: &Arc<ExecContext>) -> Result<Option<Arc<Vec<Vec<Value>>>>> {
        let Partitioning::Range {
            ordering,
            num_partitions,
        } = &self.partitioning
        else {
            return Ok(None);
        };
        let mut slot = self.range_bounds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bounds) = slot.as_ref() {
            return Ok(Some(Arc::clone(bounds)));
        }
        let bounds = Arc::new(sample_range_bounds(
            &self.child,
            ordering,
            *num_partitions,
            ctx,
        )?);
        *slot = Some(Arc::clone(&bounds));
        Ok(Some(bounds))
    }

    /// Run the map task for one child partition and store its output.
    ///
    /// Re-running a map task over the same input replaces its output with
    /// byte-identical blocks.
    ///
    /// # Errors
    ///
    /// Propagates child failures and encoding errors.
    pub fn run_map_task(&self, task: &TaskContext) -> Result<()> {
        let ctx = task.exec();
        let dep = self.dependency(ctx);
        let shuffle_id = dep.shuffle_id;
        ctx.shuffles().register(dep);
        let map_index = task.partition_id();
        let mut partitioner =
            Partitioner::new(&self.partitioning, self.child.schema(), map_index, self.bounds(ctx)?)?;
        let kind = ShuffleWriterKind::choose(
            partitioner.num_partitions(),
            ctx.config().bypass_merge_threshold,
        );
        let input = self.child.execute_partition(map_index, task)?;
        let output = shuffle::write_map_output(
            input,
            &mut partitioner,
            &self.codec,
            self.child.schema(),
            kind,
            task,
        )
        .with_context(|| format!("shuffle {shuffle_id} map task {map_index}"))?;
        let bytes: u64 = output.block_sizes().iter().sum();
        let records: u64 = output.records().iter().sum();
        self.metrics.add(RECORDS_WRITTEN, records);
        self.metrics.add(BYTES_WRITTEN, bytes);
        self.metrics.add(DATA_SIZE, bytes);
        debug!(shuffle_id, map_index, records, bytes, ?kind, "map task wrote shuffle output");
        ctx.shuffles().put_map_output(shuffle_id, output)
    }

    /// Map partitions whose output is not in the store yet.
    #[must_use]
    pub fn missing_map_tasks(&self, ctx: &ExecContext) -> Vec<usize> {
        let id = self.shuffle_id(ctx);
        if ctx.shuffles().is_registered(id) {
            ctx.shuffles().missing_maps(id)
        } else {
            (0..self.child.num_partitions()).collect()
        }
    }

    /// Run every missing map task in this thread and return the statistics.
    ///
    /// # Errors
    ///
    /// Propagates the first map task failure.
    pub fn materialize(&self, ctx: &Arc<ExecContext>) -> Result<MapOutputStatistics> {
        let _guard = self.materializing.lock().unwrap_or_else(PoisonError::into_inner);
        let missing = self.missing_map_tasks(ctx);
        if !missing.is_empty() {
            let stage = ctx.next_stage_id();
            info!(
                shuffle_id = self.shuffle_id(ctx),
                stage,
                tasks = missing.len(),
                "running shuffle map stage"
            );
            ctx.shuffles().register(self.dependency(ctx));
            for map_index in missing {
                self.run_map_task(&TaskContext::new(Arc::clone(ctx), stage, map_index, 0))?;
            }
        }
        self.map_output_statistics(ctx)
    }

    /// # Errors
    ///
    /// Returns a planning error if the map stage has not completed.
    pub fn map_output_statistics(&self, ctx: &ExecContext) -> Result<MapOutputStatistics> {
        let id = self.shuffle_id(ctx);
        match ctx.shuffles().statistics(id) {
            Some(stats) => Ok(stats),
            None => planning_err(format!("shuffle {id} has not been materialized")),
        }
    }

    /// Concatenated rows of reduce partitions `[start, end)`.
    ///
    /// The map stage runs first unless it has already finished once. Reduce
    /// tasks racing on an unfinished stage wait for whichever of them runs it.
    /// A map output lost after the stage finished is not recomputed here: the
    /// read fails with a fetch failure so the scheduler can rerun the stage.
    ///
    /// # Errors
    ///
    /// Propagates map stage failures and fetch failures.
    pub fn read_partitions(&self, reduces: Range<usize>, task: &TaskContext) -> Result<BoxRowIter> {
        let ctx = task.exec();
        let id = self.shuffle_id(ctx);
        if !ctx.shuffles().has_completed(id) {
            self.materialize(ctx)?;
        }
        let read = ShuffleRead {
            shuffle_id: id,
            num_maps: self.child.num_partitions(),
            reduces,
            codec: self.codec.clone(),
        };
        read.open(task, &self.metrics)
    }
}

impl RowProducer for ShuffleExchangeExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        self.read_partitions(partition..partition + 1, task)
    }
}

impl MetricsEmitter for ShuffleExchangeExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for ShuffleExchangeExec {
    fn name(&self) -> &'static str {
        "ShuffleExchangeExec"
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn children(&self) -> Vec<PlanRef> {
        vec![Arc::clone(&self.child)]
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 1)?;
        let mut children = children;
        Ok(Arc::new(Self::new(
            self.partitioning.clone(),
            children.remove(0),
        )?))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.partitioning.clone()
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        Vec::new()
    }

    fn output_format(&self) -> RowFormat {
        self.codec.format()
    }

    fn required_input_format(&self) -> FormatRequirement {
        FormatRequirement::packed_if_supported(self.schema())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        format!("ShuffleExchangeExec {}", self.partitioning)
    }
}

#[derive(Debug)]
pub struct BroadcastExchangeExec {
    child: PlanRef,
    rows: Mutex<Option<Arc<Vec<Row>>>>,
    metrics: Arc<MetricSet>,
}

impl BroadcastExchangeExec {
    #[must_use]
    pub fn new(child: PlanRef) -> Self {
        Self {
            child,
            rows: Mutex::new(None),
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS, DATA_SIZE])),
        }
    }

    /// Every child row, copied once and shared by all readers.
    ///
    /// # Errors
    ///
    /// Propagates child failures.
    pub fn relation(&self, task: &TaskContext) -> Result<Arc<Vec<Row>>> {
        let mut slot = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rows) = slot.as_ref() {
            return Ok(Arc::clone(rows));
        }
        let mut rows = Vec::new();
        for p in 0..self.child.num_partitions() {
            let sub = TaskContext::new(Arc::clone(task.exec()), task.stage_id(), p, task.attempt());
            rows.extend(collect_rows(self.child.execute_partition(p, &sub)?)?);
        }
        let size: usize = rows.iter().map(|r| r.as_ref().estimated_size()).sum();
        self.metrics.add(NUM_OUTPUT_ROWS, rows.len() as u64);
        self.metrics.add(DATA_SIZE, size as u64);
        debug!(rows = rows.len(), bytes = size, "built broadcast relation");
        let rows = Arc::new(rows);
        *slot = Some(Arc::clone(&rows));
        Ok(rows)
    }
}

impl RowProducer for BroadcastExchangeExec {
    fn execute_partition(&self, _partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        Ok(Box::new(VecRowIter::shared(self.relation(task)?)))
    }
}

impl MetricsEmitter for BroadcastExchangeExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for BroadcastExchangeExec {
    fn name(&self) -> &'static str {
        "BroadcastExchangeExec"
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn children(&self) -> Vec<PlanRef> {
        vec![Arc::clone(&self.child)]
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 1)?;
        let mut children = children;
        Ok(Arc::new(Self::new(children.remove(0))))
    }

    fn output_partitioning(&self) -> Partitioning {
        Partitioning::Broadcast
    }

    fn output_format(&self) -> RowFormat {
        self.child.output_format()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
