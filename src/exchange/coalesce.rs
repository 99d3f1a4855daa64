//! Adaptive coalescing of post-shuffle partitions.
//!
//! Once a shuffle's map stage has finished, its per-partition byte counts are
//! known. Adjacent small reduce partitions are then merged into ranges
//! `[start, end)` read by a single task. When several shuffles feed the same
//! operator (the two sides of a join), they are coalesced with one shared set
//! of ranges so the sides stay co-partitioned.

use super::ShuffleExchangeExec;
use super::shuffle::MapOutputStatistics;
use crate::error::planning_err;
use crate::metrics::{MetricSet, NUM_COALESCED_PARTITIONS, NUM_OUTPUT_ROWS};
use crate::partitioning::Partitioning;
use crate::plan::{ExecNode, MetricsEmitter, PlanRef, RowProducer, downcast, expect_children};
use crate::row::{BoxRowIter, RowFormat};
use crate::task::TaskContext;
use crate::types::Schema;
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// Reduce partitions `[start, end)` read by one post-shuffle task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoalescedPartitionSpec {
    pub start: usize,
    pub end: usize,
    pub data_size: u64,
}

/// Group adjacent reduce partitions so each group is close to the target size.
///
/// The target is `advisory_size`, shrunk when needed so that at least
/// `min_partitions` groups can form, but never below `small_factor *
/// advisory_size`. A group still under that floor keeps absorbing partitions,
/// and a small trailing group is merged into its predecessor. Groups with no
/// data are dropped; at least one group is always returned.
///
/// # Errors
///
/// Returns a planning error if the shuffles disagree on the reduce count.
pub fn coalesce_partitions(
    stats: &[MapOutputStatistics],
    advisory_size: u64,
    min_partitions: usize,
    small_factor: f64,
) -> Result<Vec<CoalescedPartitionSpec>> {
    let Some(first) = stats.first() else {
        return Ok(Vec::new());
    };
    let n = first.bytes_by_partition.len();
    if stats.iter().any(|s| s.bytes_by_partition.len() != n) {
        return planning_err("cannot coalesce shuffles with different partition counts");
    }
    let size_at = |i: usize| -> u64 { stats.iter().map(|s| s.bytes_by_partition[i]).sum() };
    let total: u64 = (0..n).map(size_at).sum();
    let min_size = (advisory_size as f64 * small_factor).ceil() as u64;
    let max_target = total.div_ceil(min_partitions.max(1) as u64);
    let target = advisory_size.min(max_target).max(min_size).max(1);

    let mut specs: Vec<CoalescedPartitionSpec> = Vec::new();
    let mut split = 0usize;
    let mut size = 0u64;
    for i in 0..n {
        let current = size_at(i);
        if i > split && size + current > target && size >= min_size {
            if size > 0 {
                specs.push(CoalescedPartitionSpec {
                    start: split,
                    end: i,
                    data_size: size,
                });
            }
            split = i;
            size = current;
        } else {
            size += current;
        }
    }
    if size > 0 || specs.is_empty() {
        specs.push(CoalescedPartitionSpec {
            start: split,
            end: n,
            data_size: size,
        });
    }
    if specs.len() > 1 {
        let last = specs[specs.len() - 1];
        if last.data_size < min_size {
            specs.pop();
            if let Some(prev) = specs.last_mut() {
                prev.end = last.end;
                prev.data_size += last.data_size;
            }
        }
    }
    debug!(
        input = n,
        output = specs.len(),
        target,
        "coalesced shuffle partitions"
    );
    Ok(specs)
}

/// Reads a shuffle through a list of coalesced reduce ranges.
#[derive(Debug)]
pub struct CoalescedShuffleReadExec {
    child: PlanRef,
    specs: Vec<CoalescedPartitionSpec>,
    metrics: Arc<MetricSet>,
}

impl CoalescedShuffleReadExec {
    /// # Errors
    ///
    /// Returns a planning error unless `child` is a shuffle exchange and the
    /// ranges lie within its reduce partitions.
    pub fn new(child: PlanRef, specs: Vec<CoalescedPartitionSpec>) -> Result<Self> {
        let Some(exchange) = downcast::<ShuffleExchangeExec>(&child) else {
            return planning_err(format!("cannot coalesce the output of {}", child.name()));
        };
        let n = exchange.partitioning().num_partitions();
        if specs.is_empty() || specs.iter().any(|s| s.start >= s.end || s.end > n) {
            return planning_err(format!("invalid coalesced ranges for {n} partitions"));
        }
        let metrics = Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS, NUM_COALESCED_PARTITIONS]));
        metrics.set(NUM_COALESCED_PARTITIONS, specs.len() as u64);
        Ok(Self {
            child,
            specs,
            metrics,
        })
    }

    #[must_use]
    pub fn specs(&self) -> &[CoalescedPartitionSpec] {
        &self.specs
    }
}

impl RowProducer for CoalescedShuffleReadExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let Some(spec) = self.specs.get(partition) else {
            return planning_err(format!("no coalesced partition {partition}"));
        };
        let Some(exchange) = downcast::<ShuffleExchangeExec>(&self.child) else {
            return planning_err("coalesced read lost its exchange");
        };
        exchange.read_partitions(spec.start..spec.end, task)
    }
}

impl MetricsEmitter for CoalescedShuffleReadExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for CoalescedShuffleReadExec {
    fn name(&self) -> &'static str {
        "CoalescedShuffleReadExec"
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
        Ok(Arc::new(Self::new(children.remove(0), self.specs.clone())?))
    }

    /// Merged hash buckets no longer follow `pmod(hash, n)` for the new
    /// count, so only range layouts survive the merge.
    fn output_partitioning(&self) -> Partitioning {
        let n = self.specs.len();
        match self.child.output_partitioning() {
            Partitioning::Range { ordering, .. } => Partitioning::range(ordering, n),
            Partitioning::Single => Partitioning::Single,
            _ => Partitioning::Unknown(n),
        }
    }

    fn output_format(&self) -> RowFormat {
        self.child.output_format()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        format!("CoalescedShuffleReadExec ({} partitions)", self.specs.len())
    }
}
