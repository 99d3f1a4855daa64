//! The limit family.
//!
//! Every operator here emits at most `limit` rows, and exactly
//! `min(limit, input rows)` when it is the last limit applied.
//!
//! - [`LocalLimitExec`]: first `n` rows of each partition, no coordination.
//! - [`GlobalLimitExec`]: exactly `n` rows overall. Either the child is shuffled
//!   into one partition, or (parallel mode) a counting pre-pass decides how many
//!   rows each partition drops ([`compute_drops`]) or keeps ([`compute_takes`]).
//! - [`CollectLimitExec`]: local limit, then funnel everything into one
//!   partition and limit again; also offers an incremental driver-side collect.
//! - [`TakeOrderedAndProjectExec`]: bounded per-partition top-K, merged into one
//!   partition, then projected.

use crate::context::ExecContext;
use crate::expr::{Expr, RowOrdering, SortOrder, bind_all, eval_all};
use crate::metrics::{MetricSet, NUM_OUTPUT_ROWS};
use crate::partitioning::{Distribution, Partitioning};
use crate::plan::{
    Compilable, ExecNode, MetricsEmitter, PlanRef, RowProducer, RowStep, StepOutcome,
    expect_children,
};
use crate::row::{
    BoxRowIter, ChainRowIter, EmptyRowIter, GenericRow, IterOpener, Row, RowFormat, RowIter,
    RowRef, VecRowIter, count_rows,
};
use crate::task::TaskContext;
use crate::types::{Field, Schema, Value};
use anyhow::Result;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Passes through at most `remaining` rows.
struct LimitIter {
    input: BoxRowIter,
    remaining: u64,
    metrics: Option<Arc<MetricSet>>,
}

impl LimitIter {
    fn boxed(input: BoxRowIter, limit: u64, metrics: Option<Arc<MetricSet>>) -> BoxRowIter {
        Box::new(Self {
            input,
            remaining: limit,
            metrics,
        })
    }
}

impl RowIter for LimitIter {
    fn advance(&mut self) -> Result<bool> {
        if self.remaining == 0 {
            return Ok(false);
        }
        if !self.input.advance()? {
            self.remaining = 0;
            return Ok(false);
        }
        self.remaining -= 1;
        if let Some(m) = &self.metrics {
            m.add(NUM_OUTPUT_ROWS, 1);
        }
        Ok(true)
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.input.current()
    }
}

/// Rows each partition must drop so the total is exactly `limit`.
///
/// The excess `sum - limit` is spread evenly over partitions that still have
/// rows. A partition with fewer rows than its share gives up all of them and
/// the remainder is spread again in the next round; when the share rounds down
/// to zero the leftover excess is taken one row at a time from the first
/// partitions with rows left. No partition ever drops more rows than it has.
#[must_use]
pub fn compute_drops(counts: &[u64], limit: u64) -> Vec<u64> {
    let mut drops = vec![0u64; counts.len()];
    let total: u64 = counts.iter().sum();
    if total <= limit {
        return drops;
    }
    let mut excess = total - limit;
    while excess > 0 {
        let open: Vec<usize> = (0..counts.len())
            .filter(|&i| counts[i] > drops[i])
            .collect();
        if open.is_empty() {
            break;
        }
        let share = excess / open.len() as u64;
        if share == 0 {
            for &i in &open {
                if excess == 0 {
                    break;
                }
                drops[i] += 1;
                excess -= 1;
            }
        } else {
            for &i in &open {
                let take = share.min(counts[i] - drops[i]);
                drops[i] += take;
                excess -= take;
            }
        }
    }
    drops
}

/// Rows each partition keeps, filling the limit in partition order.
#[must_use]
pub fn compute_takes(counts: &[u64], limit: u64) -> Vec<u64> {
    let mut remaining = limit;
    counts
        .iter()
        .map(|&c| {
            let take = c.min(remaining);
            remaining -= take;
            take
        })
        .collect()
}

#[derive(Debug)]
pub struct LocalLimitExec {
    limit: u64,
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl LocalLimitExec {
    #[must_use]
    pub fn new(limit: u64, child: PlanRef) -> Self {
        Self {
            limit,
            child,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        }
    }

    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }
}

impl RowProducer for LocalLimitExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let input = self.child.execute_partition(partition, task)?;
        Ok(LimitIter::boxed(
            input,
            self.limit,
            Some(Arc::clone(&self.metrics)),
        ))
    }
}

impl MetricsEmitter for LocalLimitExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl Compilable for LocalLimitExec {
    fn compile_step(&self) -> Result<RowStep> {
        let mut remaining = self.limit;
        let metrics = Arc::clone(&self.metrics);
        Ok(Box::new(move |_row: RowRef<'_>| {
            if remaining == 0 {
                return Ok(StepOutcome::Stop);
            }
            remaining -= 1;
            metrics.add(NUM_OUTPUT_ROWS, 1);
            Ok(StepOutcome::Keep)
        }))
    }
}

impl ExecNode for LocalLimitExec {
    fn name(&self) -> &'static str {
        "LocalLimitExec"
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
        Ok(Arc::new(Self::new(self.limit, children.remove(0))))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.child.output_partitioning()
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.child.output_ordering()
    }

    fn output_format(&self) -> RowFormat {
        self.child.output_format()
    }

    fn as_compilable(&self) -> Option<&dyn Compilable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        format!("LocalLimitExec {}", self.limit)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalLimitMode {
    /// The child is shuffled into one partition, which takes the first rows.
    SinglePartition,
    /// Partitions stay in place; each drops its share of the excess.
    Parallel,
    /// Partitions stay in place; earlier partitions keep rows first.
    ParallelKeepFirst,
}

#[derive(Debug)]
pub struct GlobalLimitExec {
    limit: u64,
    mode: GlobalLimitMode,
    child: PlanRef,
    counts: Mutex<Option<Arc<Vec<u64>>>>,
    metrics: Arc<MetricSet>,
}

impl GlobalLimitExec {
    #[must_use]
    pub fn new(limit: u64, child: PlanRef) -> Self {
        Self::with_mode(limit, GlobalLimitMode::SinglePartition, child)
    }

    #[must_use]
    pub fn with_mode(limit: u64, mode: GlobalLimitMode, child: PlanRef) -> Self {
        Self {
            limit,
            mode,
            child,
            counts: Mutex::new(None),
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        }
    }

    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.limit
    }

    #[must_use]
    pub const fn mode(&self) -> GlobalLimitMode {
        self.mode
    }

    /// Row count of every child partition, gathered once by draining each
    /// partition without retaining rows.
    ///
    /// # Errors
    ///
    /// Propagates child failures.
    pub fn partition_counts(&self, task: &TaskContext) -> Result<Arc<Vec<u64>>> {
        let mut slot = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(counts) = slot.as_ref() {
            return Ok(Arc::clone(counts));
        }
        let n = self.child.num_partitions();
        let mut counts = Vec::with_capacity(n);
        for p in 0..n {
            let sub = TaskContext::new(Arc::clone(task.exec()), task.stage_id(), p, task.attempt());
            counts.push(count_rows(self.child.execute_partition(p, &sub)?)?);
        }
        debug!(limit = self.limit, ?counts, "gathered partition counts for global limit");
        let counts = Arc::new(counts);
        *slot = Some(Arc::clone(&counts));
        Ok(counts)
    }

    fn partition_quota(&self, partition: usize, task: &TaskContext) -> Result<u64> {
        match self.mode {
            GlobalLimitMode::SinglePartition => Ok(self.limit),
            GlobalLimitMode::Parallel => {
                let counts = self.partition_counts(task)?;
                let drops = compute_drops(&counts, self.limit);
                Ok(counts.get(partition).copied().unwrap_or(0) - drops.get(partition).copied().unwrap_or(0))
            }
            GlobalLimitMode::ParallelKeepFirst => {
                let counts = self.partition_counts(task)?;
                Ok(compute_takes(&counts, self.limit)
                    .get(partition)
                    .copied()
                    .unwrap_or(0))
            }
        }
    }
}

impl RowProducer for GlobalLimitExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let quota = self.partition_quota(partition, task)?;
        if quota == 0 {
            return Ok(Box::new(EmptyRowIter));
        }
        let input = self.child.execute_partition(partition, task)?;
        Ok(LimitIter::boxed(input, quota, Some(Arc::clone(&self.metrics))))
    }
}

impl MetricsEmitter for GlobalLimitExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for GlobalLimitExec {
    fn name(&self) -> &'static str {
        "GlobalLimitExec"
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
        Ok(Arc::new(Self::with_mode(
            self.limit,
            self.mode,
            children.remove(0),
        )))
    }

    fn output_partitioning(&self) -> Partitioning {
        match self.mode {
            GlobalLimitMode::SinglePartition => Partitioning::Single,
            _ => match self.child.output_partitioning() {
                Partitioning::Single => Partitioning::Single,
                other => Partitioning::Unknown(other.num_partitions()),
            },
        }
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.child.output_ordering()
    }

    fn required_child_distribution(&self) -> Vec<Distribution> {
        match self.mode {
            GlobalLimitMode::SinglePartition => vec![Distribution::AllTuples],
            _ => vec![Distribution::Unspecified],
        }
    }

    fn output_format(&self) -> RowFormat {
        self.child.output_format()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        format!("GlobalLimitExec {} ({:?})", self.limit, self.mode)
    }
}

#[derive(Debug)]
pub struct CollectLimitExec {
    limit: u64,
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl CollectLimitExec {
    #[must_use]
    pub fn new(limit: u64, child: PlanRef) -> Self {
        Self {
            limit,
            child,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        }
    }

    /// Collect up to `limit` rows on the driver, scanning child partitions in
    /// growing batches and stopping as soon as enough rows were found.
    ///
    /// The first round scans one partition. After a round that found nothing
    /// the batch grows by `limit_scale_up_factor`; otherwise the number of
    /// partitions still needed is estimated from the rows seen so far, with
    /// 50% head-room, capped by the same factor.
    ///
    /// # Errors
    ///
    /// Propagates child failures.
    pub fn execute_collect(&self, exec: &Arc<ExecContext>) -> Result<Vec<GenericRow>> {
        let total_parts = self.child.num_partitions();
        let scale_up = exec.config().limit_scale_up_factor.max(2);
        let schema = self.child.schema();
        let mut out: Vec<GenericRow> = Vec::new();
        let limit = usize::try_from(self.limit).unwrap_or(usize::MAX);
        let mut scanned = 0usize;
        let stage = exec.next_stage_id();
        while out.len() < limit && scanned < total_parts {
            let mut to_try = 1usize;
            if scanned > 0 {
                let limit_scaled_up = scanned.saturating_mul(scale_up);
                to_try = if out.is_empty() {
                    limit_scaled_up
                } else {
                    let estimate = (1.5 * limit as f64 * scanned as f64 / out.len() as f64) as usize;
                    estimate.saturating_sub(scanned).max(1).min(limit_scaled_up)
                };
            }
            let end = (scanned + to_try).min(total_parts);
            debug!(from = scanned, to = end, found = out.len(), "collect-limit round");
            for p in scanned..end {
                let task = TaskContext::new(Arc::clone(exec), stage, p, 0);
                let mut it = self.child.execute_partition(p, &task)?;
                while out.len() < limit {
                    let Some(row) = it.next_row()? else {
                        break;
                    };
                    out.push(row.to_generic(schema)?);
                }
                if out.len() >= limit {
                    break;
                }
            }
            scanned = end;
        }
        self.metrics.add(NUM_OUTPUT_ROWS, out.len() as u64);
        Ok(out)
    }
}

impl RowProducer for CollectLimitExec {
    fn execute_partition(&self, _partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let limit = self.limit;
        let openers: Vec<IterOpener> = (0..self.child.num_partitions())
            .map(|p| {
                let child = Arc::clone(&self.child);
                let sub = TaskContext::new(Arc::clone(task.exec()), task.stage_id(), p, task.attempt());
                let open: IterOpener = Box::new(move || {
                    sub.check_interrupted()?;
                    Ok(LimitIter::boxed(child.execute_partition(p, &sub)?, limit, None))
                });
                open
            })
            .collect();
        Ok(LimitIter::boxed(
            Box::new(ChainRowIter::new(openers)),
            limit,
            Some(Arc::clone(&self.metrics)),
        ))
    }
}

impl MetricsEmitter for CollectLimitExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for CollectLimitExec {
    fn name(&self) -> &'static str {
        "CollectLimitExec"
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
        Ok(Arc::new(Self::new(self.limit, children.remove(0))))
    }

    fn output_partitioning(&self) -> Partitioning {
        Partitioning::Single
    }

    fn output_format(&self) -> RowFormat {
        self.child.output_format()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        format!("CollectLimitExec {}", self.limit)
    }
}

/// A retained candidate row for top-K selection.
struct Candidate {
    key: Vec<Value>,
    seq: u64,
    row: Row,
    ordering: Arc<RowOrdering>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Later arrivals rank after earlier ones with an equal key, so they are
    // evicted first and the selection is stable.
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering
            .compare(&self.key, &other.key)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Keeps the `k` smallest candidates under the ordering. The heap's top is the
/// current worst candidate and is evicted when a better one arrives.
struct BoundedTopK {
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl BoundedTopK {
    const fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::new(),
        }
    }

    fn offer(&mut self, candidate: Candidate) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    fn into_sorted(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}

#[derive(Debug)]
pub struct TakeOrderedAndProjectExec {
    limit: u64,
    ordering: Vec<SortOrder>,
    projection: Option<Vec<Expr>>,
    schema: Schema,
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl TakeOrderedAndProjectExec {
    /// # Errors
    ///
    /// Returns a planning error if a sort key or projection does not bind.
    pub fn new(
        limit: u64,
        ordering: Vec<SortOrder>,
        projection: Option<Vec<Expr>>,
        child: PlanRef,
    ) -> Result<Self> {
        let input = child.schema();
        RowOrdering::new(&ordering, input)?;
        let schema = match &projection {
            Some(exprs) => Schema::new(
                exprs
                    .iter()
                    .map(|e| Ok(Field::new(e.output_name(), e.data_type(input)?, true)))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => input.clone(),
        };
        Ok(Self {
            limit,
            ordering,
            projection,
            schema,
            child,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        })
    }

    fn top_k_of_partition(
        &self,
        partition: usize,
        task: &TaskContext,
        ordering: &Arc<RowOrdering>,
        seq: &mut u64,
    ) -> Result<Vec<Candidate>> {
        let k = usize::try_from(self.limit).unwrap_or(usize::MAX);
        let mut top = BoundedTopK::new(k);
        let mut it = self.child.execute_partition(partition, task)?;
        while let Some(row) = it.next_row()? {
            let key = ordering.key(row)?;
            let candidate = Candidate {
                key,
                seq: *seq,
                row: row.to_owned_row(),
                ordering: Arc::clone(ordering),
            };
            *seq += 1;
            top.offer(candidate);
        }
        Ok(top.into_sorted())
    }
}

impl RowProducer for TakeOrderedAndProjectExec {
    fn execute_partition(&self, _partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let ordering = Arc::new(RowOrdering::new(&self.ordering, self.child.schema())?);
        let k = usize::try_from(self.limit).unwrap_or(usize::MAX);
        let mut merged = BoundedTopK::new(k);
        let mut seq = 0u64;
        for p in 0..self.child.num_partitions() {
            task.check_interrupted()?;
            let sub = TaskContext::new(Arc::clone(task.exec()), task.stage_id(), p, task.attempt());
            for candidate in self.top_k_of_partition(p, &sub, &ordering, &mut seq)? {
                merged.offer(candidate);
            }
        }
        let winners = merged.into_sorted();
        let rows: Vec<Row> = match &self.projection {
            None => winners.into_iter().map(|c| c.row).collect(),
            Some(exprs) => {
                let bound = bind_all(exprs, self.child.schema())?;
                winners
                    .into_iter()
                    .map(|c| Ok(Row::Boxed(GenericRow::new(eval_all(&bound, c.row.as_ref())?))))
                    .collect::<Result<_>>()?
            }
        };
        self.metrics.add(NUM_OUTPUT_ROWS, rows.len() as u64);
        Ok(VecRowIter::boxed(rows))
    }
}

impl MetricsEmitter for TakeOrderedAndProjectExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for TakeOrderedAndProjectExec {
    fn name(&self) -> &'static str {
        "TakeOrderedAndProjectExec"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Vec<PlanRef> {
        vec![Arc::clone(&self.child)]
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 1)?;
        let mut children = children;
        Ok(Arc::new(Self::new(
            self.limit,
            self.ordering.clone(),
            self.projection.clone(),
            children.remove(0),
        )?))
    }

    fn output_partitioning(&self) -> Partitioning {
        Partitioning::Single
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        match &self.projection {
            None => self.ordering.clone(),
            Some(exprs) => self
                .ordering
                .iter()
                .take_while(|o| exprs.contains(&o.expr))
                .cloned()
                .collect(),
        }
    }

    fn output_format(&self) -> RowFormat {
        if self.projection.is_some() {
            RowFormat::Boxed
        } else {
            self.child.output_format()
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        let keys: Vec<String> = self.ordering.iter().map(ToString::to_string).collect();
        format!(
            "TakeOrderedAndProjectExec limit={} [{}]",
            self.limit,
            keys.join(", ")
        )
    }
}
