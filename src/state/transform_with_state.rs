//! The stateful transformation operator.
//!
//! Per partition and micro-batch the operator walks a fixed lifecycle:
//! `Created -> Initialized -> DataProcessed -> TimerProcessed -> Closed`.
//! It opens the partition's store at the batch version, seeds it from the
//! initial-state input on the first batch only, calls the processor once per
//! grouping key, fires expired timers and finally commits (streaming) or
//! aborts (one-off batch) the store.
//!
//! All of this happens lazily as the consumer pulls rows. The commit is the
//! terminal action of the output iterator: it runs when the iterator reports
//! exhaustion, and a failure or an iterator dropped early aborts instead.

use super::processor::{
    OutputMode, ProcessorState, StatefulProcessor, StatefulProcessorHandle, TimeMode, TimerValues,
    decode_key, encode_key, split_timer_key,
};
use super::store::{StateStore, StateStoreId, TIMERS_COL_FAMILY};
use crate::error::planning_err;
use crate::expr::{BoundExpr, Expr, bind_all, eval_all};
use crate::metrics::{
    COMMIT_TIME_MS, MetricSet, NUM_EXPIRED_TIMERS, NUM_OUTPUT_ROWS, NUM_REMOVED_STATE_ROWS,
    NUM_UPDATED_STATE_ROWS,
};
use crate::partitioning::{Distribution, Partitioning};
use crate::plan::{ExecNode, MetricsEmitter, PlanRef, RowProducer, expect_children};
use crate::row::{BoxRowIter, GenericRow, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::{Schema, Value};
use anyhow::Result;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Debug, Formatter, Result as FormatResult};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// The micro-batch an operator instance runs for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchInfo {
    pub batch_id: u64,
    pub timers: TimerValues,
    /// Streaming runs commit their state; one-off batch runs abort it.
    pub streaming: bool,
}

impl BatchInfo {
    #[must_use]
    pub const fn streaming(batch_id: u64) -> Self {
        Self {
            batch_id,
            timers: TimerValues {
                batch_timestamp_ms: None,
                watermark_ms: None,
            },
            streaming: true,
        }
    }

    #[must_use]
    pub const fn one_off() -> Self {
        Self {
            batch_id: 0,
            timers: TimerValues {
                batch_timestamp_ms: None,
                watermark_ms: None,
            },
            streaming: false,
        }
    }

    #[must_use]
    pub const fn with_batch_timestamp(mut self, ms: i64) -> Self {
        self.timers.batch_timestamp_ms = Some(ms);
        self
    }

    #[must_use]
    pub const fn with_watermark(mut self, ms: i64) -> Self {
        self.timers.watermark_ms = Some(ms);
        self
    }
}

/// Initial-state side input: rows and the expressions that key them.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub grouping_keys: Vec<Expr>,
    pub plan: PlanRef,
}

pub struct TransformWithStateExec {
    processor: Arc<dyn StatefulProcessor>,
    grouping_keys: Vec<Expr>,
    output_schema: Schema,
    time_mode: TimeMode,
    output_mode: OutputMode,
    operator_id: u64,
    batch: BatchInfo,
    child: PlanRef,
    initial_state: Option<InitialState>,
    metrics: Arc<MetricSet>,
}

impl Debug for TransformWithStateExec {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.debug_struct("TransformWithStateExec")
            .field("grouping_keys", &self.grouping_keys)
            .field("operator_id", &self.operator_id)
            .field("batch", &self.batch)
            .field("time_mode", &self.time_mode)
            .finish_non_exhaustive()
    }
}

impl TransformWithStateExec {
    /// # Errors
    ///
    /// Returns a planning error if a grouping key does not bind to the child.
    pub fn new(
        processor: Arc<dyn StatefulProcessor>,
        grouping_keys: Vec<Expr>,
        output_schema: Schema,
        operator_id: u64,
        batch: BatchInfo,
        child: PlanRef,
    ) -> Result<Self> {
        if grouping_keys.is_empty() {
            return planning_err("a stateful transformation needs grouping keys");
        }
        bind_all(&grouping_keys, child.schema())?;
        Ok(Self {
            processor,
            grouping_keys,
            output_schema,
            time_mode: TimeMode::None,
            output_mode: OutputMode::Append,
            operator_id,
            batch,
            child,
            initial_state: None,
            metrics: Arc::new(MetricSet::new(&[
                NUM_OUTPUT_ROWS,
                NUM_UPDATED_STATE_ROWS,
                NUM_REMOVED_STATE_ROWS,
                NUM_EXPIRED_TIMERS,
                COMMIT_TIME_MS,
            ])),
        })
    }

    #[must_use]
    pub const fn with_time_mode(mut self, mode: TimeMode) -> Self {
        self.time_mode = mode;
        self
    }

    #[must_use]
    pub const fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    /// # Errors
    ///
    /// Returns a planning error if the initial-state keys do not bind or do
    /// not match the grouping key count.
    pub fn with_initial_state(mut self, initial: InitialState) -> Result<Self> {
        if initial.grouping_keys.len() != self.grouping_keys.len() {
            return planning_err("initial state must be keyed like the input");
        }
        bind_all(&initial.grouping_keys, initial.plan.schema())?;
        self.initial_state = Some(initial);
        Ok(self)
    }

    #[must_use]
    pub const fn batch(&self) -> BatchInfo {
        self.batch
    }

    fn rebuild(&self, child: PlanRef, initial: Option<PlanRef>) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            grouping_keys: self.grouping_keys.clone(),
            output_schema: self.output_schema.clone(),
            time_mode: self.time_mode,
            output_mode: self.output_mode,
            operator_id: self.operator_id,
            batch: self.batch,
            child,
            initial_state: self.initial_state.as_ref().zip(initial).map(|(s, plan)| InitialState {
                grouping_keys: s.grouping_keys.clone(),
                plan,
            }),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Rows grouped by key, keys in ascending order.
fn group_rows(
    mut input: BoxRowIter,
    keys: &[BoundExpr],
    schema: &Schema,
    task: &TaskContext,
) -> Result<BTreeMap<Vec<Value>, Vec<GenericRow>>> {
    let mut groups: BTreeMap<Vec<Value>, Vec<GenericRow>> = BTreeMap::new();
    while let Some(row) = input.next_row()? {
        task.check_interrupted()?;
        let key = eval_all(keys, row)?;
        groups.entry(key).or_default().push(row.to_generic(schema)?);
    }
    Ok(groups)
}

struct TransformIter {
    processor: Arc<dyn StatefulProcessor>,
    store: Option<Box<dyn StateStore>>,
    task: TaskContext,
    batch: BatchInfo,
    time_mode: TimeMode,
    output_mode: OutputMode,
    input: Option<(BoxRowIter, Vec<BoundExpr>, Schema)>,
    initial: Option<(BoxRowIter, Vec<BoundExpr>, Schema)>,
    groups: std::collections::btree_map::IntoIter<Vec<Value>, Vec<GenericRow>>,
    lifecycle: ProcessorState,
    pending: VecDeque<GenericRow>,
    row: Option<GenericRow>,
    metrics: Arc<MetricSet>,
}

impl TransformIter {
    fn store(&mut self) -> Result<&mut Box<dyn StateStore>> {
        match self.store.as_mut() {
            Some(s) => Ok(s),
            None => planning_err("state store already released"),
        }
    }

    fn initialize(&mut self) -> Result<()> {
        self.processor.init(self.output_mode, self.time_mode)?;
        if let Some((rows, keys, schema)) = self.initial.take() {
            let groups = group_rows(rows, &keys, &schema, &self.task)?;
            let processor = Arc::clone(&self.processor);
            let (timers, mode, metrics) = (self.batch.timers, self.time_mode, Arc::clone(&self.metrics));
            let store = self.store()?;
            for (key, rows) in groups {
                for row in &rows {
                    let mut handle =
                        StatefulProcessorHandle::new(&mut *store, encode_key(&key)?, mode, &metrics);
                    processor.handle_initial_state(&key, row, &mut handle, &timers)?;
                }
            }
            debug!(batch = self.batch.batch_id, "applied initial state");
        }
        if let Some((rows, keys, schema)) = self.input.take() {
            self.groups = group_rows(rows, &keys, &schema, &self.task)?.into_iter();
        }
        self.lifecycle = ProcessorState::Initialized;
        Ok(())
    }

    fn process_group(&mut self, key: Vec<Value>, rows: Vec<GenericRow>) -> Result<()> {
        self.task.check_interrupted()?;
        let processor = Arc::clone(&self.processor);
        let (timers, mode, metrics) = (self.batch.timers, self.time_mode, Arc::clone(&self.metrics));
        let store = self.store()?;
        let mut handle = StatefulProcessorHandle::new(store, encode_key(&key)?, mode, &metrics);
        let out = processor.handle_input_rows(&key, &rows, &mut handle, &timers)?;
        trace!(rows = rows.len(), output = out.len(), "processed key group");
        self.pending.extend(out);
        Ok(())
    }

    fn fire_timers(&mut self) -> Result<()> {
        let Some(threshold) = self.batch.timers.threshold(self.time_mode) else {
            return Ok(());
        };
        let processor = Arc::clone(&self.processor);
        let (timers, mode, metrics) = (self.batch.timers, self.time_mode, Arc::clone(&self.metrics));
        let task = self.task.clone();
        let store = self.store()?;
        let mut expired = Vec::new();
        for (k, _) in store.entries(TIMERS_COL_FAMILY)? {
            let (expiry, key_bytes) = split_timer_key(&k)?;
            if expiry >= threshold {
                break;
            }
            expired.push((k.clone(), expiry, key_bytes.to_vec()));
        }
        let mut output = Vec::new();
        for (timer, expiry, key_bytes) in expired {
            task.check_interrupted()?;
            // Deleted by an earlier handler in this pass.
            if !store.remove(TIMERS_COL_FAMILY, &timer)? {
                continue;
            }
            let key = decode_key(&key_bytes)?;
            let mut handle = StatefulProcessorHandle::new(&mut *store, key_bytes, mode, &metrics);
            output.extend(processor.handle_expired_timer(&key, expiry, &mut handle, &timers)?);
            metrics.add(NUM_EXPIRED_TIMERS, 1);
        }
        self.pending.extend(output);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let start = Instant::now();
        let streaming = self.batch.streaming;
        let store = self.store()?;
        if streaming {
            store.commit()?;
        } else {
            store.abort();
        }
        self.store = None;
        self.metrics.add_duration(COMMIT_TIME_MS, start.elapsed());
        self.processor.close()
    }

    fn step(&mut self) -> Result<bool> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                self.metrics.add(NUM_OUTPUT_ROWS, 1);
                self.row = Some(row);
                return Ok(true);
            }
            match self.lifecycle {
                ProcessorState::Created => self.initialize()?,
                ProcessorState::Initialized => match self.groups.next() {
                    Some((key, rows)) => self.process_group(key, rows)?,
                    None => self.lifecycle = ProcessorState::DataProcessed,
                },
                ProcessorState::DataProcessed => {
                    self.fire_timers()?;
                    self.lifecycle = ProcessorState::TimerProcessed;
                }
                ProcessorState::TimerProcessed => {
                    self.lifecycle = ProcessorState::Closed;
                    self.finish()?;
                }
                ProcessorState::Closed => {
                    self.row = None;
                    return Ok(false);
                }
            }
        }
    }

    fn abort(&mut self) {
        if let Some(mut store) = self.store.take() {
            store.abort();
        }
        self.lifecycle = ProcessorState::Closed;
        self.pending.clear();
        self.row = None;
    }
}

impl RowIter for TransformIter {
    fn advance(&mut self) -> Result<bool> {
        match self.step() {
            Ok(more) => Ok(more),
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.row.as_ref().map(RowRef::Boxed)
    }
}

impl Drop for TransformIter {
    fn drop(&mut self) {
        if self.store.is_some() {
            debug!("stateful iterator dropped before completion");
            self.abort();
        }
    }
}

impl RowProducer for TransformWithStateExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        task.check_interrupted()?;
        let id = StateStoreId::new(self.operator_id, partition);
        let store = task
            .exec()
            .state_provider()
            .get_store(&id, self.batch.batch_id)?;
        let input = (
            self.child.execute_partition(partition, task)?,
            bind_all(&self.grouping_keys, self.child.schema())?,
            self.child.schema().clone(),
        );
        let initial = match &self.initial_state {
            Some(init) if self.batch.batch_id == 0 => Some((
                init.plan.execute_partition(partition, task)?,
                bind_all(&init.grouping_keys, init.plan.schema())?,
                init.plan.schema().clone(),
            )),
            _ => None,
        };
        Ok(Box::new(TransformIter {
            processor: Arc::clone(&self.processor),
            store: Some(store),
            task: task.clone(),
            batch: self.batch,
            time_mode: self.time_mode,
            output_mode: self.output_mode,
            input: Some(input),
            initial,
            groups: BTreeMap::new().into_iter(),
            lifecycle: ProcessorState::Created,
            pending: VecDeque::new(),
            row: None,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for TransformWithStateExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for TransformWithStateExec {
    fn name(&self) -> &'static str {
        "TransformWithStateExec"
    }

    fn schema(&self) -> &Schema {
        &self.output_schema
    }

    fn children(&self) -> Vec<PlanRef> {
        let mut children = vec![Arc::clone(&self.child)];
        if let Some(init) = &self.initial_state {
            children.push(Arc::clone(&init.plan));
        }
        children
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        let expected = 1 + usize::from(self.initial_state.is_some());
        expect_children(self.name(), &children, expected)?;
        let mut children = children.into_iter();
        let Some(child) = children.next() else {
            return planning_err("missing child");
        };
        Ok(Arc::new(self.rebuild(child, children.next())))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.child.output_partitioning()
    }

    /// Input and initial state must be clustered the same way so a key's
    /// rows and its seed land in the same store partition.
    fn required_child_distribution(&self) -> Vec<Distribution> {
        let mut out = vec![Distribution::clustered(self.grouping_keys.clone())];
        if let Some(init) = &self.initial_state {
            out.push(Distribution::clustered(init.grouping_keys.clone()));
        }
        out
    }

    fn output_format(&self) -> RowFormat {
        RowFormat::Boxed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        let keys: Vec<String> = self.grouping_keys.iter().map(ToString::to_string).collect();
        format!(
            "TransformWithStateExec [{}] op={} batch={}",
            keys.join(", "),
            self.operator_id,
            self.batch.batch_id
        )
    }
}
