//! Inner equi-joins.
//!
//! [`SortMergeJoinExec`] needs both sides clustered on the join keys and
//! sorted by them inside each partition; the planner provides both.
//! [`BroadcastHashJoinExec`] streams its left side and probes a hash table
//! built from the whole right side, which must arrive broadcast.
//!
//! Output rows are the left columns followed by the right columns. Rows with a
//! null join key never match.

use crate::error::planning_err;
use crate::expr::{BoundExpr, Expr, SortOrder, bind_all, compare_values, eval_all};
use crate::metrics::{MetricSet, NUM_OUTPUT_ROWS};
use crate::partitioning::{Distribution, Partitioning};
use crate::plan::{ExecNode, MetricsEmitter, PlanRef, RowProducer, expect_children};
use crate::row::{BoxRowIter, GenericRow, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::{Schema, Value};
use anyhow::Result;
use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| compare_values(x, y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Copy every row of `it` that has a non-null join key.
fn drain_keyed(mut it: BoxRowIter, keys: &[BoundExpr], schema: &Schema) -> Result<Vec<(Vec<Value>, GenericRow)>> {
    let mut out = Vec::new();
    while let Some(row) = it.next_row()? {
        let key = eval_all(keys, row)?;
        if key.iter().any(Value::is_null) {
            continue;
        }
        out.push((key, row.to_generic(schema)?));
    }
    Ok(out)
}

fn joined(left: &GenericRow, right: &GenericRow) -> GenericRow {
    let mut values = left.values().to_vec();
    values.extend_from_slice(right.values());
    GenericRow::new(values)
}

fn check_keys(left: &[Expr], right: &[Expr], l: &PlanRef, r: &PlanRef) -> Result<()> {
    if left.is_empty() || left.len() != right.len() {
        return planning_err(format!(
            "join needs the same non-zero number of keys on both sides, got {} and {}",
            left.len(),
            right.len()
        ));
    }
    bind_all(left, l.schema())?;
    bind_all(right, r.schema())?;
    Ok(())
}

#[derive(Debug)]
pub struct SortMergeJoinExec {
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    left: PlanRef,
    right: PlanRef,
    schema: Schema,
    metrics: Arc<MetricSet>,
}

impl SortMergeJoinExec {
    /// # Errors
    ///
    /// Returns a planning error if the key lists differ in length or do not
    /// bind to their side.
    pub fn new(left_keys: Vec<Expr>, right_keys: Vec<Expr>, left: PlanRef, right: PlanRef) -> Result<Self> {
        check_keys(&left_keys, &right_keys, &left, &right)?;
        let schema = left.schema().merge(right.schema());
        Ok(Self {
            left_keys,
            right_keys,
            left,
            right,
            schema,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        })
    }
}

/// Merges two key-sorted inputs, emitting the cross product of every pair of
/// equal-key groups.
struct MergeJoinIter {
    left: std::vec::IntoIter<(Vec<Value>, GenericRow)>,
    right: Vec<(Vec<Value>, GenericRow)>,
    right_pos: usize,
    /// Current left row and the right group `[start, end)` it matches.
    pending: Option<(GenericRow, usize, usize)>,
    last_group: Option<(Vec<Value>, usize, usize)>,
    row: Option<GenericRow>,
    metrics: Arc<MetricSet>,
}

impl MergeJoinIter {
    fn group_for(&mut self, key: &[Value]) -> Option<(usize, usize)> {
        if let Some((k, start, end)) = &self.last_group {
            if compare_keys(k, key).is_eq() {
                return Some((*start, *end));
            }
        }
        while self.right_pos < self.right.len()
            && compare_keys(&self.right[self.right_pos].0, key).is_lt()
        {
            self.right_pos += 1;
        }
        let start = self.right_pos;
        let mut end = start;
        while end < self.right.len() && compare_keys(&self.right[end].0, key).is_eq() {
            end += 1;
        }
        self.right_pos = end;
        if start == end {
            return None;
        }
        self.last_group = Some((key.to_vec(), start, end));
        Some((start, end))
    }
}

impl RowIter for MergeJoinIter {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some((left, next, end)) = &mut self.pending {
                if *next < *end {
                    self.row = Some(joined(left, &self.right[*next].1));
                    *next += 1;
                    self.metrics.add(NUM_OUTPUT_ROWS, 1);
                    return Ok(true);
                }
                self.pending = None;
            }
            let Some((key, left)) = self.left.next() else {
                self.row = None;
                return Ok(false);
            };
            if let Some((start, end)) = self.group_for(&key) {
                self.pending = Some((left, start, end));
            }
        }
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.row.as_ref().map(RowRef::Boxed)
    }
}

impl RowProducer for SortMergeJoinExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let left_keys = bind_all(&self.left_keys, self.left.schema())?;
        let right_keys = bind_all(&self.right_keys, self.right.schema())?;
        let left = drain_keyed(
            self.left.execute_partition(partition, task)?,
            &left_keys,
            self.left.schema(),
        )?;
        task.check_interrupted()?;
        let right = drain_keyed(
            self.right.execute_partition(partition, task)?,
            &right_keys,
            self.right.schema(),
        )?;
        Ok(Box::new(MergeJoinIter {
            left: left.into_iter(),
            right,
            right_pos: 0,
            pending: None,
            last_group: None,
            row: None,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for SortMergeJoinExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for SortMergeJoinExec {
    fn name(&self) -> &'static str {
        "SortMergeJoinExec"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Vec<PlanRef> {
        vec![Arc::clone(&self.left), Arc::clone(&self.right)]
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 2)?;
        let mut children = children;
        let right = children.remove(1);
        let left = children.remove(0);
        Ok(Arc::new(Self::new(
            self.left_keys.clone(),
            self.right_keys.clone(),
            left,
            right,
        )?))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.left.output_partitioning()
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.left_keys.iter().cloned().map(SortOrder::asc).collect()
    }

    fn required_child_distribution(&self) -> Vec<Distribution> {
        vec![
            Distribution::clustered(self.left_keys.clone()),
            Distribution::clustered(self.right_keys.clone()),
        ]
    }

    fn required_child_ordering(&self) -> Vec<Vec<SortOrder>> {
        vec![
            self.left_keys.iter().cloned().map(SortOrder::asc).collect(),
            self.right_keys.iter().cloned().map(SortOrder::asc).collect(),
        ]
    }

    fn output_format(&self) -> RowFormat {
        RowFormat::Boxed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        let l: Vec<String> = self.left_keys.iter().map(ToString::to_string).collect();
        let r: Vec<String> = self.right_keys.iter().map(ToString::to_string).collect();
        format!("SortMergeJoinExec [{}] = [{}]", l.join(", "), r.join(", "))
    }
}

#[derive(Debug)]
pub struct BroadcastHashJoinExec {
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    left: PlanRef,
    right: PlanRef,
    schema: Schema,
    metrics: Arc<MetricSet>,
}

impl BroadcastHashJoinExec {
    /// # Errors
    ///
    /// Returns a planning error if the key lists differ in length or do not
    /// bind to their side.
    pub fn new(left_keys: Vec<Expr>, right_keys: Vec<Expr>, left: PlanRef, right: PlanRef) -> Result<Self> {
        check_keys(&left_keys, &right_keys, &left, &right)?;
        let schema = left.schema().merge(right.schema());
        Ok(Self {
            left_keys,
            right_keys,
            left,
            right,
            schema,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        })
    }
}

struct HashProbeIter {
    stream: BoxRowIter,
    stream_keys: Vec<BoundExpr>,
    stream_schema: Schema,
    table: Arc<HashMap<Vec<Value>, Vec<GenericRow>>>,
    left_row: Option<GenericRow>,
    matches: Vec<GenericRow>,
    next_match: usize,
    row: Option<GenericRow>,
    metrics: Arc<MetricSet>,
}

impl RowIter for HashProbeIter {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(left) = &self.left_row {
                if self.next_match < self.matches.len() {
                    self.row = Some(joined(left, &self.matches[self.next_match]));
                    self.next_match += 1;
                    self.metrics.add(NUM_OUTPUT_ROWS, 1);
                    return Ok(true);
                }
                self.left_row = None;
            }
            let Some(row) = self.stream.next_row()? else {
                self.row = None;
                return Ok(false);
            };
            let key = eval_all(&self.stream_keys, row)?;
            if key.iter().any(Value::is_null) {
                continue;
            }
            if let Some(found) = self.table.get(&key) {
                self.matches.clone_from(found);
                self.next_match = 0;
                self.left_row = Some(row.to_generic(&self.stream_schema)?);
            }
        }
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.row.as_ref().map(RowRef::Boxed)
    }
}

impl RowProducer for BroadcastHashJoinExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let build_keys = bind_all(&self.right_keys, self.right.schema())?;
        let mut table: HashMap<Vec<Value>, Vec<GenericRow>> = HashMap::new();
        for (key, row) in drain_keyed(
            self.right.execute_partition(0, task)?,
            &build_keys,
            self.right.schema(),
        )? {
            table.entry(key).or_default().push(row);
        }
        Ok(Box::new(HashProbeIter {
            stream: self.left.execute_partition(partition, task)?,
            stream_keys: bind_all(&self.left_keys, self.left.schema())?,
            stream_schema: self.left.schema().clone(),
            table: Arc::new(table),
            left_row: None,
            matches: Vec::new(),
            next_match: 0,
            row: None,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for BroadcastHashJoinExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for BroadcastHashJoinExec {
    fn name(&self) -> &'static str {
        "BroadcastHashJoinExec"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> Vec<PlanRef> {
        vec![Arc::clone(&self.left), Arc::clone(&self.right)]
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 2)?;
        let mut children = children;
        let right = children.remove(1);
        let left = children.remove(0);
        Ok(Arc::new(Self::new(
            self.left_keys.clone(),
            self.right_keys.clone(),
            left,
            right,
        )?))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.left.output_partitioning()
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.left.output_ordering()
    }

    fn required_child_distribution(&self) -> Vec<Distribution> {
        vec![Distribution::Unspecified, Distribution::Broadcast]
    }

    fn output_format(&self) -> RowFormat {
        RowFormat::Boxed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        let l: Vec<String> = self.left_keys.iter().map(ToString::to_string).collect();
        let r: Vec<String> = self.right_keys.iter().map(ToString::to_string).collect();
        format!("BroadcastHashJoinExec [{}] = [{}]", l.join(", "), r.join(", "))
    }
}
