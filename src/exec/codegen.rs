//! Whole-stage fusion.
//!
//! A [`WholeStageExec`] replaces a chain of [`Compilable`](crate::plan::Compilable) operators with one
//! iterator that pushes every input row through the chain's composed steps.
//! The fused operators stay in the plan (they own the metrics and the output
//! shape); only the per-row dispatch changes. Results are identical to running
//! the chain through the interpreted iterators.

use crate::error::planning_err;
use crate::expr::SortOrder;
use crate::metrics::{MetricSet, NUM_OUTPUT_ROWS};
use crate::partitioning::{Distribution, Partitioning};
use crate::plan::{
    ExecNode, MetricsEmitter, PlanRef, RowProducer, RowStep, StepOutcome, expect_children,
};
use crate::row::{BoxRowIter, GenericRow, PackedRowWriter, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::Schema;
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;

#[derive(Debug)]
pub struct WholeStageExec {
    /// Top of the fused chain.
    fused: PlanRef,
    /// Number of operators fused, counted from the top.
    depth: usize,
    /// Child of the bottom fused operator.
    input: PlanRef,
    stage_id: usize,
    metrics: Arc<MetricSet>,
}

impl WholeStageExec {
    /// Fuse the top `depth` operators of `fused`.
    ///
    /// # Errors
    ///
    /// Returns a planning error if any of them is not compilable or does not
    /// have exactly one child.
    pub fn new(fused: PlanRef, depth: usize, stage_id: usize) -> Result<Self> {
        if depth == 0 {
            return planning_err("a fused stage needs at least one operator");
        }
        let chain = chain_of(&fused, depth)?;
        let mut input = None;
        for node in &chain {
            if node.as_compilable().is_none() {
                return planning_err(format!("{} cannot be fused", node.name()));
            }
            let mut children = node.children();
            if children.len() != 1 {
                return planning_err(format!("{} cannot be fused: not unary", node.name()));
            }
            input = children.pop();
        }
        let Some(input) = input else {
            return planning_err("fused chain has no input");
        };
        Ok(Self {
            fused,
            depth,
            input,
            stage_id,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        })
    }

    /// Fused operators, top first.
    ///
    /// # Errors
    ///
    /// Never in practice; the chain was validated on construction.
    pub fn fused_chain(&self) -> Result<Vec<PlanRef>> {
        chain_of(&self.fused, self.depth)
    }

    #[must_use]
    pub const fn stage_id(&self) -> usize {
        self.stage_id
    }
}

fn chain_of(top: &PlanRef, depth: usize) -> Result<Vec<PlanRef>> {
    let mut chain = Vec::with_capacity(depth);
    let mut cur = Arc::clone(top);
    for i in 0..depth {
        chain.push(Arc::clone(&cur));
        if i + 1 < depth {
            let Some(next) = cur.children().into_iter().next() else {
                return planning_err(format!("{} has no child to fuse", cur.name()));
            };
            cur = next;
        }
    }
    Ok(chain)
}

struct FusedIter {
    input: BoxRowIter,
    /// Bottom-up.
    steps: Vec<RowStep>,
    schema: Schema,
    packed: bool,
    writer: PackedRowWriter,
    replaced: Option<GenericRow>,
    passthrough: bool,
    stopped: bool,
    metrics: Arc<MetricSet>,
}

impl RowIter for FusedIter {
    fn advance(&mut self) -> Result<bool> {
        self.passthrough = false;
        self.replaced = None;
        while !self.stopped {
            let Some(row) = self.input.next_row()? else {
                break;
            };
            let mut owned: Option<GenericRow> = None;
            let mut keep = true;
            for step in &mut self.steps {
                let current = owned.as_ref().map_or(row, RowRef::Boxed);
                match step(current)? {
                    StepOutcome::Keep => {}
                    StepOutcome::Replace(g) => owned = Some(g),
                    StepOutcome::Skip => {
                        keep = false;
                        break;
                    }
                    StepOutcome::Stop => {
                        self.stopped = true;
                        keep = false;
                        break;
                    }
                }
            }
            if !keep {
                continue;
            }
            match owned {
                None => self.passthrough = true,
                Some(g) if self.packed => {
                    self.writer.write(g.values(), &self.schema)?;
                }
                Some(g) => self.replaced = Some(g),
            }
            self.metrics.add(NUM_OUTPUT_ROWS, 1);
            return Ok(true);
        }
        self.writer.clear();
        Ok(false)
    }

    fn current(&self) -> Option<RowRef<'_>> {
        if self.passthrough {
            self.input.current()
        } else if let Some(g) = &self.replaced {
            Some(RowRef::Boxed(g))
        } else {
            self.writer.current().map(RowRef::Packed)
        }
    }
}

impl RowProducer for WholeStageExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let mut steps = Vec::with_capacity(self.depth);
        for node in self.fused_chain()?.iter().rev() {
            let Some(c) = node.as_compilable() else {
                return planning_err(format!("{} cannot be fused", node.name()));
            };
            steps.push(c.compile_step()?);
        }
        Ok(Box::new(FusedIter {
            input: self.input.execute_partition(partition, task)?,
            steps,
            schema: self.fused.schema().clone(),
            packed: self.fused.output_format() == RowFormat::Packed,
            writer: PackedRowWriter::new(),
            replaced: None,
            passthrough: false,
            stopped: false,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for WholeStageExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for WholeStageExec {
    fn name(&self) -> &'static str {
        "WholeStageExec"
    }

    fn schema(&self) -> &Schema {
        self.fused.schema()
    }

    fn children(&self) -> Vec<PlanRef> {
        vec![Arc::clone(&self.input)]
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 1)?;
        let mut children = children;
        let mut cur = children.remove(0);
        for node in self.fused_chain()?.iter().rev() {
            cur = node.with_new_children(vec![cur])?;
        }
        Ok(Arc::new(Self::new(cur, self.depth, self.stage_id)?))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.fused.output_partitioning()
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.fused.output_ordering()
    }

    fn required_child_distribution(&self) -> Vec<Distribution> {
        match self.fused_chain() {
            Ok(chain) => chain
                .last()
                .map_or_else(|| vec![Distribution::Unspecified], |n| n.required_child_distribution()),
            Err(_) => vec![Distribution::Unspecified],
        }
    }

    fn output_format(&self) -> RowFormat {
        self.fused.output_format()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self
            .fused_chain()
            .unwrap_or_default()
            .iter()
            .map(|n| n.describe())
            .collect();
        format!("*({}) {}", self.stage_id, names.join(" <- "))
    }
}
