//! Row-at-a-time operators: filter and projection.
//!
//! Both preserve row order within a partition and are [`Compilable`], so the
//! planner can fuse them into a whole-stage pipeline.

use crate::expr::{BoundExpr, Expr, SortOrder, bind_all, eval_all};
use crate::metrics::{MetricSet, NUM_OUTPUT_ROWS};
use crate::partitioning::Partitioning;
use crate::plan::{
    Compilable, ExecNode, MetricsEmitter, PlanRef, RowProducer, RowStep, StepOutcome,
    expect_children,
};
use crate::row::{BoxRowIter, GenericRow, PackedRowWriter, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::{Field, Schema};
use anyhow::{Context, Result};
use std::any::Any;
use std::sync::Arc;

#[derive(Debug)]
pub struct FilterExec {
    predicate: Expr,
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl FilterExec {
    /// # Errors
    ///
    /// Returns a planning error if the predicate references unknown columns.
    pub fn new(predicate: Expr, child: PlanRef) -> Result<Self> {
        predicate
            .bind(child.schema())
            .with_context(|| format!("binding filter {predicate}"))?;
        Ok(Self {
            predicate,
            child,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        })
    }

    #[must_use]
    pub const fn predicate(&self) -> &Expr {
        &self.predicate
    }
}

struct FilterIter {
    input: BoxRowIter,
    predicate: BoundExpr,
    metrics: Arc<MetricSet>,
}

impl RowIter for FilterIter {
    fn advance(&mut self) -> Result<bool> {
        while self.input.advance()? {
            let Some(row) = self.input.current() else {
                continue;
            };
            if self.predicate.eval_predicate(row)? {
                self.metrics.add(NUM_OUTPUT_ROWS, 1);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.input.current()
    }
}

impl RowProducer for FilterExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let input = self.child.execute_partition(partition, task)?;
        Ok(Box::new(FilterIter {
            input,
            predicate: self.predicate.bind(self.child.schema())?,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for FilterExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl Compilable for FilterExec {
    fn compile_step(&self) -> Result<RowStep> {
        let predicate = self.predicate.bind(self.child.schema())?;
        let metrics = Arc::clone(&self.metrics);
        Ok(Box::new(move |row: RowRef<'_>| {
            if predicate.eval_predicate(row)? {
                metrics.add(NUM_OUTPUT_ROWS, 1);
                Ok(StepOutcome::Keep)
            } else {
                Ok(StepOutcome::Skip)
            }
        }))
    }
}

impl ExecNode for FilterExec {
    fn name(&self) -> &'static str {
        "FilterExec"
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
        Ok(Arc::new(Self::new(self.predicate.clone(), children.remove(0))?))
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
        format!("FilterExec {}", self.predicate)
    }
}

/// Evaluates a list of expressions per row. Produces packed rows when the
/// output schema allows it, writing every row into one reused buffer.
#[derive(Debug)]
pub struct ProjectExec {
    exprs: Vec<Expr>,
    schema: Schema,
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl ProjectExec {
    /// # Errors
    ///
    /// Returns a planning error if an expression references unknown columns.
    pub fn new(exprs: Vec<Expr>, child: PlanRef) -> Result<Self> {
        let input = child.schema();
        let fields = exprs
            .iter()
            .map(|e| Ok(Field::new(e.output_name(), e.data_type(input)?, true)))
            .collect::<Result<Vec<_>>>()?;
        bind_all(&exprs, input)?;
        Ok(Self {
            exprs,
            schema: Schema::new(fields),
            child,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        })
    }

    #[must_use]
    pub fn exprs(&self) -> &[Expr] {
        &self.exprs
    }

    /// True if `expr` survives the projection under the same name.
    fn passes_through(&self, expr: &Expr) -> bool {
        match expr {
            Expr::Column(name) => self.exprs.iter().any(|e| match e {
                Expr::Alias(inner, alias) => alias == name && **inner == *expr,
                other => other == expr,
            }),
            _ => false,
        }
    }
}

struct ProjectIter {
    input: BoxRowIter,
    exprs: Vec<BoundExpr>,
    schema: Schema,
    packed: bool,
    writer: PackedRowWriter,
    boxed: Option<GenericRow>,
    metrics: Arc<MetricSet>,
}

impl RowIter for ProjectIter {
    fn advance(&mut self) -> Result<bool> {
        let Some(row) = self.input.next_row()? else {
            self.boxed = None;
            self.writer.clear();
            return Ok(false);
        };
        let values = eval_all(&self.exprs, row)?;
        if self.packed {
            self.writer.write(&values, &self.schema)?;
        } else {
            self.boxed = Some(GenericRow::new(values));
        }
        self.metrics.add(NUM_OUTPUT_ROWS, 1);
        Ok(true)
    }

    fn current(&self) -> Option<RowRef<'_>> {
        if self.packed {
            self.writer.current().map(RowRef::Packed)
        } else {
            self.boxed.as_ref().map(RowRef::Boxed)
        }
    }
}

impl RowProducer for ProjectExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let input = self.child.execute_partition(partition, task)?;
        Ok(Box::new(ProjectIter {
            input,
            exprs: bind_all(&self.exprs, self.child.schema())?,
            schema: self.schema.clone(),
            packed: self.output_format() == RowFormat::Packed,
            writer: PackedRowWriter::new(),
            boxed: None,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for ProjectExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl Compilable for ProjectExec {
    fn compile_step(&self) -> Result<RowStep> {
        let exprs = bind_all(&self.exprs, self.child.schema())?;
        let metrics = Arc::clone(&self.metrics);
        Ok(Box::new(move |row: RowRef<'_>| {
            let values = eval_all(&exprs, row)?;
            metrics.add(NUM_OUTPUT_ROWS, 1);
            Ok(StepOutcome::Replace(GenericRow::new(values)))
        }))
    }
}

impl ExecNode for ProjectExec {
    fn name(&self) -> &'static str {
        "ProjectExec"
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
        Ok(Arc::new(Self::new(self.exprs.clone(), children.remove(0))?))
    }

    fn output_partitioning(&self) -> Partitioning {
        let child = self.child.output_partitioning();
        let kept = match &child {
            Partitioning::Hash { exprs, .. } => exprs.iter().all(|e| self.passes_through(e)),
            Partitioning::Range { ordering, .. } => {
                ordering.iter().all(|o| self.passes_through(&o.expr))
            }
            Partitioning::Single | Partitioning::Broadcast => true,
            Partitioning::RoundRobin(_) | Partitioning::Unknown(_) => false,
        };
        if kept {
            child
        } else {
            Partitioning::Unknown(child.num_partitions())
        }
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.child
            .output_ordering()
            .into_iter()
            .take_while(|o| self.passes_through(&o.expr))
            .collect()
    }

    fn output_format(&self) -> RowFormat {
        if self.schema.supports_packed() {
            RowFormat::Packed
        } else {
            RowFormat::Boxed
        }
    }

    fn as_compilable(&self) -> Option<&dyn Compilable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn describe(&self) -> String {
        let exprs: Vec<String> = self.exprs.iter().map(ToString::to_string).collect();
        format!("ProjectExec [{}]", exprs.join(", "))
    }
}
