//! Row-format converters inserted by the row-format pass.

use crate::error::planning_err;
use crate::expr::SortOrder;
use crate::metrics::{MetricSet, NUM_OUTPUT_ROWS};
use crate::partitioning::Partitioning;
use crate::plan::{ExecNode, MetricsEmitter, PlanRef, RowProducer, expect_children};
use crate::row::{BoxRowIter, GenericRow, PackedRowWriter, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::Schema;
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;

/// Encodes boxed rows into packed rows through one reused buffer.
#[derive(Debug)]
pub struct ToPackedExec {
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl ToPackedExec {
    /// # Errors
    ///
    /// Returns a planning error if the child schema holds a type the packed
    /// format cannot store.
    pub fn new(child: PlanRef) -> Result<Self> {
        if !child.schema().supports_packed() {
            return planning_err(format!(
                "schema of {} cannot be stored in packed rows",
                child.name()
            ));
        }
        Ok(Self {
            child,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        })
    }
}

struct ToPackedIter {
    input: BoxRowIter,
    schema: Schema,
    writer: PackedRowWriter,
    metrics: Arc<MetricSet>,
}

impl RowIter for ToPackedIter {
    fn advance(&mut self) -> Result<bool> {
        match self.input.next_row()? {
            Some(RowRef::Boxed(g)) => {
                self.writer.write(g.values(), &self.schema)?;
            }
            Some(RowRef::Packed(p)) => {
                self.writer.write_bytes(p);
            }
            None => {
                self.writer.clear();
                return Ok(false);
            }
        }
        self.metrics.add(NUM_OUTPUT_ROWS, 1);
        Ok(true)
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.writer.current().map(RowRef::Packed)
    }
}

/// Decodes packed rows into boxed rows.
#[derive(Debug)]
pub struct ToBoxedExec {
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl ToBoxedExec {
    #[must_use]
    pub fn new(child: PlanRef) -> Self {
        Self {
            child,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        }
    }
}

struct ToBoxedIter {
    input: BoxRowIter,
    schema: Schema,
    row: Option<GenericRow>,
    metrics: Arc<MetricSet>,
}

impl RowIter for ToBoxedIter {
    fn advance(&mut self) -> Result<bool> {
        self.row = match self.input.next_row()? {
            Some(r) => Some(r.to_generic(&self.schema)?),
            None => None,
        };
        if self.row.is_some() {
            self.metrics.add(NUM_OUTPUT_ROWS, 1);
        }
        Ok(self.row.is_some())
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.row.as_ref().map(RowRef::Boxed)
    }
}

impl RowProducer for ToPackedExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let input = self.child.execute_partition(partition, task)?;
        Ok(Box::new(ToPackedIter {
            input,
            schema: self.child.schema().clone(),
            writer: PackedRowWriter::new(),
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for ToPackedExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for ToPackedExec {
    fn name(&self) -> &'static str {
        "ToPackedExec"
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
        Ok(Arc::new(Self::new(children.remove(0))?))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.child.output_partitioning()
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.child.output_ordering()
    }

    fn output_format(&self) -> RowFormat {
        RowFormat::Packed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RowProducer for ToBoxedExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let input = self.child.execute_partition(partition, task)?;
        Ok(Box::new(ToBoxedIter {
            input,
            schema: self.child.schema().clone(),
            row: None,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for ToBoxedExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for ToBoxedExec {
    fn name(&self) -> &'static str {
        "ToBoxedExec"
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
        self.child.output_partitioning()
    }

    fn output_ordering(&self) -> Vec<SortOrder> {
        self.child.output_ordering()
    }

    fn output_format(&self) -> RowFormat {
        RowFormat::Boxed
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
