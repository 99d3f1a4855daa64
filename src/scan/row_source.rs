//! Scans over pluggable row-oriented sources.

use crate::error::planning_err;
use crate::metrics::{MetricSet, NUM_OUTPUT_ROWS};
use crate::partitioning::Partitioning;
use crate::plan::{ExecNode, MetricsEmitter, PlanRef, RowProducer, expect_children};
use crate::row::{BoxRowIter, GenericRow, PackedRow, Row, RowFormat, RowIter, RowRef, VecRowIter};
use crate::task::TaskContext;
use crate::types::Schema;
use anyhow::Result;
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A partitioned source of rows that is not backed by files.
pub trait RowSource: Debug + Send + Sync {
    fn schema(&self) -> &Schema;

    fn num_partitions(&self) -> usize;

    /// How rows are spread across the source's partitions.
    fn partitioning(&self) -> Partitioning {
        Partitioning::Unknown(self.num_partitions())
    }

    fn format(&self) -> RowFormat;

    /// # Errors
    ///
    /// Returns an error if the partition cannot be read.
    fn read_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter>;
}

/// Rows held in memory, one vector per partition.
#[derive(Debug)]
pub struct MemoryRowSource {
    schema: Schema,
    partitions: Vec<Arc<Vec<Row>>>,
    partitioning: Option<Partitioning>,
    format: RowFormat,
}

impl MemoryRowSource {
    /// # Errors
    ///
    /// Returns a planning error if a row does not match `schema`.
    pub fn new(schema: Schema, partitions: Vec<Vec<GenericRow>>) -> Result<Self> {
        for row in partitions.iter().flatten() {
            let fits = row.len() == schema.len()
                && row
                    .values()
                    .iter()
                    .zip(&schema.fields)
                    .all(|(v, f)| v.conforms_to(&f.data_type));
            if !fits {
                return planning_err(format!("row {row:?} does not match the source schema"));
            }
        }
        Ok(Self {
            schema,
            partitions: partitions
                .into_iter()
                .map(|p| Arc::new(p.into_iter().map(Row::Boxed).collect()))
                .collect(),
            partitioning: None,
            format: RowFormat::Boxed,
        })
    }

    /// Declare how the rows are already partitioned.
    ///
    /// # Errors
    ///
    /// Returns a planning error if the partition counts disagree.
    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Result<Self> {
        if !matches!(partitioning, Partitioning::Broadcast)
            && partitioning.num_partitions() != self.partitions.len()
        {
            return planning_err(format!(
                "{partitioning} declared over {} partitions",
                self.partitions.len()
            ));
        }
        self.partitioning = Some(partitioning);
        Ok(self)
    }

    /// Store the rows in the packed format.
    ///
    /// # Errors
    ///
    /// Returns a planning error if the schema has types the packed format
    /// cannot hold.
    pub fn packed(mut self) -> Result<Self> {
        if !self.schema.supports_packed() {
            return planning_err("schema cannot be stored packed");
        }
        let mut partitions = Vec::with_capacity(self.partitions.len());
        for p in &self.partitions {
            let rows = p
                .iter()
                .map(|r| Ok(Row::Packed(PackedRow::from_values(generic_values(r)?, &self.schema)?)))
                .collect::<Result<Vec<_>>>()?;
            partitions.push(Arc::new(rows));
        }
        self.partitions = partitions;
        self.format = RowFormat::Packed;
        Ok(self)
    }

    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.partitions.iter().map(|p| p.len()).sum()
    }
}

fn generic_values(row: &Row) -> Result<&[crate::types::Value]> {
    match row {
        Row::Boxed(g) => Ok(g.values()),
        Row::Packed(_) => planning_err("row is already packed"),
    }
}

impl RowSource for MemoryRowSource {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    fn partitioning(&self) -> Partitioning {
        self.partitioning
            .clone()
            .unwrap_or(Partitioning::Unknown(self.partitions.len()))
    }

    fn format(&self) -> RowFormat {
        self.format
    }

    fn read_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        task.check_interrupted()?;
        match self.partitions.get(partition) {
            Some(rows) => Ok(Box::new(VecRowIter::shared(Arc::clone(rows)))),
            None => planning_err(format!("source has no partition {partition}")),
        }
    }
}

/// Leaf operator reading a [`RowSource`].
#[derive(Debug)]
pub struct RowSourceScanExec {
    source: Arc<dyn RowSource>,
    metrics: Arc<MetricSet>,
}

impl RowSourceScanExec {
    #[must_use]
    pub fn new(source: Arc<dyn RowSource>) -> Self {
        Self {
            source,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        }
    }
}

struct CountingIter {
    input: BoxRowIter,
    metrics: Arc<MetricSet>,
}

impl RowIter for CountingIter {
    fn advance(&mut self) -> Result<bool> {
        let more = self.input.advance()?;
        if more {
            self.metrics.add(NUM_OUTPUT_ROWS, 1);
        }
        Ok(more)
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.input.current()
    }
}

impl RowProducer for RowSourceScanExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        Ok(Box::new(CountingIter {
            input: self.source.read_partition(partition, task)?,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for RowSourceScanExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for RowSourceScanExec {
    fn name(&self) -> &'static str {
        "RowSourceScanExec"
    }

    fn schema(&self) -> &Schema {
        self.source.schema()
    }

    fn children(&self) -> Vec<PlanRef> {
        Vec::new()
    }

    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef> {
        expect_children(self.name(), &children, 0)?;
        Ok(Arc::new(Self::new(Arc::clone(&self.source))))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.source.partitioning()
    }

    fn output_format(&self) -> RowFormat {
        self.source.format()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn num_partitions(&self) -> usize {
        self.source.num_partitions()
    }

    fn describe(&self) -> String {
        format!("RowSourceScanExec ({} partitions)", self.source.num_partitions())
    }
}
