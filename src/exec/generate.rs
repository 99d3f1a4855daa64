//! Generate: one input row expands into zero or more output rows.
//!
//! Output is the child's columns followed by the generator's columns. Because a
//! single input row feeds several output rows, the child row is copied before
//! expansion starts; the child's buffer may be reused as soon as it is advanced.

use crate::error::{data_err, planning_err};
use crate::expr::{BoundExpr, Expr, SortOrder};
use crate::metrics::{MetricSet, NUM_OUTPUT_ROWS};
use crate::partitioning::Partitioning;
use crate::plan::{ExecNode, MetricsEmitter, PlanRef, RowProducer, expect_children};
use crate::row::{BoxRowIter, GenericRow, RowFormat, RowIter, RowRef};
use crate::task::TaskContext;
use crate::types::{DataType, Field, Schema, Value};
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Generator {
    /// One row per array element.
    Explode(Expr),
    /// One row per array element, preceded by its zero-based position.
    PosExplode(Expr),
}

impl Generator {
    const fn input(&self) -> &Expr {
        match self {
            Self::Explode(e) | Self::PosExplode(e) => e,
        }
    }

    const fn with_position(&self) -> bool {
        matches!(self, Self::PosExplode(_))
    }
}

#[derive(Debug)]
pub struct GenerateExec {
    generator: Generator,
    /// Emit a row of nulls for null or empty arrays instead of nothing.
    outer: bool,
    schema: Schema,
    child: PlanRef,
    metrics: Arc<MetricSet>,
}

impl GenerateExec {
    /// # Errors
    ///
    /// Returns a planning error if the generator input is not an array column
    /// expression of the child.
    pub fn new(generator: Generator, outer: bool, output_name: &str, child: PlanRef) -> Result<Self> {
        let input = child.schema();
        let DataType::Array(elem) = generator.input().data_type(input)? else {
            return planning_err(format!("cannot explode non-array {}", generator.input()));
        };
        let mut fields = input.fields.clone();
        if generator.with_position() {
            fields.push(Field::new("pos", DataType::Int, outer));
        }
        fields.push(Field::new(output_name, *elem, true));
        Ok(Self {
            generator,
            outer,
            schema: Schema::new(fields),
            child,
            metrics: Arc::new(MetricSet::new(&[NUM_OUTPUT_ROWS])),
        })
    }

    fn output_name(&self) -> &str {
        self.schema
            .fields
            .last()
            .map_or("col", |f| f.name.as_str())
    }
}

struct GenerateIter {
    input: BoxRowIter,
    array: BoundExpr,
    input_schema: Schema,
    with_position: bool,
    outer: bool,
    base: Vec<Value>,
    items: Vec<Value>,
    next_item: usize,
    /// Set while the outer null row for the current input is pending.
    outer_pending: bool,
    row: Option<GenericRow>,
    metrics: Arc<MetricSet>,
}

impl GenerateIter {
    fn emit(&mut self, pos: Option<usize>, item: Value) {
        let mut values = self.base.clone();
        if self.with_position {
            values.push(pos.map_or(Value::Null, |p| Value::Int(p as i32)));
        }
        values.push(item);
        self.row = Some(GenericRow::new(values));
        self.metrics.add(NUM_OUTPUT_ROWS, 1);
    }
}

impl RowIter for GenerateIter {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if self.next_item < self.items.len() {
                let i = self.next_item;
                self.next_item += 1;
                let item = std::mem::replace(&mut self.items[i], Value::Null);
                self.emit(Some(i), item);
                return Ok(true);
            }
            if self.outer_pending {
                self.outer_pending = false;
                self.emit(None, Value::Null);
                return Ok(true);
            }
            let Some(row) = self.input.next_row()? else {
                self.row = None;
                return Ok(false);
            };
            let array = self.array.eval(row)?;
            self.base = row.to_generic(&self.input_schema)?.into_values();
            self.items = match array {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => return data_err(format!("explode expected an array, got {other}")),
            };
            self.next_item = 0;
            self.outer_pending = self.outer && self.items.is_empty();
        }
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.row.as_ref().map(RowRef::Boxed)
    }
}

impl RowProducer for GenerateExec {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let input = self.child.execute_partition(partition, task)?;
        Ok(Box::new(GenerateIter {
            input,
            array: self.generator.input().bind(self.child.schema())?,
            input_schema: self.child.schema().clone(),
            with_position: self.generator.with_position(),
            outer: self.outer,
            base: Vec::new(),
            items: Vec::new(),
            next_item: 0,
            outer_pending: false,
            row: None,
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

impl MetricsEmitter for GenerateExec {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for GenerateExec {
    fn name(&self) -> &'static str {
        "GenerateExec"
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
            self.generator.clone(),
            self.outer,
            self.output_name(),
            children.remove(0),
        )?))
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

    fn describe(&self) -> String {
        let kind = match self.generator {
            Generator::Explode(_) => "explode",
            Generator::PosExplode(_) => "posexplode",
        };
        let outer = if self.outer { " outer" } else { "" };
        format!("GenerateExec {kind}({}){outer}", self.generator.input())
    }
}
