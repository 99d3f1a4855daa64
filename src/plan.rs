//! The physical operator model.
//!
//! Operators are trait objects behind [`PlanRef`]. Instead of an inheritance
//! hierarchy each operator implements a few small capabilities:
//!
//! - [`RowProducer`]: hand out a lazily pulled row iterator per partition.
//! - [`MetricsEmitter`]: expose the operator's fixed [`MetricSet`].
//! - [`Compilable`] (optional, via [`ExecNode::as_compilable`]): contribute a
//!   per-row step to a fused whole-stage pipeline.
//!
//! [`ExecNode`] adds the plan-shape questions the planner asks: output
//! partitioning and ordering, what each child must deliver, and the row format
//! produced and accepted.

use crate::error::planning_err;
use crate::expr::SortOrder;
use crate::metrics::MetricSet;
use crate::partitioning::{Distribution, Partitioning};
use crate::row::{BoxRowIter, GenericRow, RowFormat, RowRef};
use crate::task::TaskContext;
use crate::types::Schema;
use anyhow::Result;
use std::any::Any;
use std::fmt::{Debug, Write as _};
use std::sync::Arc;

pub type PlanRef = Arc<dyn ExecNode>;

/// Row format an operator accepts from its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatRequirement {
    Any,
    Packed,
    Boxed,
}

impl FormatRequirement {
    /// `Packed` when every column of `schema` can be packed, else `Boxed`.
    #[must_use]
    pub fn packed_if_supported(schema: &Schema) -> Self {
        if schema.supports_packed() {
            Self::Packed
        } else {
            Self::Boxed
        }
    }

    #[must_use]
    pub const fn accepts(self, format: RowFormat) -> bool {
        match self {
            Self::Any => true,
            Self::Packed => matches!(format, RowFormat::Packed),
            Self::Boxed => matches!(format, RowFormat::Boxed),
        }
    }
}

pub trait RowProducer {
    /// Iterator over the rows of one output partition.
    ///
    /// # Errors
    ///
    /// Any failure preparing the iterator; failures while iterating surface
    /// from the iterator itself.
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter>;
}

pub trait MetricsEmitter {
    fn metrics(&self) -> &MetricSet;
}

/// What a fused step decided for one row.
#[derive(Debug)]
pub enum StepOutcome {
    /// Drop the row.
    Skip,
    /// Pass the row on unchanged.
    Keep,
    /// Pass on a new row instead.
    Replace(GenericRow),
    /// No further rows will be accepted.
    Stop,
}

pub type RowStep = Box<dyn FnMut(RowRef<'_>) -> Result<StepOutcome> + Send>;

/// Operators that can run inside a fused whole-stage pipeline.
///
/// The interpreted [`RowProducer`] path is the reference behaviour; a compiled
/// step must produce exactly the same rows.
pub trait Compilable {
    /// A fresh per-partition step.
    ///
    /// # Errors
    ///
    /// Returns a planning error if expressions fail to bind.
    fn compile_step(&self) -> Result<RowStep>;
}

pub trait ExecNode: RowProducer + MetricsEmitter + Debug + Send + Sync + Any {
    fn name(&self) -> &'static str;

    fn schema(&self) -> &Schema;

    fn children(&self) -> Vec<PlanRef>;

    /// Same operator over new children.
    ///
    /// # Errors
    ///
    /// Returns a planning error if the number of children is wrong.
    fn with_new_children(&self, children: Vec<PlanRef>) -> Result<PlanRef>;

    fn output_partitioning(&self) -> Partitioning;

    fn output_ordering(&self) -> Vec<SortOrder> {
        Vec::new()
    }

    fn required_child_distribution(&self) -> Vec<Distribution> {
        vec![Distribution::Unspecified; self.children().len()]
    }

    fn required_child_ordering(&self) -> Vec<Vec<SortOrder>> {
        vec![Vec::new(); self.children().len()]
    }

    fn output_format(&self) -> RowFormat;

    fn required_input_format(&self) -> FormatRequirement {
        FormatRequirement::Any
    }

    fn as_compilable(&self) -> Option<&dyn Compilable> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    /// One-line description used by `explain`.
    fn describe(&self) -> String {
        self.name().to_string()
    }

    fn num_partitions(&self) -> usize {
        self.output_partitioning().num_partitions()
    }
}

/// Downcast a plan node to its concrete operator type.
#[must_use]
pub fn downcast<T: ExecNode>(plan: &PlanRef) -> Option<&T> {
    plan.as_any().downcast_ref::<T>()
}

/// Fail unless exactly `expected` children were supplied.
///
/// # Errors
///
/// Returns a planning error naming the operator.
pub fn expect_children(name: &str, children: &[PlanRef], expected: usize) -> Result<()> {
    if children.len() != expected {
        return planning_err(format!(
            "{name} expects {expected} children, got {}",
            children.len()
        ));
    }
    Ok(())
}

/// Rebuild the tree bottom-up, applying `f` to each node after its children.
///
/// # Errors
///
/// Propagates failures from `f` or from rebuilding a node.
pub fn transform_up(plan: &PlanRef, f: &mut dyn FnMut(PlanRef) -> Result<PlanRef>) -> Result<PlanRef> {
    let children = plan.children();
    let node = if children.is_empty() {
        Arc::clone(plan)
    } else {
        let new_children = children
            .iter()
            .map(|c| transform_up(c, f))
            .collect::<Result<Vec<_>>>()?;
        let unchanged = new_children
            .iter()
            .zip(&children)
            .all(|(a, b)| Arc::ptr_eq(a, b));
        if unchanged {
            Arc::clone(plan)
        } else {
            plan.with_new_children(new_children)?
        }
    };
    f(node)
}

/// Visit every node, parents before children.
pub fn for_each_node(plan: &PlanRef, f: &mut dyn FnMut(&PlanRef)) {
    f(plan);
    for child in plan.children() {
        for_each_node(&child, f);
    }
}

/// Number of nodes called `name` in the tree.
#[must_use]
pub fn count_nodes(plan: &PlanRef, name: &str) -> usize {
    let mut n = 0;
    for_each_node(plan, &mut |p| {
        if p.name() == name {
            n += 1;
        }
    });
    n
}

/// Indented, one node per line rendering of a plan tree.
#[must_use]
pub fn render_tree(plan: &PlanRef) -> String {
    let mut out = String::new();
    render_node(plan, 0, &mut out);
    out
}

fn render_node(plan: &PlanRef, depth: usize, out: &mut String) {
    let pad = if depth == 0 {
        String::new()
    } else {
        format!("{}+- ", "   ".repeat(depth - 1))
    };
    let _ = writeln!(
        out,
        "{pad}{} [{}, {}]",
        plan.describe(),
        plan.output_partitioning(),
        plan.output_format()
    );
    for child in plan.children() {
        render_node(&child, depth + 1, out);
    }
}
