//! Physical planning passes run before execution.
//!
//! [`prepare_for_execution`] rewrites an operator tree in three passes:
//!
//! 1. **Ensure requirements** -- insert shuffle or broadcast exchanges under
//!    children whose partitioning does not satisfy the parent's required
//!    distribution, reconcile the partition counts of co-partitioned children,
//!    and insert local sorts where a required ordering is missing.
//! 2. **Row formats** -- insert `ToPackedExec` / `ToBoxedExec` converters where
//!    an operator and its children disagree on the row format.
//! 3. **Whole-stage collapse** -- when enabled, fuse maximal chains of
//!    compilable operators into `WholeStageExec`.
//!
//! None of the passes changes what an operator computes; each only inserts
//! nodes. Every rewrite is recorded as a [`PlannerDecision`] and shown by
//! [`PreparedPlan::explain`].

pub mod codegen;
pub mod ensure_requirements;
pub mod row_format;

pub use codegen::collapse_codegen_stages;
pub use ensure_requirements::ensure_requirements;
pub use row_format::insert_row_conversions;

use crate::context::ExecContext;
use crate::plan::{PlanRef, count_nodes, for_each_node, render_tree};
use crate::row::RowFormat;
use anyhow::Result;
use std::fmt::{Display, Formatter, Result as FormatResult};
use tracing::{debug, info};

/// A rewrite made by one of the planning passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerDecision {
    /// A shuffle exchange was placed under child `child` of `operator`.
    ExchangeInserted {
        operator: &'static str,
        child: usize,
        partitioning: String,
    },
    /// A broadcast exchange was placed under child `child` of `operator`.
    BroadcastInserted { operator: &'static str, child: usize },
    /// The clustered children of `operator` were brought to one partition count.
    PartitionCountReconciled {
        operator: &'static str,
        num_partitions: usize,
    },
    /// A local sort was placed under child `child` of `operator`.
    SortInserted {
        operator: &'static str,
        child: usize,
        ordering: Vec<String>,
    },
    /// A row-format converter was placed under child `child` of `operator`.
    ConverterInserted {
        operator: &'static str,
        child: usize,
        to: RowFormat,
    },
    /// A chain of operators was fused into one stage.
    StageFused {
        stage_id: usize,
        operators: Vec<&'static str>,
    },
}

impl Display for PlannerDecision {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::ExchangeInserted {
                operator,
                child,
                partitioning,
            } => write!(f, "Exchange {partitioning} under {operator} child {child}"),
            Self::BroadcastInserted { operator, child } => {
                write!(f, "BroadcastExchange under {operator} child {child}")
            }
            Self::PartitionCountReconciled {
                operator,
                num_partitions,
            } => write!(f, "{operator} children co-partitioned into {num_partitions} partitions"),
            Self::SortInserted {
                operator,
                child,
                ordering,
            } => write!(f, "Sort [{}] under {operator} child {child}", ordering.join(", ")),
            Self::ConverterInserted {
                operator,
                child,
                to,
            } => write!(f, "Convert to {to} rows under {operator} child {child}"),
            Self::StageFused {
                stage_id,
                operators,
            } => write!(f, "Stage *({stage_id}) fuses {}", operators.join(" <- ")),
        }
    }
}

/// An executable plan plus the rewrites that produced it.
#[derive(Debug, Clone)]
pub struct PreparedPlan {
    pub plan: PlanRef,
    pub decisions: Vec<PlannerDecision>,
}

/// Counts of the nodes the passes care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub operators: usize,
    pub exchanges: usize,
    pub broadcasts: usize,
    pub sorts: usize,
    pub converters: usize,
    pub fused_stages: usize,
    pub output_partitions: usize,
}

/// Human-readable explanation of a prepared plan.
#[derive(Debug, Clone)]
pub struct PlanExplanation {
    pub tree: String,
    pub summary: PlanSummary,
    pub decisions: Vec<PlannerDecision>,
}

impl Display for PlanExplanation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        writeln!(
            f,
            "╔═══════════════════════════════════════════════════════════════╗"
        )?;
        writeln!(
            f,
            "║                  PHYSICAL PLAN EXPLANATION                    ║"
        )?;
        writeln!(
            f,
            "╚═══════════════════════════════════════════════════════════════╝"
        )?;
        writeln!(f)?;

        let s = &self.summary;
        writeln!(
            f,
            "┌─ SUMMARY ────────────────────────────────────────────────────┐"
        )?;
        writeln!(f, "│ Operators:         {:>10}", s.operators)?;
        writeln!(f, "│ Exchanges:         {:>10}", s.exchanges)?;
        writeln!(f, "│ Broadcasts:        {:>10}", s.broadcasts)?;
        writeln!(f, "│ Sorts:             {:>10}", s.sorts)?;
        writeln!(f, "│ Converters:        {:>10}", s.converters)?;
        writeln!(f, "│ Fused Stages:      {:>10}", s.fused_stages)?;
        writeln!(f, "│ Output Partitions: {:>10}", s.output_partitions)?;
        writeln!(
            f,
            "└──────────────────────────────────────────────────────────────┘"
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "┌─ PLAN ───────────────────────────────────────────────────────┐"
        )?;
        for line in self.tree.lines() {
            writeln!(f, "│ {line}")?;
        }
        writeln!(
            f,
            "└──────────────────────────────────────────────────────────────┘"
        )?;

        if !self.decisions.is_empty() {
            writeln!(f)?;
            writeln!(
                f,
                "┌─ REWRITES APPLIED ───────────────────────────────────────────┐"
            )?;
            for decision in &self.decisions {
                writeln!(f, "│ • {decision}")?;
            }
            writeln!(
                f,
                "└──────────────────────────────────────────────────────────────┘"
            )?;
        }
        Ok(())
    }
}

impl PreparedPlan {
    #[must_use]
    pub fn explain(&self) -> PlanExplanation {
        let mut operators = 0;
        for_each_node(&self.plan, &mut |_| operators += 1);
        PlanExplanation {
            tree: render_tree(&self.plan),
            summary: PlanSummary {
                operators,
                exchanges: count_nodes(&self.plan, "ShuffleExchangeExec"),
                broadcasts: count_nodes(&self.plan, "BroadcastExchangeExec"),
                sorts: count_nodes(&self.plan, "SortExec"),
                converters: count_nodes(&self.plan, "ToPackedExec")
                    + count_nodes(&self.plan, "ToBoxedExec"),
                fused_stages: count_nodes(&self.plan, "WholeStageExec"),
                output_partitions: self.plan.num_partitions(),
            },
            decisions: self.decisions.clone(),
        }
    }

    /// Decisions of one kind, for inspection in tests and logs.
    pub fn decisions_matching<'a>(
        &'a self,
        pred: impl Fn(&PlannerDecision) -> bool + 'a,
    ) -> impl Iterator<Item = &'a PlannerDecision> + 'a {
        self.decisions.iter().filter(move |d| pred(d))
    }
}

/// Run the planning passes over `plan`.
///
/// The pass order is fixed: exchanges and sorts first, so converters see the
/// final tree shape; fusion last, so converters are never fused into a chain.
///
/// # Errors
///
/// Returns a planning error from any pass.
pub fn prepare_for_execution(plan: &PlanRef, ctx: &ExecContext) -> Result<PreparedPlan> {
    let config = ctx.config();
    let mut decisions = Vec::new();

    let (plan, ensured) = ensure_requirements(plan, config)?;
    decisions.extend(ensured);

    let (plan, converted) = insert_row_conversions(&plan)?;
    decisions.extend(converted);

    let plan = if config.whole_stage_codegen {
        let (plan, fused) = collapse_codegen_stages(&plan)?;
        decisions.extend(fused);
        plan
    } else {
        plan
    };

    for decision in &decisions {
        debug!(%decision, "planner rewrite");
    }
    info!(
        rewrites = decisions.len(),
        partitions = plan.num_partitions(),
        "prepared physical plan"
    );
    Ok(PreparedPlan { plan, decisions })
}
