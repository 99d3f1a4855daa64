//! Local task harness.
//!
//! The [`Runner`] plays the part of the cluster scheduler for a single process:
//! it prepares a plan, runs every shuffle map stage bottom-up, optionally
//! coalesces small post-shuffle partitions, then runs one result task per
//! output partition. Tasks run in this thread or on a rayon pool.
//!
//! Failures are handled the way a scheduler would: a task failing with a
//! retryable error is re-run up to `max_task_attempts` times, and a fetch
//! failure re-runs the lost map tasks of the named shuffle, at most
//! `max_stage_attempts` times, before the task is retried.

use crate::context::ExecContext;
use crate::error::ExecError;
use crate::exchange::{CoalescedShuffleReadExec, ShuffleExchangeExec, coalesce_partitions};
use crate::exec::CollectLimitExec;
use crate::plan::{PlanRef, downcast, for_each_node, transform_up};
use crate::planner::{PreparedPlan, prepare_for_execution};
use crate::row::{GenericRow, Row, collect_rows};
use crate::task::TaskContext;
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecMode {
    Sequential,
    /// Run a stage's tasks on rayon; `threads` sizes a dedicated pool.
    Parallel { threads: Option<usize> },
}

impl Default for ExecMode {
    fn default() -> Self {
        Self::Parallel { threads: None }
    }
}

pub struct Runner {
    ctx: Arc<ExecContext>,
    mode: ExecMode,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Runner {
    #[must_use]
    pub fn new(ctx: Arc<ExecContext>) -> Self {
        Self {
            ctx,
            mode: ExecMode::default(),
            pool: None,
        }
    }

    /// # Errors
    ///
    /// Returns an error if a dedicated thread pool cannot be built.
    pub fn with_mode(mut self, mode: ExecMode) -> Result<Self> {
        self.pool = match mode {
            ExecMode::Parallel { threads: Some(t) } => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(t.max(1))
                    .build()
                    .context("build task thread pool")?,
            )),
            _ => None,
        };
        self.mode = mode;
        Ok(self)
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<ExecContext> {
        &self.ctx
    }

    #[must_use]
    pub const fn mode(&self) -> ExecMode {
        self.mode
    }

    /// # Errors
    ///
    /// Returns a planning error from any planning pass.
    pub fn prepare(&self, plan: &PlanRef) -> Result<PreparedPlan> {
        prepare_for_execution(plan, &self.ctx)
    }

    /// Prepare and run `plan`, returning the rows of every output partition.
    ///
    /// # Errors
    ///
    /// Returns the first task failure that survived its retries.
    pub fn execute(&self, plan: &PlanRef) -> Result<Vec<Vec<Row>>> {
        let prepared = self.prepare(plan)?;
        self.execute_prepared(&prepared.plan)
    }

    /// Run an already prepared plan.
    ///
    /// # Errors
    ///
    /// Returns the first task failure that survived its retries.
    pub fn execute_prepared(&self, plan: &PlanRef) -> Result<Vec<Vec<Row>>> {
        self.ctx.metrics().record_start();
        let plan = self.run_map_stages(plan)?;
        let partitions: Vec<usize> = (0..plan.num_partitions()).collect();
        let stage = self.ctx.next_stage_id();
        info!(stage, tasks = partitions.len(), root = plan.name(), "running result stage");
        let out = self.run_tasks(stage, &partitions, &plan, |task| {
            collect_rows(plan.execute_partition(task.partition_id(), task)?)
        });
        self.ctx.metrics().record_end();
        self.ctx.report_metrics(&plan);
        out
    }

    /// Prepare and run `plan`, returning all rows decoded in partition order.
    ///
    /// A plan rooted at [`CollectLimitExec`] is collected incrementally on the
    /// driver.
    ///
    /// # Errors
    ///
    /// Returns the first task failure that survived its retries, or a decode
    /// error.
    pub fn collect(&self, plan: &PlanRef) -> Result<Vec<GenericRow>> {
        let prepared = self.prepare(plan)?;
        if downcast::<CollectLimitExec>(&prepared.plan).is_some() {
            let plan = self.run_map_stages(&prepared.plan)?;
            let rows = match downcast::<CollectLimitExec>(&plan) {
                Some(limit) => limit.execute_collect(&self.ctx)?,
                None => Vec::new(),
            };
            self.ctx.report_metrics(&plan);
            return Ok(rows);
        }
        let schema = prepared.plan.schema().clone();
        let mut out = Vec::new();
        for part in self.execute_prepared(&prepared.plan)? {
            for row in part {
                out.push(row.into_generic(&schema)?);
            }
        }
        Ok(out)
    }

    /// Materialize every shuffle bottom-up, coalescing post-shuffle partitions
    /// when adaptive execution is enabled. Returns the plan to run the result
    /// stage over.
    fn run_map_stages(&self, plan: &PlanRef) -> Result<PlanRef> {
        let adaptive = self.ctx.config().adaptive_enabled;
        transform_up(plan, &mut |node| {
            if let Some(exchange) = downcast::<ShuffleExchangeExec>(&node) {
                self.run_map_stage(exchange, &node)?;
            }
            if adaptive {
                self.coalesce_children(node)
            } else {
                Ok(node)
            }
        })
    }

    fn run_map_stage(&self, exchange: &ShuffleExchangeExec, plan: &PlanRef) -> Result<()> {
        let ctx = &self.ctx;
        ctx.shuffles().register(exchange.dependency(ctx));
        let missing = exchange.missing_map_tasks(ctx);
        if missing.is_empty() {
            return Ok(());
        }
        let stage = ctx.next_stage_id();
        info!(
            shuffle_id = exchange.shuffle_id(ctx),
            stage,
            tasks = missing.len(),
            "running shuffle map stage"
        );
        self.run_tasks(stage, &missing, plan, |task| exchange.run_map_task(task))?;
        Ok(())
    }

    /// Read all-shuffle children through one shared set of coalesced ranges.
    fn coalesce_children(&self, node: PlanRef) -> Result<PlanRef> {
        let children = node.children();
        if children.is_empty() || downcast::<CoalescedShuffleReadExec>(&node).is_some() {
            return Ok(node);
        }
        if node
            .required_child_distribution()
            .iter()
            .any(|d| d.required_num_partitions().is_some())
        {
            return Ok(node);
        }
        let mut stats = Vec::with_capacity(children.len());
        for child in &children {
            let Some(exchange) = downcast::<ShuffleExchangeExec>(child) else {
                return Ok(node);
            };
            stats.push(exchange.map_output_statistics(&self.ctx)?);
        }
        let n = stats[0].bytes_by_partition.len();
        if n <= 1 || stats.iter().any(|s| s.bytes_by_partition.len() != n) {
            return Ok(node);
        }
        let config = self.ctx.config();
        let specs = coalesce_partitions(
            &stats,
            config.advisory_partition_size_bytes,
            config.min_coalesced_partitions(),
            config.small_partition_factor,
        )?;
        if specs.len() >= n {
            return Ok(node);
        }
        debug!(operator = node.name(), from = n, to = specs.len(), "coalescing shuffle reads");
        let wrapped = children
            .into_iter()
            .map(|c| Ok(Arc::new(CoalescedShuffleReadExec::new(c, specs.clone())?) as PlanRef))
            .collect::<Result<Vec<_>>>()?;
        node.with_new_children(wrapped)
    }

    /// Run `body` once per partition of a stage, with retries.
    fn run_tasks<T, F>(&self, stage: u64, partitions: &[usize], plan: &PlanRef, body: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&TaskContext) -> Result<T> + Sync,
    {
        match self.mode {
            ExecMode::Sequential => partitions
                .iter()
                .map(|&p| self.run_task(stage, p, plan, &body))
                .collect(),
            ExecMode::Parallel { .. } => {
                let run = || {
                    partitions
                        .par_iter()
                        .map(|&p| self.run_task(stage, p, plan, &body))
                        .collect::<Result<Vec<_>>>()
                };
                match &self.pool {
                    Some(pool) => pool.install(run),
                    None => run(),
                }
            }
        }
    }

    fn run_task<T>(
        &self,
        stage: u64,
        partition: usize,
        plan: &PlanRef,
        body: &(impl Fn(&TaskContext) -> Result<T> + Sync),
    ) -> Result<T> {
        let config = self.ctx.config();
        let max_attempts = config.max_task_attempts.max(1);
        let mut stage_attempts = 0usize;
        let mut attempt = 0usize;
        loop {
            let task = TaskContext::new(Arc::clone(&self.ctx), stage, partition, attempt);
            let err = match body(&task) {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            let classified = ExecError::classify(&err);
            let lost_shuffle = match classified {
                Some(ExecError::FetchFailed { shuffle_id, .. }) => Some(*shuffle_id),
                _ => None,
            };
            let retryable = classified.is_some_and(ExecError::is_retryable);
            attempt += 1;
            if let Some(shuffle_id) = lost_shuffle {
                stage_attempts += 1;
                if stage_attempts >= config.max_stage_attempts.max(1) {
                    return Err(err.context(format!(
                        "shuffle {shuffle_id} failed {stage_attempts} stage attempts"
                    )));
                }
                warn!(stage, partition, shuffle_id, error = %err, "fetch failed, recomputing map stage");
                self.recompute_shuffle(plan, shuffle_id)?;
                continue;
            }
            if !retryable || attempt >= max_attempts {
                return Err(err.context(format!(
                    "task {partition} of stage {stage} failed after {attempt} attempt(s)"
                )));
            }
            warn!(stage, partition, attempt, error = %err, "task failed, retrying");
        }
    }

    /// Re-run the missing map tasks of `shuffle_id`.
    fn recompute_shuffle(&self, plan: &PlanRef, shuffle_id: u64) -> Result<()> {
        let mut found: Option<PlanRef> = None;
        for_each_node(plan, &mut |node| {
            if found.is_none()
                && downcast::<ShuffleExchangeExec>(node)
                    .is_some_and(|e| e.shuffle_id(&self.ctx) == shuffle_id)
            {
                found = Some(Arc::clone(node));
            }
        });
        let Some(node) = found else {
            return Err(ExecError::FetchFailed {
                shuffle_id,
                map_index: 0,
                reason: "no exchange in the plan produces this shuffle".to_string(),
            }
            .into());
        };
        match downcast::<ShuffleExchangeExec>(&node) {
            Some(exchange) => self.run_map_stage(exchange, &node),
            None => Ok(()),
        }
    }
}
