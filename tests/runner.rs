use anyhow::Result;
use ironexec::error::ExecError;
use ironexec::exchange::ShuffleExchangeExec;
use ironexec::exec::{FilterExec, SortExec, SortMergeJoinExec};
use ironexec::expr::{SortOrder, col, lit};
use ironexec::metrics::MetricSet;
use ironexec::plan::{MetricsEmitter, RowProducer, downcast};
use ironexec::row::{BoxRowIter, RowFormat};
use ironexec::testing::*;
use ironexec::*;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Drops map output 0 of the shuffle below it before reading, `losses` times.
#[derive(Debug)]
struct LosesMapOutput {
    child: PlanRef,
    losses: Arc<AtomicUsize>,
    metrics: Arc<MetricSet>,
}

impl LosesMapOutput {
    fn wrap(child: PlanRef, losses: usize) -> PlanRef {
        Arc::new(Self {
            child,
            losses: Arc::new(AtomicUsize::new(losses)),
            metrics: Arc::new(MetricSet::new(&[])),
        })
    }
}

impl RowProducer for LosesMapOutput {
    fn execute_partition(&self, partition: usize, task: &TaskContext) -> Result<BoxRowIter> {
        let lose = self
            .losses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            if let Some(exchange) = downcast::<ShuffleExchangeExec>(&self.child) {
                let id = exchange.shuffle_id(task.exec());
                task.exec().shuffles().remove_map_output(id, 0);
            }
        }
        self.child.execute_partition(partition, task)
    }
}

impl MetricsEmitter for LosesMapOutput {
    fn metrics(&self) -> &MetricSet {
        &self.metrics
    }
}

impl ExecNode for LosesMapOutput {
    fn name(&self) -> &'static str {
        "LosesMapOutput"
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn children(&self) -> Vec<PlanRef> {
        vec![Arc::clone(&self.child)]
    }

    fn with_new_children(&self, mut children: Vec<PlanRef>) -> Result<PlanRef> {
        Ok(Arc::new(Self {
            child: children.remove(0),
            losses: Arc::clone(&self.losses),
            metrics: Arc::clone(&self.metrics),
        }))
    }

    fn output_partitioning(&self) -> Partitioning {
        self.child.output_partitioning()
    }

    fn output_format(&self) -> RowFormat {
        self.child.output_format()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn shuffled(counts: &[usize], partitions: usize) -> Result<PlanRef> {
    let schema = int_schema(&["id", "bucket"]);
    let scan = memory_scan(&schema, sequential_rows(&schema, counts))?;
    Ok(Arc::new(ShuffleExchangeExec::new(
        Partitioning::hash(vec![col("bucket")], partitions),
        scan,
    )?))
}

#[test]
fn lost_map_output_is_recomputed() -> Result<()> {
    let plan = LosesMapOutput::wrap(shuffled(&[10, 10], 2)?, 1);
    let rows = test_runner(test_config())?.collect(&plan)?;
    let mut ids = int_column(&rows, 0);
    ids.sort_unstable();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn repeated_fetch_failures_exhaust_stage_attempts() -> Result<()> {
    let plan = LosesMapOutput::wrap(shuffled(&[10, 10], 2)?, usize::MAX);
    let err = test_runner(test_config())?
        .collect(&plan)
        .expect_err("map output is lost on every attempt");
    assert!(matches!(
        ExecError::classify(&err),
        Some(ExecError::FetchFailed { map_index: 0, .. })
    ));
    assert!(format!("{err:#}").contains("stage attempts"));
    Ok(())
}

#[test]
fn parallel_and_sequential_runs_agree() -> Result<()> {
    let left = memory_scan(
        &int_schema(&["x", "l"]),
        sequential_rows(&int_schema(&["x", "l"]), &[30, 20, 10]),
    )?;
    let right = memory_scan(
        &int_schema(&["y", "r"]),
        sequential_rows(&int_schema(&["y", "r"]), &[25, 25]),
    )?;
    let join: PlanRef = Arc::new(SortMergeJoinExec::new(vec![col("x")], vec![col("y")], left, right)?);

    let sequential = test_runner(test_config())?.collect(&join)?;
    let ctx = test_context(test_config().with_adaptive(false))?;
    let parallel = Runner::new(ctx)
        .with_mode(ExecMode::Parallel { threads: Some(2) })?
        .collect(&join)?;

    assert_eq!(sequential.len(), 50);
    assert_rows_unordered_equal(&parallel, &sequential);
    Ok(())
}

#[test]
fn adaptive_execution_coalesces_small_shuffle_partitions() -> Result<()> {
    let plan = |ctx_partitions: usize| -> Result<PlanRef> {
        Ok(Arc::new(FilterExec::new(
            col("id").gt_eq(lit(0)),
            shuffled(&[20, 20], ctx_partitions)?,
        )?))
    };
    let adaptive = Runner::new(test_context(test_config().with_shuffle_partitions(8))?)
        .with_mode(ExecMode::Sequential)?;
    let parts = adaptive.execute(&plan(8)?)?;
    assert_eq!(parts.len(), 1);
    assert_eq!(partition_sizes(&parts), vec![40]);

    let fixed = test_runner(test_config().with_shuffle_partitions(8))?;
    let parts = fixed.execute(&plan(8)?)?;
    assert_eq!(parts.len(), 8);
    assert_eq!(partition_sizes(&parts).iter().sum::<usize>(), 40);
    Ok(())
}

#[test]
fn runner_reports_the_prepared_plan() -> Result<()> {
    let schema = int_schema(&["id", "bucket"]);
    let scan = memory_scan(&schema, sequential_rows(&schema, &[5, 5]))?;
    let sort: PlanRef = Arc::new(SortExec::new(vec![SortOrder::asc(col("bucket"))], true, scan)?);
    let runner = test_runner(test_config())?;
    let rows = runner.collect(&sort)?;
    let buckets = int_column(&rows, 1);
    assert!(buckets.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(runner.mode(), ExecMode::Sequential);
    assert!(!runner.context().config().adaptive_enabled);
    Ok(())
}

#[test]
fn execution_metrics_are_timed_and_exported() -> Result<()> {
    let schema = int_schema(&["id", "bucket"]);
    let scan = memory_scan(&schema, sequential_rows(&schema, &[6, 4]))?;
    let filter: PlanRef = Arc::new(FilterExec::new(col("id").lt(lit(7)), scan)?);
    let runner = test_runner(test_config())?;
    let metrics = runner.context().metrics();
    assert!(metrics.elapsed().is_none());

    assert_eq!(runner.collect(&filter)?.len(), 7);
    assert!(metrics.elapsed().is_some());

    let exported = metrics.to_json();
    assert!(exported.get("execution_time_ms").is_some());
    let scan_rows = exported
        .as_object()
        .into_iter()
        .flatten()
        .find(|(name, _)| name.starts_with("RowSourceScanExec#") && name.ends_with(".numOutputRows"))
        .map(|(_, metric)| metric["value"].clone());
    assert_eq!(scan_rows, Some(10.into()));
    Ok(())
}

#[cfg(feature = "spilling")]
#[test]
fn sort_spills_past_the_threshold_and_still_orders() -> Result<()> {
    use ironexec::metrics::NUM_SPILLS;
    use ironexec::row::collect_generic;

    let schema = int_schema(&["id", "bucket"]);
    let scan = ScanBuilder::new(schema.clone())
        .partitions(sequential_rows(&schema, &[500]))
        .packed()
        .build()?;
    let sort = SortExec::new(
        vec![SortOrder::asc(col("bucket")), SortOrder::desc(col("id"))],
        false,
        scan,
    )?;
    let ctx = test_context(test_config().with_sort_spill_threshold(256))?;
    let task = TaskContext::for_partition(&ctx, 0);
    let rows = collect_generic(sort.execute_partition(0, &task)?, sort.schema())?;

    assert!(sort.metrics().get(NUM_SPILLS) > 0);
    assert_eq!(rows.len(), 500);
    assert_eq!(rows[0], row![495, 0]);
    assert_eq!(rows[499], row![4, 4]);
    let keys: Vec<(i32, i32)> = int_column(&rows, 1)
        .into_iter()
        .zip(int_column(&rows, 0))
        .collect();
    assert!(keys.windows(2).all(|w| w[0].0 < w[1].0 || (w[0].0 == w[1].0 && w[0].1 > w[1].1)));
    Ok(())
}
