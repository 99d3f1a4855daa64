use anyhow::Result;
use ironexec::exec::{BroadcastHashJoinExec, FilterExec, ProjectExec, SortExec, SortMergeJoinExec};
use ironexec::expr::{SortOrder, col, lit};
use ironexec::plan::count_nodes;
use ironexec::planner::PlannerDecision;
use ironexec::row::RowFormat;
use ironexec::testing::*;
use ironexec::*;
use std::sync::Arc;

fn left_rows() -> Vec<GenericRow> {
    (0..20).map(|x| row![x, x * 10]).collect()
}

fn right_rows() -> Vec<GenericRow> {
    (0..20).step_by(2).map(|y| row![y, y + 100]).collect()
}

fn expected_join() -> Vec<GenericRow> {
    (0..20).step_by(2).map(|x| row![x, x * 10, x, x + 100]).collect()
}

fn sort_merge_join(left_parts: usize, right_parts: usize) -> Result<PlanRef> {
    let left = hash_partitioned_scan(&int_schema(&["x", "l"]), left_rows(), &["x"], left_parts)?;
    let right = hash_partitioned_scan(&int_schema(&["y", "r"]), right_rows(), &["y"], right_parts)?;
    Ok(Arc::new(SortMergeJoinExec::new(
        vec![col("x")],
        vec![col("y")],
        left,
        right,
    )?))
}

#[test]
fn co_partitioned_join_shuffles_only_the_smaller_side() -> Result<()> {
    let join = sort_merge_join(8, 4)?;
    let runner = test_runner(test_config())?;
    let prepared = runner.prepare(&join)?;

    assert_eq!(count_nodes(&prepared.plan, "ShuffleExchangeExec"), 1);
    assert_eq!(prepared.plan.num_partitions(), 8);
    let exchanges: Vec<_> = prepared
        .decisions_matching(|d| matches!(d, PlannerDecision::ExchangeInserted { .. }))
        .collect();
    assert_eq!(
        exchanges,
        vec![&PlannerDecision::ExchangeInserted {
            operator: "SortMergeJoinExec",
            child: 1,
            partitioning: "hashpartitioning(y, 8)".into(),
        }]
    );
    assert!(prepared.decisions.contains(&PlannerDecision::PartitionCountReconciled {
        operator: "SortMergeJoinExec",
        num_partitions: 8,
    }));

    assert_eq!(sorted_rows(runner.collect(&join)?), expected_join());
    Ok(())
}

#[test]
fn equally_partitioned_join_needs_no_exchange() -> Result<()> {
    let join = sort_merge_join(4, 4)?;
    let runner = test_runner(test_config())?;
    let prepared = runner.prepare(&join)?;
    assert_eq!(count_nodes(&prepared.plan, "ShuffleExchangeExec"), 0);
    assert_eq!(count_nodes(&prepared.plan, "SortExec"), 2);
    assert_eq!(sorted_rows(runner.collect(&join)?), expected_join());
    Ok(())
}

#[test]
fn unpartitioned_join_inputs_are_both_shuffled() -> Result<()> {
    let left = memory_scan(&int_schema(&["x", "l"]), vec![left_rows()])?;
    let right = memory_scan(&int_schema(&["y", "r"]), vec![right_rows(), Vec::new()])?;
    let join: PlanRef = Arc::new(SortMergeJoinExec::new(vec![col("x")], vec![col("y")], left, right)?);
    let runner = test_runner(test_config())?;
    let prepared = runner.prepare(&join)?;
    assert_eq!(count_nodes(&prepared.plan, "ShuffleExchangeExec"), 2);
    assert_eq!(prepared.plan.num_partitions(), 4);
    assert_eq!(sorted_rows(runner.collect(&join)?), expected_join());
    Ok(())
}

#[test]
fn broadcast_join_broadcasts_the_build_side() -> Result<()> {
    let left = memory_scan(&int_schema(&["x", "l"]), vec![left_rows()[..7].to_vec(), left_rows()[7..].to_vec()])?;
    let right = memory_scan(&int_schema(&["y", "r"]), vec![right_rows()])?;
    let join: PlanRef = Arc::new(BroadcastHashJoinExec::new(vec![col("x")], vec![col("y")], left, right)?);
    let runner = test_runner(test_config())?;
    let prepared = runner.prepare(&join)?;
    assert_eq!(count_nodes(&prepared.plan, "BroadcastExchangeExec"), 1);
    assert_eq!(count_nodes(&prepared.plan, "ShuffleExchangeExec"), 0);
    assert!(prepared.decisions.contains(&PlannerDecision::BroadcastInserted {
        operator: "BroadcastHashJoinExec",
        child: 1,
    }));
    assert_eq!(prepared.plan.num_partitions(), 2);
    assert_eq!(sorted_rows(runner.collect(&join)?), expected_join());
    Ok(())
}

#[test]
fn global_sort_gets_a_range_exchange() -> Result<()> {
    let schema = int_schema(&["id", "bucket"]);
    let scan = memory_scan(&schema, sequential_rows(&schema, &[7, 13, 5]))?;
    let sort: PlanRef = Arc::new(SortExec::new(vec![SortOrder::desc(col("id"))], true, scan)?);
    let runner = test_runner(test_config())?;
    let prepared = runner.prepare(&sort)?;
    assert_eq!(count_nodes(&prepared.plan, "ShuffleExchangeExec"), 1);
    assert!(prepared.decisions.iter().any(|d| matches!(
        d,
        PlannerDecision::ExchangeInserted { partitioning, .. } if partitioning.starts_with("rangepartitioning")
    )));
    let ids = int_column(&runner.collect(&sort)?, 0);
    assert_eq!(ids, (0..25).rev().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn local_sort_over_boxed_rows_gets_a_packing_converter() -> Result<()> {
    let schema = int_schema(&["id", "bucket"]);
    let scan = memory_scan(&schema, sequential_rows(&schema, &[4, 4]))?;
    assert_eq!(scan.output_format(), RowFormat::Boxed);
    let sort: PlanRef = Arc::new(SortExec::new(vec![SortOrder::asc(col("bucket"))], false, scan)?);
    let prepared = test_runner(test_config())?.prepare(&sort)?;
    assert_eq!(count_nodes(&prepared.plan, "ToPackedExec"), 1);
    assert!(prepared.decisions.contains(&PlannerDecision::ConverterInserted {
        operator: "SortExec",
        child: 0,
        to: RowFormat::Packed,
    }));
    assert_eq!(count_nodes(&prepared.plan, "ShuffleExchangeExec"), 0);
    Ok(())
}

#[test]
fn packed_input_needs_no_rewrites() -> Result<()> {
    let schema = int_schema(&["id", "bucket"]);
    let scan = ScanBuilder::new(schema.clone())
        .partitions(sequential_rows(&schema, &[6]))
        .packed()
        .build()?;
    let sorted: PlanRef = Arc::new(SortExec::new(vec![SortOrder::asc(col("id"))], false, scan)?);
    let again: PlanRef = Arc::new(SortExec::new(vec![SortOrder::asc(col("id"))], false, sorted)?);
    let prepared = test_runner(test_config())?.prepare(&again)?;
    assert_eq!(count_nodes(&prepared.plan, "SortExec"), 2);
    assert!(prepared.decisions.is_empty());
    Ok(())
}

fn filter_project(schema: &Schema) -> Result<PlanRef> {
    let scan = memory_scan(schema, sequential_rows(schema, &[10, 10]))?;
    let filter: PlanRef = Arc::new(FilterExec::new(col("id").gt_eq(lit(10)), scan)?);
    Ok(Arc::new(ProjectExec::new(
        vec![col("id"), col("id").times(lit(2)).alias("twice")],
        filter,
    )?))
}

#[test]
fn codegen_fuses_compilable_chains_without_changing_rows() -> Result<()> {
    let schema = int_schema(&["id", "bucket"]);
    let plan = filter_project(&schema)?;

    let fused_runner = test_runner(test_config())?;
    let prepared = fused_runner.prepare(&plan)?;
    assert_eq!(count_nodes(&prepared.plan, "WholeStageExec"), 1);
    assert!(prepared.decisions.contains(&PlannerDecision::StageFused {
        stage_id: 1,
        operators: vec!["ProjectExec", "FilterExec"],
    }));
    let fused = fused_runner.collect(&plan)?;

    let plain_runner = test_runner(test_config().with_whole_stage_codegen(false))?;
    assert_eq!(count_nodes(&plain_runner.prepare(&plan)?.plan, "WholeStageExec"), 0);
    let plain = plain_runner.collect(&plan)?;

    assert_rows_equal(&fused, &plain);
    assert_eq!(fused.len(), 10);
    assert_eq!(fused[0], row![10, 20]);
    Ok(())
}

#[test]
fn explain_lists_summary_plan_and_rewrites() -> Result<()> {
    let join = sort_merge_join(8, 4)?;
    let prepared = test_runner(test_config())?.prepare(&join)?;
    let explanation = prepared.explain();
    assert_eq!(explanation.summary.exchanges, 1);
    assert_eq!(explanation.summary.sorts, 2);
    assert_eq!(explanation.summary.output_partitions, 8);

    let text = explanation.to_string();
    for section in ["SUMMARY", "PLAN", "REWRITES APPLIED", "SortMergeJoinExec", "hashpartitioning(y, 8)"] {
        assert!(text.contains(section), "missing {section} in:\n{text}");
    }
    Ok(())
}

#[test]
fn prepared_plan_without_rewrites_has_no_rewrite_section() -> Result<()> {
    let schema = int_schema(&["id"]);
    let scan = memory_scan(&schema, sequential_rows(&schema, &[3]))?;
    let prepared = test_runner(test_config())?.prepare(&scan)?;
    assert!(prepared.decisions.is_empty());
    assert!(!prepared.explain().to_string().contains("REWRITES APPLIED"));
    Ok(())
}
