use anyhow::Result;
use ironexec::exec::{
    CollectLimitExec, GlobalLimitExec, GlobalLimitMode, LocalLimitExec, TakeOrderedAndProjectExec,
    compute_drops, compute_takes,
};
use ironexec::expr::{SortOrder, col};
use ironexec::plan::count_nodes;
use ironexec::testing::*;
use ironexec::*;
use std::sync::Arc;

fn scan(counts: &[usize]) -> Result<(Schema, PlanRef)> {
    let schema = int_schema(&["id", "bucket"]);
    let plan = memory_scan(&schema, sequential_rows(&schema, counts))?;
    Ok((schema, plan))
}

#[test]
fn drops_spread_excess_evenly() {
    assert_eq!(compute_drops(&[3, 3, 3, 3], 10), vec![1, 1, 0, 0]);
    assert_eq!(compute_drops(&[1, 5, 5], 4), vec![1, 3, 3]);
    assert_eq!(compute_drops(&[2, 2], 10), vec![0, 0]);
    assert_eq!(compute_drops(&[4, 0, 4], 0), vec![4, 0, 4]);
}

#[test]
fn drops_never_exceed_partition_counts() {
    let cases: [(&[u64], u64); 4] = [
        (&[0, 9, 1, 30], 7),
        (&[5, 5, 5], 14),
        (&[100, 1, 1, 1], 50),
        (&[7], 3),
    ];
    for (counts, limit) in cases {
        let drops = compute_drops(counts, limit);
        let kept: u64 = counts.iter().zip(&drops).map(|(c, d)| c - d).sum();
        assert_eq!(kept, limit.min(counts.iter().sum()), "{counts:?} limit {limit}");
        assert!(counts.iter().zip(&drops).all(|(c, d)| d <= c));
    }
}

#[test]
fn takes_fill_in_partition_order() {
    assert_eq!(compute_takes(&[10, 10, 10], 15), vec![10, 5, 0]);
    assert_eq!(compute_takes(&[1, 2], 10), vec![1, 2]);
}

#[test]
fn global_limit_returns_min_of_limit_and_rows_in_every_mode() -> Result<()> {
    let modes = [
        GlobalLimitMode::SinglePartition,
        GlobalLimitMode::Parallel,
        GlobalLimitMode::ParallelKeepFirst,
    ];
    for mode in modes {
        for limit in [0u64, 1, 7, 40, 100] {
            let (_, child) = scan(&[10, 10, 10, 10])?;
            let plan: PlanRef = Arc::new(GlobalLimitExec::with_mode(limit, mode, child));
            let rows = test_runner(test_config())?.collect(&plan)?;
            assert_eq!(rows.len() as u64, limit.min(40), "{mode:?} limit {limit}");
            let mut ids = int_column(&rows, 0);
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), rows.len(), "{mode:?} repeated a row");
        }
    }
    Ok(())
}

#[test]
fn single_partition_limit_gets_an_exchange() -> Result<()> {
    let (_, child) = scan(&[10, 10])?;
    let plan: PlanRef = Arc::new(GlobalLimitExec::new(5, child));
    let runner = test_runner(test_config())?;
    let prepared = runner.prepare(&plan)?;
    assert_eq!(count_nodes(&prepared.plan, "ShuffleExchangeExec"), 1);
    assert_eq!(runner.execute_prepared(&prepared.plan)?.len(), 1);
    Ok(())
}

#[test]
fn parallel_limit_keeps_partitions_in_place() -> Result<()> {
    let (schema, child) = scan(&[10, 10, 10, 10])?;
    let plan: PlanRef = Arc::new(GlobalLimitExec::with_mode(15, GlobalLimitMode::Parallel, child));
    let runner = test_runner(test_config())?;
    let parts = runner.execute(&plan)?;
    assert_eq!(partition_sizes(&parts), vec![3, 4, 4, 4]);
    assert_eq!(count_nodes(&runner.prepare(&plan)?.plan, "ShuffleExchangeExec"), 0);
    assert_eq!(decode_all(parts, &schema)?.len(), 15);
    Ok(())
}

#[test]
fn keep_first_limit_takes_the_leading_rows() -> Result<()> {
    let (schema, child) = scan(&[10, 10, 10, 10])?;
    let plan: PlanRef = Arc::new(GlobalLimitExec::with_mode(
        15,
        GlobalLimitMode::ParallelKeepFirst,
        child,
    ));
    let parts = test_runner(test_config())?.execute(&plan)?;
    assert_eq!(partition_sizes(&parts), vec![10, 5, 0, 0]);
    let ids = int_column(&decode_all(parts, &schema)?, 0);
    assert_eq!(ids, (0..15).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn local_limit_caps_each_partition() -> Result<()> {
    let (_, child) = scan(&[2, 9, 5])?;
    let plan: PlanRef = Arc::new(LocalLimitExec::new(4, child));
    let parts = test_runner(test_config())?.execute(&plan)?;
    assert_eq!(partition_sizes(&parts), vec![2, 4, 4]);
    Ok(())
}

#[test]
fn collect_limit_on_the_driver_stops_early() -> Result<()> {
    let (_, child) = scan(&[3, 0, 0, 4, 6])?;
    let plan: PlanRef = Arc::new(CollectLimitExec::new(5, child));
    let rows = test_runner(test_config())?.collect(&plan)?;
    assert_eq!(int_column(&rows, 0), vec![0, 1, 2, 3, 4]);

    let (_, child) = scan(&[1, 1])?;
    let plan: PlanRef = Arc::new(CollectLimitExec::new(10, child));
    assert_eq!(test_runner(test_config())?.collect(&plan)?.len(), 2);
    Ok(())
}

#[test]
fn collect_limit_as_an_operator_is_one_partition() -> Result<()> {
    let (schema, child) = scan(&[4, 4, 4])?;
    let plan: PlanRef = Arc::new(CollectLimitExec::new(6, child));
    let parts = test_runner(test_config())?.execute(&plan)?;
    assert_eq!(partition_sizes(&parts), vec![6]);
    assert_eq!(int_column(&decode_all(parts, &schema)?, 0), vec![0, 1, 2, 3, 4, 5]);
    Ok(())
}

#[test]
fn take_ordered_returns_top_k_in_order() -> Result<()> {
    let (_, child) = scan(&[7, 13, 5])?;
    let plan: PlanRef = Arc::new(TakeOrderedAndProjectExec::new(
        4,
        vec![SortOrder::desc(col("id"))],
        None,
        child,
    )?);
    let rows = test_runner(test_config())?.collect(&plan)?;
    assert_eq!(int_column(&rows, 0), vec![24, 23, 22, 21]);
    Ok(())
}

#[test]
fn take_ordered_projects_after_selection() -> Result<()> {
    let (_, child) = scan(&[10, 10])?;
    let plan: PlanRef = Arc::new(TakeOrderedAndProjectExec::new(
        3,
        vec![SortOrder::asc(col("bucket")), SortOrder::asc(col("id"))],
        Some(vec![col("id")]),
        child,
    )?);
    assert_eq!(plan.schema().field_names(), vec!["id"]);
    let rows = test_runner(test_config())?.collect(&plan)?;
    assert_eq!(rows, vec![row![0], row![5], row![10]]);
    Ok(())
}

#[test]
fn take_ordered_with_limit_beyond_input() -> Result<()> {
    let (_, child) = scan(&[2, 1])?;
    let plan: PlanRef = Arc::new(TakeOrderedAndProjectExec::new(
        10,
        vec![SortOrder::asc(col("id"))],
        None,
        child,
    )?);
    let rows = test_runner(test_config())?.collect(&plan)?;
    assert_eq!(int_column(&rows, 0), vec![0, 1, 2]);
    Ok(())
}
