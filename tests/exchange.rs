use anyhow::Result;
use ironexec::error::ExecError;
use ironexec::exchange::{
    BroadcastExchangeExec, CoalescedPartitionSpec, CoalescedShuffleReadExec, MapOutputStatistics,
    ShuffleExchangeExec, coalesce_partitions,
};
use ironexec::expr::{SortOrder, col};
use ironexec::hash::partition_for;
use ironexec::plan::{ExecNode, RowProducer};
use ironexec::row::collect_generic;
use ironexec::testing::*;
use ironexec::*;
use std::sync::Arc;

fn two_column_scan(counts: &[usize]) -> Result<(Schema, PlanRef)> {
    let schema = int_schema(&["id", "bucket"]);
    let scan = memory_scan(&schema, sequential_rows(&schema, counts))?;
    Ok((schema, scan))
}

fn read_partition(plan: &dyn ExecNode, partition: usize, ctx: &Arc<ExecContext>) -> Result<Vec<GenericRow>> {
    let task = TaskContext::for_partition(ctx, partition);
    collect_generic(plan.execute_partition(partition, &task)?, plan.schema())
}

fn map_bytes(scan: &PlanRef, bypass_threshold: usize) -> Result<Vec<Vec<u8>>> {
    let ctx = test_context(test_config().with_bypass_merge_threshold(bypass_threshold))?;
    let exchange = ShuffleExchangeExec::new(Partitioning::hash(vec![col("bucket")], 4), Arc::clone(scan))?;
    exchange.materialize(&ctx)?;
    let id = exchange.shuffle_id(&ctx);
    (0..scan.num_partitions())
        .map(|m| Ok(ctx.shuffles().fetch(id, m)?.to_bytes()))
        .collect()
}

#[test]
fn bypass_and_sort_writers_produce_identical_blocks() -> Result<()> {
    let (_, scan) = two_column_scan(&[40, 25])?;
    let bypass = map_bytes(&scan, 200)?;
    let sorted = map_bytes(&scan, 0)?;
    assert_eq!(bypass, sorted);
    assert!(bypass.iter().all(|b| !b.is_empty()));
    Ok(())
}

#[test]
fn rerunning_a_map_task_reproduces_its_output() -> Result<()> {
    let (_, scan) = two_column_scan(&[30, 30])?;
    let ctx = test_context(test_config())?;
    let exchange = ShuffleExchangeExec::new(Partitioning::RoundRobin(3), scan)?;
    exchange.materialize(&ctx)?;
    let id = exchange.shuffle_id(&ctx);
    let before = ctx.shuffles().fetch(id, 1)?.to_bytes();

    ctx.shuffles().remove_map_output(id, 1);
    assert_eq!(exchange.missing_map_tasks(&ctx), vec![1]);
    exchange.run_map_task(&TaskContext::new(Arc::clone(&ctx), 7, 1, 1))?;
    assert_eq!(ctx.shuffles().fetch(id, 1)?.to_bytes(), before);
    assert!(ctx.shuffles().is_complete(id));
    Ok(())
}

#[test]
fn hash_exchange_clusters_equal_keys() -> Result<()> {
    let (schema, scan) = two_column_scan(&[17, 23, 10])?;
    let ctx = test_context(test_config())?;
    let exchange = ShuffleExchangeExec::new(Partitioning::hash(vec![col("bucket")], 4), scan)?;
    let mut total = 0;
    for p in 0..4 {
        let rows = read_partition(&exchange, p, &ctx)?;
        total += rows.len();
        for row in &rows {
            assert_eq!(partition_for(&[row.get(1).clone()], 4), p);
        }
    }
    assert_eq!(total, 50);
    assert_eq!(schema.len(), exchange.schema().len());
    Ok(())
}

#[test]
fn range_exchange_orders_partitions() -> Result<()> {
    let (_, scan) = two_column_scan(&[60, 40])?;
    let ctx = test_context(test_config())?;
    let exchange = ShuffleExchangeExec::new(
        Partitioning::range(vec![SortOrder::asc(col("id"))], 3),
        scan,
    )?;
    let mut previous_max: Option<i32> = None;
    let mut total = 0;
    for p in 0..3 {
        let ids = int_column(&read_partition(&exchange, p, &ctx)?, 0);
        total += ids.len();
        if let (Some(prev), Some(min)) = (previous_max, ids.iter().min()) {
            assert!(prev < *min, "partition {p} overlaps its predecessor");
        }
        if let Some(max) = ids.iter().max() {
            previous_max = Some(*max);
        }
    }
    assert_eq!(total, 100);
    Ok(())
}

#[test]
fn round_robin_deals_rows_evenly() -> Result<()> {
    let (_, scan) = two_column_scan(&[10, 10])?;
    let ctx = test_context(test_config())?;
    let exchange = ShuffleExchangeExec::new(Partitioning::RoundRobin(4), scan)?;
    let stats = exchange.materialize(&ctx)?;
    assert_eq!(stats.records_by_partition.iter().sum::<u64>(), 20);
    assert!(stats.records_by_partition.iter().all(|&n| (4..=6).contains(&n)));
    Ok(())
}

#[test]
fn lost_map_output_is_a_fetch_failure() -> Result<()> {
    let (_, scan) = two_column_scan(&[5, 5])?;
    let ctx = test_context(test_config())?;
    let exchange = ShuffleExchangeExec::new(Partitioning::hash(vec![col("id")], 2), scan)?;
    exchange.materialize(&ctx)?;
    let id = exchange.shuffle_id(&ctx);
    ctx.shuffles().remove_map_output(id, 0);

    let task = TaskContext::for_partition(&ctx, 0);
    let Err(err) = exchange.execute_partition(0, &task) else {
        panic!("reading a lost map output must fail");
    };
    assert!(matches!(
        ExecError::classify(&err),
        Some(ExecError::FetchFailed { map_index: 0, .. })
    ));
    assert!(ExecError::classify(&err).is_some_and(ExecError::is_retryable));
    Ok(())
}

#[test]
fn reads_wait_for_a_registered_but_unfinished_map_stage() -> Result<()> {
    let (_, scan) = two_column_scan(&[6, 6, 6])?;
    let ctx = test_context(test_config())?;
    let exchange = ShuffleExchangeExec::new(Partitioning::hash(vec![col("id")], 2), scan)?;
    let id = exchange.shuffle_id(&ctx);
    ctx.shuffles().register(exchange.dependency(&ctx));
    exchange.run_map_task(&TaskContext::for_partition(&ctx, 0))?;
    assert!(ctx.shuffles().is_registered(id));
    assert!(!ctx.shuffles().has_completed(id));

    let rows = read_partition(&exchange, 0, &ctx)?.len() + read_partition(&exchange, 1, &ctx)?.len();
    assert_eq!(rows, 18);
    assert!(ctx.shuffles().has_completed(id));

    ctx.shuffles().remove_map_output(id, 2);
    assert!(ctx.shuffles().has_completed(id));
    assert!(!ctx.shuffles().is_complete(id));
    Ok(())
}

#[test]
fn concurrent_reduce_tasks_share_one_map_stage() -> Result<()> {
    let (_, scan) = two_column_scan(&[50, 50, 50, 50])?;
    let ctx = test_context(test_config())?;
    let exchange = ShuffleExchangeExec::new(Partitioning::hash(vec![col("id")], 8), scan)?;
    let counts = std::thread::scope(|s| {
        let readers: Vec<_> = (0..8)
            .map(|p| {
                let (exchange, ctx) = (&exchange, &ctx);
                s.spawn(move || read_partition(exchange, p, ctx).map(|rows| rows.len()))
            })
            .collect();
        readers
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect::<Result<Vec<usize>>>()
    })?;
    assert_eq!(counts.iter().sum::<usize>(), 200);
    assert!(ctx.shuffles().is_complete(exchange.shuffle_id(&ctx)));
    Ok(())
}

#[test]
fn executor_loss_removes_its_outputs() -> Result<()> {
    let (_, scan) = two_column_scan(&[4, 4, 4, 4])?;
    let ctx = test_context(test_config().with_num_executors(2))?;
    let exchange = ShuffleExchangeExec::new(Partitioning::hash(vec![col("id")], 2), scan)?;
    exchange.materialize(&ctx)?;
    assert_eq!(ctx.shuffles().remove_outputs_on_executor(1), 2);
    assert_eq!(exchange.missing_map_tasks(&ctx), vec![1, 3]);
    Ok(())
}

#[test]
fn broadcast_relation_holds_every_row() -> Result<()> {
    let (_, scan) = two_column_scan(&[3, 4])?;
    let ctx = test_context(test_config())?;
    let broadcast = BroadcastExchangeExec::new(scan);
    let task = TaskContext::for_partition(&ctx, 0);
    assert_eq!(broadcast.relation(&task)?.len(), 7);
    assert_eq!(broadcast.output_partitioning(), Partitioning::Broadcast);
    Ok(())
}

fn stats(bytes: &[u64]) -> MapOutputStatistics {
    MapOutputStatistics {
        shuffle_id: 0,
        bytes_by_partition: bytes.to_vec(),
        records_by_partition: vec![1; bytes.len()],
    }
}

fn ranges(specs: &[CoalescedPartitionSpec]) -> Vec<(usize, usize)> {
    specs.iter().map(|s| (s.start, s.end)).collect()
}

#[test]
fn coalescing_merges_small_neighbours() -> Result<()> {
    let specs = coalesce_partitions(&[stats(&[10, 10, 10, 10, 80])], 30, 1, 0.2)?;
    assert_eq!(ranges(&specs), vec![(0, 3), (3, 4), (4, 5)]);
    assert_eq!(specs.iter().map(|s| s.data_size).sum::<u64>(), 120);
    Ok(())
}

#[test]
fn coalescing_empty_shuffle_keeps_one_partition() -> Result<()> {
    let specs = coalesce_partitions(&[stats(&[0, 0, 0])], 64, 1, 0.2)?;
    assert_eq!(ranges(&specs), vec![(0, 3)]);
    Ok(())
}

#[test]
fn coalescing_two_sides_shares_ranges() -> Result<()> {
    let left = stats(&[5, 5, 40, 5]);
    let right = stats(&[5, 5, 0, 5]);
    let specs = coalesce_partitions(&[left.clone(), right], 30, 1, 0.2)?;
    let covered: usize = specs.iter().map(|s| s.end - s.start).sum();
    assert_eq!(covered, 4);
    assert_eq!(specs.first().map(|s| s.start), Some(0));
    assert!(coalesce_partitions(&[left, stats(&[1, 1])], 30, 1, 0.2).is_err());
    Ok(())
}

#[test]
fn coalesced_read_concatenates_reduce_ranges() -> Result<()> {
    let (_, scan) = two_column_scan(&[12, 8])?;
    let ctx = test_context(test_config())?;
    let exchange: PlanRef = Arc::new(ShuffleExchangeExec::new(
        Partitioning::hash(vec![col("bucket")], 4),
        scan,
    )?);
    let spec = |start, end| CoalescedPartitionSpec {
        start,
        end,
        data_size: 0,
    };
    let read = CoalescedShuffleReadExec::new(Arc::clone(&exchange), vec![spec(0, 3), spec(3, 4)])?;
    assert_eq!(read.num_partitions(), 2);
    let first = read_partition(&read, 0, &ctx)?;
    let second = read_partition(&read, 1, &ctx)?;
    assert_eq!(first.len() + second.len(), 20);
    assert!(CoalescedShuffleReadExec::new(exchange, vec![spec(2, 2)]).is_err());
    Ok(())
}

#[test]
fn coalesced_hash_read_claims_no_hash_layout() -> Result<()> {
    let (_, scan) = two_column_scan(&[12, 8])?;
    let exchange: PlanRef = Arc::new(ShuffleExchangeExec::new(
        Partitioning::hash(vec![col("bucket")], 4),
        scan,
    )?);
    let spec = |start, end| CoalescedPartitionSpec {
        start,
        end,
        data_size: 0,
    };
    let read = CoalescedShuffleReadExec::new(exchange, vec![spec(0, 1), spec(1, 4)])?;
    let layout = read.output_partitioning();
    assert_eq!(layout, Partitioning::Unknown(2));
    assert!(!layout.compatible_with(&Partitioning::hash(vec![col("bucket")], 2)));
    assert!(!layout.satisfies(&Distribution::clustered(vec![col("bucket")])));
    Ok(())
}
