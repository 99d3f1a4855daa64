#![cfg(feature = "io-jsonl")]

use anyhow::Result;
use ironexec::error::ExecError;
use ironexec::expr::{RuntimeFilter, col, lit};
use ironexec::hash::partition_for;
use ironexec::metrics::PRUNED_PARTITIONS;
use ironexec::plan::{ExecNode, MetricsEmitter, RowProducer};
use ironexec::row::collect_generic;
use ironexec::scan::{
    BucketSpec, FileSourceScanExec, FileStatus, PartitionDirectory, pack_partitions, split_files,
};
use ironexec::testing::*;
use ironexec::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

fn day_schema() -> Schema {
    Schema::new(vec![Field::new("day", DataType::Int, true)])
}

/// Three `day=N` directories holding ids `10*N .. 10*N + 4`.
fn daily_table(dir: &TempDir) -> Result<Schema> {
    let data = int_schema(&["id", "bucket"]);
    let days: Vec<(String, Vec<GenericRow>)> = (1..=3)
        .map(|d| {
            let rows = (0..5).map(|i| row![10 * d + i, i % 5]).collect();
            (d.to_string(), rows)
        })
        .collect();
    let borrowed: Vec<(&str, Vec<GenericRow>)> =
        days.iter().map(|(d, rows)| (d.as_str(), rows.clone())).collect();
    write_partitioned_table(dir.path(), "day", &data, &borrowed)?;
    Ok(data)
}

fn scan_rows(scan: &FileSourceScanExec, config: ExecConfig) -> Result<Vec<Vec<GenericRow>>> {
    let ctx = test_context(config)?;
    (0..scan.num_partitions())
        .map(|p| {
            let task = TaskContext::for_partition(&ctx, p);
            collect_generic(scan.execute_partition(p, &task)?, scan.schema())
        })
        .collect()
}

#[test]
fn partition_columns_follow_data_columns() -> Result<()> {
    let dir = TempDir::new()?;
    let data = daily_table(&dir)?;
    let relation = jsonl_relation(dir.path(), data, day_schema(), None)?;
    let scan = FileSourceScanExec::new(relation, Vec::new(), &test_config())?;
    assert_eq!(scan.schema().field_names(), vec!["id", "bucket", "day"]);
    let rows: Vec<GenericRow> = scan_rows(&scan, test_config())?.concat();
    assert_eq!(rows.len(), 15);
    assert!(rows.iter().all(|r| match (r.get(0), r.get(2)) {
        (Value::Int(id), Value::Int(day)) => id / 10 == *day,
        _ => false,
    }));
    Ok(())
}

#[test]
fn static_partition_filters_prune_directories() -> Result<()> {
    let dir = TempDir::new()?;
    let data = daily_table(&dir)?;
    let relation = jsonl_relation(dir.path(), data, day_schema(), None)?;
    let scan = FileSourceScanExec::new(
        Arc::clone(&relation),
        vec![col("day").gt_eq(lit(2))],
        &test_config(),
    )?;
    assert_eq!(scan.selected_partitions()?.len(), 2);
    let rows = scan_rows(&scan, test_config())?.concat();
    assert_eq!(rows.len(), 10);

    let bad = FileSourceScanExec::new(relation, vec![col("id").equal(lit(1))], &test_config());
    assert!(bad.is_err(), "filters on data columns are not partition filters");
    Ok(())
}

#[test]
fn dynamic_pruning_waits_for_the_runtime_filter() -> Result<()> {
    let dir = TempDir::new()?;
    let data = daily_table(&dir)?;
    let relation = jsonl_relation(dir.path(), data, day_schema(), None)?;
    let filter = RuntimeFilter::new("days_from_build_side");
    let scan = FileSourceScanExec::new(
        Arc::clone(&relation),
        vec![col("day").in_runtime_filter(Arc::clone(&filter))],
        &test_config(),
    )?;

    assert_eq!(scan.dynamically_selected_partitions()?.len(), 3);
    assert_eq!(scan_rows(&scan, test_config())?.concat().len(), 15);

    filter.resolve([Value::Int(2)])?;
    let kept = scan.dynamically_selected_partitions()?;
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].values, vec![Value::Int(2)]);
    let rows = scan_rows(&scan, test_config())?.concat();
    assert_eq!(int_column(&rows, 0), vec![20, 21, 22, 23, 24]);
    assert_eq!(scan.metrics().get(PRUNED_PARTITIONS), 2);

    scan.selected_partitions()?;
    scan.dynamically_selected_partitions()?;
    assert_eq!(relation.index.listing_count(), 1);
    Ok(())
}

#[test]
fn late_runtime_filter_keeps_the_partition_count() -> Result<()> {
    let dir = TempDir::new()?;
    let data = daily_table(&dir)?;
    let relation = jsonl_relation(dir.path(), data, day_schema(), None)?;
    let config = ExecConfig {
        max_partition_bytes: 1000,
        open_cost_bytes: 1000,
        ..test_config()
    };
    let filter = RuntimeFilter::new("days_from_build_side");
    let scan = FileSourceScanExec::new(
        relation,
        vec![col("day").in_runtime_filter(Arc::clone(&filter))],
        &config,
    )?;
    assert_eq!(scan.num_partitions(), 3);

    filter.resolve([Value::Int(2)])?;
    assert_eq!(scan.num_partitions(), 3);
    let parts = scan_rows(&scan, config)?;
    assert_eq!(parts.iter().filter(|p| p.is_empty()).count(), 2);
    let rows = parts.concat();
    assert_eq!(int_column(&rows, 0), vec![20, 21, 22, 23, 24]);
    assert_eq!(scan.metrics().get(PRUNED_PARTITIONS), 2);
    Ok(())
}

#[test]
fn jsonl_splits_read_every_line_once() -> Result<()> {
    let dir = TempDir::new()?;
    let lines: Vec<serde_json::Value> = (0..300)
        .map(|i| json!({"id": i, "bucket": i % 5, "note": "x".repeat(i % 13)}))
        .collect();
    let size = write_jsonl_file(&dir.path().join("events.jsonl"), &lines)?;
    let config = ExecConfig {
        max_partition_bytes: 700,
        open_cost_bytes: 32,
        ..test_config()
    };
    let relation = jsonl_relation(dir.path(), int_schema(&["id", "bucket"]), Schema::new(Vec::new()), None)?;
    let scan = FileSourceScanExec::new(relation, Vec::new(), &config)?;
    let parts = scan.file_partitions()?;
    assert!(parts.len() > 1, "a {size} byte file should be split");
    let covered: u64 = parts.iter().map(|p| p.total_bytes()).sum();
    assert_eq!(covered, size);

    let mut ids = int_column(&scan_rows(&scan, config)?.concat(), 0);
    ids.sort_unstable();
    assert_eq!(ids, (0..300).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn splits_pack_largest_first_with_open_cost() {
    let dir = PartitionDirectory {
        values: Vec::new(),
        files: vec![
            FileStatus::new("/t/small", 5 * MIB),
            FileStatus::new("/t/big", 50 * MIB),
            FileStatus::new("/t/mid", 10 * MIB),
        ],
    };
    let splits = split_files(&[dir], 64 * MIB, true);
    let parts = pack_partitions(splits, 64 * MIB, 4 * MIB);
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].total_bytes(), 50 * MIB);
    assert_eq!(parts[1].total_bytes(), 15 * MIB);
    assert_eq!(parts[1].index, 1);
}

#[test]
fn bucketed_scan_has_one_partition_per_bucket() -> Result<()> {
    let dir = TempDir::new()?;
    let data = int_schema(&["id", "bucket"]);
    let rows = sequential_rows(&data, &[40]).concat();
    write_bucketed_table(dir.path(), &data, &rows, &["id"], 4)?;
    let spec = BucketSpec {
        num_buckets: 4,
        bucket_columns: vec!["id".into()],
    };
    let relation = jsonl_relation(dir.path(), data, Schema::new(Vec::new()), Some(spec))?;
    let scan = FileSourceScanExec::new(relation, Vec::new(), &test_config())?;
    assert_eq!(scan.output_partitioning(), Partitioning::hash(vec![col("id")], 4));

    let parts = scan_rows(&scan, test_config())?;
    assert_eq!(parts.len(), 4);
    assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), 40);
    for (bucket, part) in parts.iter().enumerate() {
        for row in part {
            assert_eq!(partition_for(&[row.get(0).clone()], 4), bucket);
        }
    }
    Ok(())
}

#[test]
fn bucket_set_leaves_other_buckets_empty() -> Result<()> {
    let dir = TempDir::new()?;
    let data = int_schema(&["id", "bucket"]);
    let rows = sequential_rows(&data, &[40]).concat();
    write_bucketed_table(dir.path(), &data, &rows, &["id"], 4)?;
    let spec = BucketSpec {
        num_buckets: 4,
        bucket_columns: vec!["id".into()],
    };
    let relation = jsonl_relation(dir.path(), data, Schema::new(Vec::new()), Some(spec))?;
    let scan = FileSourceScanExec::new(Arc::clone(&relation), Vec::new(), &test_config())?
        .with_bucket_set(BTreeSet::from([1]));
    let sizes: Vec<usize> = scan_rows(&scan, test_config())?.iter().map(Vec::len).collect();
    assert_eq!(sizes.len(), 4);
    assert!(sizes.iter().enumerate().all(|(b, n)| b == 1 || *n == 0));

    let flat = FileSourceScanExec::new(relation, Vec::new(), &test_config())?.without_bucketed_scan();
    assert!(matches!(flat.output_partitioning(), Partitioning::Unknown(_)));
    Ok(())
}

#[test]
fn file_without_bucket_id_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    write_jsonl_file(&dir.path().join("part-00000_00001.jsonl"), &[json!({"id": 1})])?;
    write_jsonl_file(&dir.path().join("stray.jsonl"), &[json!({"id": 2})])?;
    let spec = BucketSpec {
        num_buckets: 4,
        bucket_columns: vec!["id".into()],
    };
    let relation = jsonl_relation(dir.path(), int_schema(&["id"]), Schema::new(Vec::new()), Some(spec))?;
    let err = FileSourceScanExec::new(relation, Vec::new(), &test_config())
        .expect_err("stray.jsonl carries no bucket id");
    assert!(matches!(
        ExecError::classify(&err),
        Some(ExecError::InvalidBucketFile(_))
    ));
    Ok(())
}

#[test]
fn bucket_id_out_of_range_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    write_jsonl_file(&dir.path().join("part-00000_00009.jsonl"), &[json!({"id": 1})])?;
    let spec = BucketSpec {
        num_buckets: 4,
        bucket_columns: vec!["id".into()],
    };
    let relation = jsonl_relation(dir.path(), int_schema(&["id"]), Schema::new(Vec::new()), Some(spec))?;
    assert!(FileSourceScanExec::new(relation, Vec::new(), &test_config()).is_err());
    Ok(())
}

#[test]
fn malformed_line_is_a_task_failure() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("broken.jsonl"), "{\"id\": 1}\nnot json\n")?;
    let relation = jsonl_relation(dir.path(), int_schema(&["id"]), Schema::new(Vec::new()), None)?;
    let scan: PlanRef = Arc::new(FileSourceScanExec::new(relation, Vec::new(), &test_config())?);
    assert!(test_runner(test_config())?.collect(&scan).is_err());
    Ok(())
}
