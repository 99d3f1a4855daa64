use anyhow::Result;
use ironexec::exec::{
    BroadcastHashJoinExec, FilterExec, GenerateExec, Generator, SortMergeJoinExec, ToBoxedExec,
    ToPackedExec,
};
use ironexec::expr::{col, lit};
use ironexec::row::RowFormat;
use ironexec::testing::*;
use ironexec::*;
use std::sync::Arc;

fn tagged_arrays() -> Schema {
    Schema::new(vec![
        Field::new("tag", DataType::Int, false),
        Field::new("items", DataType::Array(Box::new(DataType::Int)), true),
    ])
}

fn array_rows() -> Vec<GenericRow> {
    vec![
        GenericRow::new(vec![Value::Int(1), Value::Array(vec![Value::Int(10), Value::Int(11)])]),
        GenericRow::new(vec![Value::Int(2), Value::Array(Vec::new())]),
        GenericRow::new(vec![Value::Int(3), Value::Null]),
        GenericRow::new(vec![Value::Int(4), Value::Array(vec![Value::Int(40)])]),
    ]
}

fn generate(generator: Generator, outer: bool) -> Result<PlanRef> {
    let scan = memory_scan(&tagged_arrays(), vec![array_rows()])?;
    Ok(Arc::new(GenerateExec::new(generator, outer, "item", scan)?))
}

fn tag_and_last(rows: &[GenericRow]) -> Vec<(i32, Value)> {
    rows.iter()
        .map(|r| {
            let Value::Int(tag) = r.get(0) else { unreachable!("tag is never null") };
            (*tag, r.values().last().cloned().unwrap_or(Value::Null))
        })
        .collect()
}

#[test]
fn explode_emits_one_row_per_element() -> Result<()> {
    let plan = generate(Generator::Explode(col("items")), false)?;
    assert_eq!(plan.schema().field_names(), vec!["tag", "items", "item"]);
    let rows = test_runner(test_config())?.collect(&plan)?;
    assert_eq!(
        tag_and_last(&rows),
        vec![(1, Value::Int(10)), (1, Value::Int(11)), (4, Value::Int(40))]
    );
    Ok(())
}

#[test]
fn outer_explode_keeps_empty_and_null_arrays() -> Result<()> {
    let plan = generate(Generator::Explode(col("items")), true)?;
    let rows = test_runner(test_config())?.collect(&plan)?;
    assert_eq!(
        tag_and_last(&rows),
        vec![
            (1, Value::Int(10)),
            (1, Value::Int(11)),
            (2, Value::Null),
            (3, Value::Null),
            (4, Value::Int(40)),
        ]
    );
    Ok(())
}

#[test]
fn posexplode_numbers_elements_from_zero() -> Result<()> {
    let plan = generate(Generator::PosExplode(col("items")), true)?;
    assert_eq!(plan.schema().field_names(), vec!["tag", "items", "pos", "item"]);
    let rows = test_runner(test_config())?.collect(&plan)?;
    let positions: Vec<Value> = rows.iter().map(|r| r.get(2).clone()).collect();
    assert_eq!(
        positions,
        vec![Value::Int(0), Value::Int(1), Value::Null, Value::Null, Value::Int(0)]
    );
    Ok(())
}

#[test]
fn exploding_a_scalar_is_rejected() -> Result<()> {
    let scan = memory_scan(&tagged_arrays(), vec![array_rows()])?;
    assert!(GenerateExec::new(Generator::Explode(col("tag")), false, "item", scan).is_err());
    Ok(())
}

#[test]
fn filter_drops_rows_whose_predicate_is_null() -> Result<()> {
    let schema = int_schema(&["id", "score"]);
    let rows = vec![
        row![1, 5],
        row![2, Value::Null],
        row![3, 9],
        row![4, 1],
    ];
    let scan = memory_scan(&schema, vec![rows])?;
    let plan: PlanRef = Arc::new(FilterExec::new(col("score").gt_eq(lit(5)), scan)?);
    let kept = test_runner(test_config().with_whole_stage_codegen(false))?.collect(&plan)?;
    assert_eq!(int_column(&kept, 0), vec![1, 3]);

    let not_null: PlanRef = Arc::new(FilterExec::new(col("score").is_not_null(), memory_scan(
        &schema,
        vec![vec![row![1, Value::Null], row![2, 2]]],
    )?)?);
    assert_eq!(test_runner(test_config())?.collect(&not_null)?, vec![row![2, 2]]);
    Ok(())
}

fn with_null_keys(schema: &Schema, rows: Vec<GenericRow>) -> Result<PlanRef> {
    memory_scan(schema, vec![rows])
}

#[test]
fn null_join_keys_never_match() -> Result<()> {
    let left_schema = int_schema(&["x", "l"]);
    let right_schema = int_schema(&["y", "r"]);
    let left = || with_null_keys(&left_schema, vec![row![1, 10], row![Value::Null, 20], row![2, 30]]);
    let right = || with_null_keys(&right_schema, vec![row![Value::Null, 200], row![2, 300]]);
    let expected = vec![row![2, 30, 2, 300]];

    let smj: PlanRef = Arc::new(SortMergeJoinExec::new(vec![col("x")], vec![col("y")], left()?, right()?)?);
    assert_eq!(test_runner(test_config())?.collect(&smj)?, expected);

    let bhj: PlanRef = Arc::new(BroadcastHashJoinExec::new(vec![col("x")], vec![col("y")], left()?, right()?)?);
    assert_eq!(test_runner(test_config())?.collect(&bhj)?, expected);
    Ok(())
}

#[test]
fn duplicate_keys_produce_every_pairing() -> Result<()> {
    let left = memory_scan(&int_schema(&["x", "l"]), vec![vec![row![7, 1], row![7, 2], row![8, 3]]])?;
    let right = memory_scan(&int_schema(&["y", "r"]), vec![vec![row![7, 10], row![7, 20], row![7, 30]]])?;
    let join: PlanRef = Arc::new(SortMergeJoinExec::new(vec![col("x")], vec![col("y")], left, right)?);
    assert_eq!(join.schema().field_names(), vec!["x", "l", "y", "r"]);
    let rows = sorted_rows(test_runner(test_config())?.collect(&join)?);
    let expected: Vec<GenericRow> = [1, 2]
        .into_iter()
        .flat_map(|l| [10, 20, 30].into_iter().map(move |r| row![7, l, 7, r]))
        .collect();
    assert_eq!(rows, expected);
    Ok(())
}

#[test]
fn converters_round_trip_rows() -> Result<()> {
    let schema = int_schema(&["id", "bucket"]);
    let mut rows = sequential_rows(&schema, &[12]).concat();
    rows.push(row![Value::Null, 3]);
    let scan = memory_scan(&schema, vec![rows.clone()])?;
    let packed: PlanRef = Arc::new(ToPackedExec::new(scan)?);
    assert_eq!(packed.output_format(), RowFormat::Packed);
    let boxed: PlanRef = Arc::new(ToBoxedExec::new(packed));
    assert_eq!(boxed.output_format(), RowFormat::Boxed);
    assert_rows_equal(&test_runner(test_config())?.collect(&boxed)?, &rows);
    Ok(())
}

#[test]
fn external_types_cannot_be_packed() -> Result<()> {
    let schema = Schema::new(vec![Field::new("geo", DataType::External("point".into()), true)]);
    let scan = memory_scan(&schema, vec![vec![GenericRow::new(vec![Value::External("1,2".into())])]])?;
    assert!(ToPackedExec::new(scan).is_err());
    Ok(())
}
