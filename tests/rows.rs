use anyhow::Result;
use ironexec::error::ExecError;
use ironexec::row::{
    BoxRowIter, ChainRowIter, IterOpener, PackedRow, Row, RowFormat, VecRowIter, collect_generic,
    collect_rows, count_rows,
};
use ironexec::{DataType, Field, GenericRow, Schema, Value, row};

fn wide_schema() -> Schema {
    Schema::new(vec![
        Field::new("flag", DataType::Boolean, true),
        Field::new("small", DataType::Short, true),
        Field::new("id", DataType::Long, false),
        Field::new("score", DataType::Double, true),
        Field::new("day", DataType::Date, true),
        Field::new("name", DataType::String, true),
        Field::new("blob", DataType::Binary, true),
        Field::new("tags", DataType::Array(Box::new(DataType::String)), true),
        Field::new(
            "point",
            DataType::Struct(vec![
                Field::new("x", DataType::Int, true),
                Field::new("label", DataType::String, true),
            ]),
            true,
        ),
    ])
}

fn wide_row(id: i64, name: Option<&str>) -> GenericRow {
    GenericRow::new(vec![
        Value::Boolean(id % 2 == 0),
        Value::Short(-7),
        Value::Long(id),
        Value::double(1.5 * id as f64),
        Value::Date(19_000),
        name.map_or(Value::Null, |n| Value::String(n.to_string())),
        Value::Binary(vec![0, 1, 2, 255]),
        Value::Array(vec![Value::from("a"), Value::Null, Value::from("ccc")]),
        Value::Struct(vec![Value::Int(3), Value::from("origin")]),
    ])
}

#[test]
fn packed_rows_round_trip_nested_values() -> Result<()> {
    let schema = wide_schema();
    for row in [wide_row(1, Some("ada")), wide_row(2, None), wide_row(-40, Some(""))] {
        let packed = PackedRow::from_values(row.values(), &schema)?;
        assert_eq!(packed.as_ref().to_generic(&schema)?, row);
    }
    Ok(())
}

#[test]
fn nulls_round_trip_in_every_column() -> Result<()> {
    let schema = wide_schema();
    let mut values = vec![Value::Null; schema.len()];
    values[2] = Value::Long(9);
    let row = GenericRow::new(values);
    let packed = PackedRow::from_values(row.values(), &schema)?;
    let view = packed.as_ref();
    assert!(view.is_null_at(0));
    assert!(!view.is_null_at(2));
    assert_eq!(view.get_long(2), 9);
    assert_eq!(view.to_generic(&schema)?, row);
    Ok(())
}

#[test]
fn equal_values_pack_to_identical_bytes() -> Result<()> {
    let schema = wide_schema();
    let a = PackedRow::from_values(wide_row(5, Some("x")).values(), &schema)?;
    let b = PackedRow::from_values(wide_row(5, Some("x")).values(), &schema)?;
    assert_eq!(a.as_bytes(), b.as_bytes());
    assert_eq!(a.as_bytes().len() % 8, 0);
    Ok(())
}

#[test]
fn equal_floats_pack_to_identical_bytes() -> Result<()> {
    let schema = Schema::new(vec![
        Field::new("f", DataType::Float, true),
        Field::new("d", DataType::Double, true),
    ]);
    let pack = |f: f32, d: f64| PackedRow::from_values(&[Value::float(f), Value::double(d)], &schema);

    let zero = pack(0.0, 0.0)?;
    let negative_zero = pack(-0.0, -0.0)?;
    assert_eq!(Value::double(-0.0), Value::double(0.0));
    assert_eq!(zero.as_bytes(), negative_zero.as_bytes());

    let nan = pack(f32::NAN, f64::NAN)?;
    let other_nan = pack(
        f32::from_bits(f32::NAN.to_bits() | 1),
        f64::from_bits(f64::NAN.to_bits() | 1),
    )?;
    assert_eq!(nan.as_bytes(), other_nan.as_bytes());
    Ok(())
}

#[test]
fn external_types_cannot_be_packed() {
    let schema = Schema::new(vec![Field::new("geo", DataType::External("geometry".into()), true)]);
    assert!(!schema.supports_packed());
    let err = PackedRow::from_values(&[Value::External("POINT(1 2)".into())], &schema)
        .expect_err("external values stay boxed");
    assert!(matches!(ExecError::classify(&err), Some(ExecError::Data(_))));
}

#[test]
fn mismatched_values_are_rejected() {
    let schema = Schema::new(vec![Field::new("n", DataType::Int, true)]);
    assert!(PackedRow::from_values(&[Value::from("text")], &schema).is_err());
    assert!(PackedRow::from_values(&[Value::Int(1), Value::Int(2)], &schema).is_err());
}

#[test]
fn truncated_bytes_are_a_data_error() {
    let err = PackedRow::from_bytes(vec![0u8; 4], 3).expect_err("too short");
    assert!(matches!(ExecError::classify(&err), Some(ExecError::Data(_))));
}

#[test]
fn row_macro_builds_boxed_rows() {
    let r = row![1, "two", 3.0, true];
    assert_eq!(
        r.values(),
        &[
            Value::Int(1),
            Value::String("two".into()),
            Value::double(3.0),
            Value::Boolean(true)
        ]
    );
}

#[test]
fn borrowed_rows_must_be_copied_to_outlive_the_iterator() -> Result<()> {
    let schema = Schema::new(vec![Field::new("n", DataType::Int, false)]);
    let rows: Vec<Row> = (0..3)
        .map(|i| PackedRow::from_values(&[Value::Int(i)], &schema).map(Row::Packed))
        .collect::<Result<_>>()?;
    let copied = collect_rows(VecRowIter::boxed(rows))?;
    assert!(copied.iter().all(|r| r.format() == RowFormat::Packed));
    let decoded: Vec<GenericRow> = copied
        .into_iter()
        .map(|r| r.into_generic(&schema))
        .collect::<Result<_>>()?;
    assert_eq!(decoded, vec![row![0], row![1], row![2]]);
    Ok(())
}

#[test]
fn chained_iterators_open_lazily_in_order() -> Result<()> {
    let schema = Schema::new(vec![Field::new("n", DataType::Int, false)]);
    let part = |vals: Vec<i32>| -> IterOpener {
        Box::new(move || -> Result<BoxRowIter> {
            Ok(VecRowIter::boxed(vals.into_iter().map(|v| Row::Boxed(row![v])).collect()))
        })
    };
    let chain = ChainRowIter::new(vec![part(vec![1, 2]), part(vec![]), part(vec![3])]);
    let rows = collect_generic(Box::new(chain), &schema)?;
    assert_eq!(rows, vec![row![1], row![2], row![3]]);

    let failing: IterOpener = Box::new(|| Err(anyhow::anyhow!("source offline")));
    let chain = ChainRowIter::new(vec![part(vec![1]), failing]);
    assert!(count_rows(Box::new(chain)).is_err());
    Ok(())
}
