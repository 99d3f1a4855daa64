//! On-disk tables for scan tests.
//!
//! Tables are JSON-lines files under a caller-owned directory, usually a
//! `tempfile::TempDir`. Partitioned tables use `key=value` directories and
//! bucketed tables put the bucket id last in the file name
//! (`part-00000_00003.jsonl`).

use crate::hash::partition_for;
use crate::row::GenericRow;
use crate::scan::{BucketSpec, FileFormat, FileScanRelation, InMemoryFileIndex};
use crate::types::{Schema, Value};
use anyhow::{Context, Result};
use serde_json::{Map, Value as Json};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Write `rows` as one JSON object per line. Returns the file size in bytes.
///
/// # Errors
///
/// Returns an I/O error if the file or its parent directory cannot be written.
pub fn write_jsonl_file(path: &Path, rows: &[Json]) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = fs::File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut written = 0u64;
    for row in rows {
        let line = serde_json::to_string(row)?;
        writeln!(file, "{line}")?;
        written += line.len() as u64 + 1;
    }
    Ok(written)
}

/// JSON object for a row, keyed by the schema's field names.
#[must_use]
pub fn row_to_json(schema: &Schema, row: &GenericRow) -> Json {
    let mut map = Map::new();
    for (field, value) in schema.fields.iter().zip(row.values()) {
        map.insert(field.name.clone(), value_to_json(value));
    }
    Json::Object(map)
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Byte(v) => Json::from(*v),
        Value::Short(v) => Json::from(*v),
        Value::Int(v) | Value::Date(v) => Json::from(*v),
        Value::Long(v) | Value::Timestamp(v) => Json::from(*v),
        Value::Float(v) => Json::from(f64::from(v.into_inner())),
        Value::Double(v) => Json::from(v.into_inner()),
        Value::String(s) | Value::External(s) => Json::String(s.clone()),
        Value::Binary(b) => Json::String(String::from_utf8_lossy(b).into_owned()),
        Value::Array(items) | Value::Struct(items) => {
            Json::Array(items.iter().map(value_to_json).collect())
        }
    }
}

/// Write one file per partition value under `root/<column>=<value>/`.
/// Returns the written paths.
///
/// # Errors
///
/// Returns an I/O error if a file cannot be written.
pub fn write_partitioned_table(
    root: &Path,
    column: &str,
    schema: &Schema,
    partitions: &[(&str, Vec<GenericRow>)],
) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(partitions.len());
    for (value, rows) in partitions {
        let path = root.join(format!("{column}={value}")).join("part-00000.jsonl");
        let json: Vec<Json> = rows.iter().map(|r| row_to_json(schema, r)).collect();
        write_jsonl_file(&path, &json)?;
        paths.push(path);
    }
    Ok(paths)
}

/// Write `rows` as a bucketed table: each row goes to the file of bucket
/// `pmod(murmur3(bucket columns), num_buckets)`. Empty buckets get no file.
///
/// # Errors
///
/// Returns a planning error for unknown bucket columns, or an I/O error.
pub fn write_bucketed_table(
    root: &Path,
    schema: &Schema,
    rows: &[GenericRow],
    bucket_columns: &[&str],
    num_buckets: usize,
) -> Result<Vec<PathBuf>> {
    let positions = bucket_columns
        .iter()
        .map(|c| schema.index_of(c))
        .collect::<Result<Vec<_>>>()?;
    let mut buckets: Vec<Vec<Json>> = vec![Vec::new(); num_buckets];
    for row in rows {
        let key: Vec<Value> = positions.iter().map(|&i| row.get(i).clone()).collect();
        buckets[partition_for(&key, num_buckets)].push(row_to_json(schema, row));
    }
    let mut paths = Vec::new();
    for (bucket, json) in buckets.iter().enumerate() {
        if json.is_empty() {
            continue;
        }
        let path = root.join(format!("part-00000_{bucket:05}.jsonl"));
        write_jsonl_file(&path, json)?;
        paths.push(path);
    }
    Ok(paths)
}

/// A relation over every `*.jsonl` file below `root`.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
#[cfg(feature = "io-jsonl")]
pub fn jsonl_relation(
    root: &Path,
    data_schema: Schema,
    partition_schema: Schema,
    bucket_spec: Option<BucketSpec>,
) -> Result<Arc<FileScanRelation>> {
    let index = InMemoryFileIndex::new(root, "**/*.jsonl", partition_schema)?;
    let format: Arc<dyn FileFormat> = Arc::new(crate::scan::JsonLinesFormat);
    Ok(Arc::new(FileScanRelation {
        index: Arc::new(index),
        format,
        data_schema,
        bucket_spec,
    }))
}
