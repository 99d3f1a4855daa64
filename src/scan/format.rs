//! File listing and file formats for the file scan.
//!
//! [`InMemoryFileIndex`] lists a directory tree once with a glob pattern and
//! groups files by hive-style `key=value` directories. A [`FileFormat`] turns
//! one byte-range split into a row iterator.

use super::files::{FileStatus, PartitionDirectory, PartitionedFile};
use crate::error::{data_err, planning_err};
use crate::expr::{Expr, bind_all};
use crate::row::{GenericRow, RowRef};
use crate::types::{DataType, Schema, Value};
use anyhow::{Context, Result};
use glob::glob;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[cfg(feature = "io-jsonl")]
pub use jsonl::JsonLinesFormat;

/// Directory value standing for a null partition value.
pub const DEFAULT_PARTITION_NAME: &str = "__HIVE_DEFAULT_PARTITION__";

/// Reads one split of a data file as rows of the data columns.
pub trait FileFormat: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether a file may be cut into several byte-range splits.
    fn is_splittable(&self) -> bool {
        true
    }

    /// Iterator over the rows that start inside `file`'s byte range.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or positioned.
    fn open_split(&self, file: &PartitionedFile, data_schema: &Schema) -> Result<crate::row::BoxRowIter>;
}

/// A file listing taken once at construction.
#[derive(Debug)]
pub struct InMemoryFileIndex {
    root: PathBuf,
    partition_schema: Schema,
    directories: Vec<PartitionDirectory>,
    listings: AtomicUsize,
}

impl InMemoryFileIndex {
    /// List every file under `root` matching `pattern` (e.g. `**/*.jsonl`).
    /// Each `key=value` path component below `root` whose key is a column of
    /// `partition_schema` supplies that column's value.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid pattern, unreadable paths, a file
    /// missing a partition directory, or a value that does not parse.
    pub fn new(root: impl AsRef<Path>, pattern: &str, partition_schema: Schema) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let full = root.join(pattern);
        let full = full.to_string_lossy();
        let mut paths = Vec::new();
        for entry in glob(&full).with_context(|| format!("invalid glob pattern: {full}"))? {
            let path = entry.with_context(|| format!("reading glob entry for pattern: {full}"))?;
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let mut grouped: BTreeMap<Vec<Value>, Vec<FileStatus>> = BTreeMap::new();
        for path in paths {
            let size = path
                .metadata()
                .with_context(|| format!("stat {}", path.display()))?
                .len();
            let values = partition_values(&root, &path, &partition_schema)?;
            grouped
                .entry(values)
                .or_default()
                .push(FileStatus::new(path, size));
        }
        let directories: Vec<PartitionDirectory> = grouped
            .into_iter()
            .map(|(values, files)| PartitionDirectory { values, files })
            .collect();
        debug!(
            root = %root.display(),
            directories = directories.len(),
            "listed files"
        );
        Ok(Self {
            root,
            partition_schema,
            directories,
            listings: AtomicUsize::new(0),
        })
    }

    /// An index over an explicit listing, for sources that are not on disk.
    #[must_use]
    pub fn from_directories(partition_schema: Schema, directories: Vec<PartitionDirectory>) -> Self {
        Self {
            root: PathBuf::new(),
            partition_schema,
            directories,
            listings: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub const fn partition_schema(&self) -> &Schema {
        &self.partition_schema
    }

    #[must_use]
    pub fn num_directories(&self) -> usize {
        self.directories.len()
    }

    /// Number of times [`list_files`](Self::list_files) ran.
    #[must_use]
    pub fn listing_count(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    /// Directories whose partition values pass every filter. Filters may only
    /// reference partition columns.
    ///
    /// # Errors
    ///
    /// Returns a planning error if a filter references a data column.
    pub fn list_files(&self, filters: &[Expr]) -> Result<Vec<PartitionDirectory>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        prune_directories(&self.directories, filters, &self.partition_schema)
    }
}

/// Keep the directories whose values satisfy every filter.
///
/// # Errors
///
/// Returns a planning error if a filter does not bind to `partition_schema`.
pub fn prune_directories(
    directories: &[PartitionDirectory],
    filters: &[Expr],
    partition_schema: &Schema,
) -> Result<Vec<PartitionDirectory>> {
    if filters.is_empty() {
        return Ok(directories.to_vec());
    }
    let bound = bind_all(filters, partition_schema)?;
    let mut kept = Vec::new();
    for dir in directories {
        let row = GenericRow::new(dir.values.clone());
        let mut keep = true;
        for f in &bound {
            if !f.eval_predicate(RowRef::Boxed(&row))? {
                keep = false;
                break;
            }
        }
        if keep {
            kept.push(dir.clone());
        }
    }
    Ok(kept)
}

fn partition_values(root: &Path, path: &Path, schema: &Schema) -> Result<Vec<Value>> {
    let mut values = vec![None; schema.len()];
    let relative = path.strip_prefix(root).unwrap_or(path);
    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            let text = component.as_os_str().to_string_lossy();
            let Some((key, raw)) = text.split_once('=') else {
                continue;
            };
            if let Ok(i) = schema.index_of(key) {
                values[i] = Some(parse_partition_value(raw, &schema.fields[i].data_type)?);
            }
        }
    }
    values
        .into_iter()
        .zip(&schema.fields)
        .map(|(v, f)| match v {
            Some(v) => Ok(v),
            None => planning_err(format!(
                "{} has no directory for partition column '{}'",
                path.display(),
                f.name
            )),
        })
        .collect()
}

/// Parse a partition directory value as `dt`.
///
/// # Errors
///
/// Returns a data error if `raw` does not parse.
pub fn parse_partition_value(raw: &str, dt: &DataType) -> Result<Value> {
    if raw == DEFAULT_PARTITION_NAME {
        return Ok(Value::Null);
    }
    let parsed = match dt {
        DataType::Boolean => raw.parse().map(Value::Boolean).ok(),
        DataType::Byte => raw.parse().map(Value::Byte).ok(),
        DataType::Short => raw.parse().map(Value::Short).ok(),
        DataType::Int => raw.parse().map(Value::Int).ok(),
        DataType::Long => raw.parse().map(Value::Long).ok(),
        DataType::Date => raw.parse().map(Value::Date).ok(),
        DataType::Timestamp => raw.parse().map(Value::Timestamp).ok(),
        DataType::Float => raw.parse().map(Value::float).ok(),
        DataType::Double => raw.parse().map(Value::double).ok(),
        DataType::String => Some(Value::String(raw.to_string())),
        _ => None,
    };
    match parsed {
        Some(v) => Ok(v),
        None => data_err(format!("cannot parse partition value '{raw}' as {dt:?}")),
    }
}

/// Convert one JSON document field into a value of type `dt`.
///
/// # Errors
///
/// Returns a data error when the JSON shape does not match the type.
pub fn json_to_value(json: &serde_json::Value, dt: &DataType) -> Result<Value> {
    use serde_json::Value as Json;
    let converted = match (json, dt) {
        (Json::Null, _) => Some(Value::Null),
        (Json::Bool(b), DataType::Boolean) => Some(Value::Boolean(*b)),
        (Json::Number(n), DataType::Byte) => n.as_i64().and_then(|v| i8::try_from(v).ok()).map(Value::Byte),
        (Json::Number(n), DataType::Short) => {
            n.as_i64().and_then(|v| i16::try_from(v).ok()).map(Value::Short)
        }
        (Json::Number(n), DataType::Int) => n.as_i64().and_then(|v| i32::try_from(v).ok()).map(Value::Int),
        (Json::Number(n), DataType::Date) => {
            n.as_i64().and_then(|v| i32::try_from(v).ok()).map(Value::Date)
        }
        (Json::Number(n), DataType::Long) => n.as_i64().map(Value::Long),
        (Json::Number(n), DataType::Timestamp) => n.as_i64().map(Value::Timestamp),
        (Json::Number(n), DataType::Float) => n.as_f64().map(|v| Value::float(v as f32)),
        (Json::Number(n), DataType::Double) => n.as_f64().map(Value::double),
        (Json::String(s), DataType::String) => Some(Value::String(s.clone())),
        (Json::String(s), DataType::External(_)) => Some(Value::External(s.clone())),
        (Json::String(s), DataType::Binary) => Some(Value::Binary(s.as_bytes().to_vec())),
        (Json::Array(items), DataType::Array(elem)) => Some(Value::Array(
            items
                .iter()
                .map(|v| json_to_value(v, elem))
                .collect::<Result<_>>()?,
        )),
        (Json::Object(map), DataType::Struct(fields)) => Some(Value::Struct(
            fields
                .iter()
                .map(|f| json_to_value(map.get(&f.name).unwrap_or(&Json::Null), &f.data_type))
                .collect::<Result<_>>()?,
        )),
        _ => None,
    };
    match converted {
        Some(v) => Ok(v),
        None => data_err(format!("JSON value {json} does not fit {dt:?}")),
    }
}

#[cfg(feature = "io-jsonl")]
mod jsonl {
    use super::{FileFormat, json_to_value};
    use crate::error::data_err;
    use crate::row::{BoxRowIter, GenericRow, RowIter, RowRef};
    use crate::scan::files::PartitionedFile;
    use crate::types::{Schema, Value};
    use anyhow::{Context, Result};
    use std::fs::File;
    use std::io::{BufRead, BufReader, Seek, SeekFrom};
    use std::path::PathBuf;

    /// Newline-delimited JSON objects, one row per line. Columns are matched
    /// by name; absent fields read as null and blank lines are skipped.
    ///
    /// A split owns every line that *starts* inside its byte range: a split
    /// not at offset 0 discards its first, partial line, and every split reads
    /// past its end to finish the line it is in.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct JsonLinesFormat;

    impl FileFormat for JsonLinesFormat {
        fn name(&self) -> &'static str {
            "jsonl"
        }

        fn open_split(&self, file: &PartitionedFile, data_schema: &Schema) -> Result<BoxRowIter> {
            let f = File::open(&file.path).with_context(|| format!("open {}", file.path.display()))?;
            let mut reader = BufReader::new(f);
            let mut pos = file.start;
            if file.start > 0 {
                reader
                    .seek(SeekFrom::Start(file.start))
                    .with_context(|| format!("seek {} to {}", file.path.display(), file.start))?;
                let mut skipped = Vec::new();
                pos += reader
                    .read_until(b'\n', &mut skipped)
                    .with_context(|| format!("read {}", file.path.display()))? as u64;
            }
            Ok(Box::new(JsonLinesReader {
                reader,
                path: file.path.clone(),
                schema: data_schema.clone(),
                pos,
                end: file.start + file.length,
                line: Vec::new(),
                row: None,
            }))
        }
    }

    struct JsonLinesReader {
        reader: BufReader<File>,
        path: PathBuf,
        schema: Schema,
        pos: u64,
        end: u64,
        line: Vec<u8>,
        row: Option<GenericRow>,
    }

    impl JsonLinesReader {
        fn parse(&self, line: &str) -> Result<GenericRow> {
            let doc: serde_json::Value = serde_json::from_str(line)
                .with_context(|| format!("parse JSONL line at byte {} in {}", self.pos, self.path.display()))?;
            let serde_json::Value::Object(map) = doc else {
                return data_err(format!(
                    "JSONL line at byte {} in {} is not an object",
                    self.pos,
                    self.path.display()
                ));
            };
            let values = self
                .schema
                .fields
                .iter()
                .map(|f| match map.get(&f.name) {
                    Some(v) => json_to_value(v, &f.data_type)
                        .with_context(|| format!("column '{}' in {}", f.name, self.path.display())),
                    None => Ok(Value::Null),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(GenericRow::new(values))
        }
    }

    impl RowIter for JsonLinesReader {
        fn advance(&mut self) -> Result<bool> {
            loop {
                if self.pos > self.end {
                    self.row = None;
                    return Ok(false);
                }
                self.line.clear();
                let n = self
                    .reader
                    .read_until(b'\n', &mut self.line)
                    .with_context(|| format!("read {}", self.path.display()))?;
                if n == 0 {
                    self.row = None;
                    return Ok(false);
                }
                let text = String::from_utf8_lossy(&self.line);
                let text = text.trim();
                if !text.is_empty() {
                    let row = self.parse(text)?;
                    self.pos += n as u64;
                    self.row = Some(row);
                    return Ok(true);
                }
                self.pos += n as u64;
            }
        }

        fn current(&self) -> Option<RowRef<'_>> {
            self.row.as_ref().map(RowRef::Boxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    #[test]
    fn parses_typed_partition_values() -> Result<()> {
        assert_eq!(parse_partition_value("7", &DataType::Int)?, Value::Int(7));
        assert_eq!(
            parse_partition_value(DEFAULT_PARTITION_NAME, &DataType::Int)?,
            Value::Null
        );
        assert!(parse_partition_value("x", &DataType::Long).is_err());
        Ok(())
    }

    #[test]
    fn prunes_by_partition_values() -> Result<()> {
        let schema = Schema::new(vec![Field::new("day", DataType::Int, false)]);
        let dirs: Vec<PartitionDirectory> = (1..=3)
            .map(|d| PartitionDirectory {
                values: vec![Value::Int(d)],
                files: vec![FileStatus::new(format!("/t/day={d}/a.jsonl"), 10)],
            })
            .collect();
        let index = InMemoryFileIndex::from_directories(schema, dirs);
        let kept = index.list_files(&[crate::expr::col("day").gt(crate::expr::lit(1))])?;
        assert_eq!(kept.len(), 2);
        assert_eq!(index.listing_count(), 1);
        Ok(())
    }
}
