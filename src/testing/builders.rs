//! Builders for schemas, rows and in-memory scans.

use crate::hash::partition_for;
use crate::partitioning::Partitioning;
use crate::plan::PlanRef;
use crate::row::GenericRow;
use crate::scan::{MemoryRowSource, RowSourceScanExec};
use crate::types::{DataType, Field, Schema, Value};
use anyhow::Result;
use std::sync::Arc;

/// Nullable `Int` columns with the given names.
#[must_use]
pub fn int_schema(names: &[&str]) -> Schema {
    Schema::new(
        names
            .iter()
            .map(|n| Field::new(*n, DataType::Int, true))
            .collect(),
    )
}

/// Deterministic rows over an all-`Int` schema, `counts[p]` rows in partition `p`.
///
/// Row `i` (numbered across partitions) holds `i` in the first column,
/// `i % 5` in the second and `i * j` in column `j` after that.
#[must_use]
pub fn sequential_rows(schema: &Schema, counts: &[usize]) -> Vec<Vec<GenericRow>> {
    let mut next = 0i32;
    counts
        .iter()
        .map(|&n| {
            (0..n)
                .map(|_| {
                    let i = next;
                    next += 1;
                    let values = (0..schema.len())
                        .map(|j| match j {
                            0 => Value::Int(i),
                            1 => Value::Int(i % 5),
                            _ => Value::Int(i * j as i32),
                        })
                        .collect();
                    GenericRow::new(values)
                })
                .collect()
        })
        .collect()
}

/// Builds a [`RowSourceScanExec`] over in-memory partitions.
pub struct ScanBuilder {
    schema: Schema,
    partitions: Vec<Vec<GenericRow>>,
    partitioning: Option<Partitioning>,
    packed: bool,
}

impl ScanBuilder {
    #[must_use]
    pub const fn new(schema: Schema) -> Self {
        Self {
            schema,
            partitions: Vec::new(),
            partitioning: None,
            packed: false,
        }
    }

    #[must_use]
    pub fn partitions(mut self, partitions: Vec<Vec<GenericRow>>) -> Self {
        self.partitions = partitions;
        self
    }

    #[must_use]
    pub fn partition(mut self, rows: Vec<GenericRow>) -> Self {
        self.partitions.push(rows);
        self
    }

    /// Place `rows` into `n` partitions by the murmur3 hash of the `keys`
    /// columns, exactly as a hash exchange would, and declare that layout.
    ///
    /// # Errors
    ///
    /// Returns a planning error for unknown key columns.
    pub fn hash_partitioned(mut self, rows: Vec<GenericRow>, keys: &[&str], n: usize) -> Result<Self> {
        let positions = keys
            .iter()
            .map(|k| self.schema.index_of(k))
            .collect::<Result<Vec<_>>>()?;
        let mut partitions = vec![Vec::new(); n];
        for row in rows {
            let key: Vec<Value> = positions.iter().map(|&i| row.get(i).clone()).collect();
            partitions[partition_for(&key, n)].push(row);
        }
        self.partitions = partitions;
        self.partitioning = Some(Partitioning::hash(
            keys.iter().map(|k| crate::expr::col(*k)).collect(),
            n,
        ));
        Ok(self)
    }

    #[must_use]
    pub fn declared(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = Some(partitioning);
        self
    }

    #[must_use]
    pub const fn packed(mut self) -> Self {
        self.packed = true;
        self
    }

    /// # Errors
    ///
    /// Returns a planning error if rows do not match the schema or the
    /// declared partitioning does not fit the partitions.
    pub fn build(self) -> Result<PlanRef> {
        let mut source = MemoryRowSource::new(self.schema, self.partitions)?;
        if let Some(p) = self.partitioning {
            source = source.with_partitioning(p)?;
        }
        if self.packed {
            source = source.packed()?;
        }
        Ok(Arc::new(RowSourceScanExec::new(Arc::new(source))))
    }
}

/// Scan over `partitions` with nothing known about their layout.
///
/// # Errors
///
/// Returns a planning error if rows do not match the schema.
pub fn memory_scan(schema: &Schema, partitions: Vec<Vec<GenericRow>>) -> Result<PlanRef> {
    ScanBuilder::new(schema.clone()).partitions(partitions).build()
}

/// Scan whose rows are hash partitioned on `keys` into `n` partitions.
///
/// # Errors
///
/// Returns a planning error for unknown key columns.
pub fn hash_partitioned_scan(
    schema: &Schema,
    rows: Vec<GenericRow>,
    keys: &[&str],
    n: usize,
) -> Result<PlanRef> {
    ScanBuilder::new(schema.clone())
        .hash_partitioned(rows, keys, n)?
        .build()
}
