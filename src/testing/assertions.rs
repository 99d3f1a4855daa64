//! Assertions over rows produced by plans.

use crate::row::{GenericRow, Row};
use crate::types::{Schema, Value};
use anyhow::Result;

/// Assert that two row lists are equal in order and content.
///
/// # Panics
///
/// Panics if the lists differ in length or content.
pub fn assert_rows_equal(actual: &[GenericRow], expected: &[GenericRow]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Row count mismatch:\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert_eq!(
            a, e,
            "Row mismatch at index {i}:\n  Expected: {e:?}\n  Actual: {a:?}"
        );
    }
}

/// Assert that two row lists hold the same multiset of rows.
///
/// Rows from a partitioned plan arrive in partition order, which tests
/// usually should not depend on.
///
/// # Panics
///
/// Panics if the lists differ once sorted.
pub fn assert_rows_unordered_equal(actual: &[GenericRow], expected: &[GenericRow]) {
    let actual = sorted_rows(actual.to_vec());
    let expected = sorted_rows(expected.to_vec());
    assert_rows_equal(&actual, &expected);
}

#[must_use]
pub fn sorted_rows(mut rows: Vec<GenericRow>) -> Vec<GenericRow> {
    rows.sort();
    rows
}

/// Number of rows in each partition of a result.
#[must_use]
pub fn partition_sizes(partitions: &[Vec<Row>]) -> Vec<usize> {
    partitions.iter().map(Vec::len).collect()
}

/// Decode every row of every partition, in partition order.
///
/// # Errors
///
/// Returns a decode error for rows that do not match `schema`.
pub fn decode_all(partitions: Vec<Vec<Row>>, schema: &Schema) -> Result<Vec<GenericRow>> {
    partitions
        .into_iter()
        .flatten()
        .map(|r| r.into_generic(schema))
        .collect()
}

/// The `Int` values of column `i`, nulls skipped.
#[must_use]
pub fn int_column(rows: &[GenericRow], i: usize) -> Vec<i32> {
    rows.iter()
        .filter_map(|r| match r.get(i) {
            Value::Int(v) => Some(*v),
            _ => None,
        })
        .collect()
}
