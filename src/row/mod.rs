//! Row representations and the pull-based row iterator.
//!
//! Two representations coexist:
//! - [`GenericRow`]: boxed, one [`Value`](crate::types::Value) per field.
//! - [`PackedRow`]: contiguous bytes with a null bit set and 8-byte slots.
//!
//! Ownership is explicit. A [`RowRef`] is *borrowed* from whoever produced it and
//! is valid only until the producer is advanced again; producers are free to
//! reuse one buffer for every row they emit. A consumer that needs a row beyond
//! the current call (sort buffers, shuffle writers, state staging) must turn it
//! into an owned [`Row`] with [`RowRef::to_owned_row`]. The [`RowIter`] trait
//! enforces this through borrowing: `current()` borrows the iterator, so the
//! next `advance()` cannot run while a `RowRef` is alive.

pub mod generic;
pub mod packed;

pub use generic::GenericRow;
pub use packed::{PackedRow, PackedRowRef, PackedRowWriter};

use crate::types::{DataType, Schema, Value};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::sync::Arc;

/// Physical representation an operator produces or consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RowFormat {
    Packed,
    Boxed,
}

impl Display for RowFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Packed => write!(f, "packed"),
            Self::Boxed => write!(f, "boxed"),
        }
    }
}

/// An owned row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Row {
    Packed(PackedRow),
    Boxed(GenericRow),
}

/// A row borrowed from its producer.
#[derive(Clone, Copy, Debug)]
pub enum RowRef<'a> {
    Packed(PackedRowRef<'a>),
    Boxed(&'a GenericRow),
}

impl Row {
    #[must_use]
    pub fn as_ref(&self) -> RowRef<'_> {
        match self {
            Self::Packed(p) => RowRef::Packed(p.as_ref()),
            Self::Boxed(g) => RowRef::Boxed(g),
        }
    }

    #[must_use]
    pub const fn format(&self) -> RowFormat {
        match self {
            Self::Packed(_) => RowFormat::Packed,
            Self::Boxed(_) => RowFormat::Boxed,
        }
    }

    /// # Errors
    ///
    /// Returns a data error if a packed row does not match `schema`.
    pub fn into_generic(self, schema: &Schema) -> Result<GenericRow> {
        match self {
            Self::Boxed(g) => Ok(g),
            Self::Packed(p) => p.as_ref().to_generic(schema),
        }
    }
}

impl From<GenericRow> for Row {
    fn from(g: GenericRow) -> Self {
        Self::Boxed(g)
    }
}

impl From<PackedRow> for Row {
    fn from(p: PackedRow) -> Self {
        Self::Packed(p)
    }
}

impl RowRef<'_> {
    #[must_use]
    pub const fn format(&self) -> RowFormat {
        match self {
            Self::Packed(_) => RowFormat::Packed,
            Self::Boxed(_) => RowFormat::Boxed,
        }
    }

    #[must_use]
    pub fn num_fields(&self) -> usize {
        match self {
            Self::Packed(p) => p.num_fields(),
            Self::Boxed(g) => g.len(),
        }
    }

    #[must_use]
    pub fn is_null_at(&self, i: usize) -> bool {
        match self {
            Self::Packed(p) => p.is_null_at(i),
            Self::Boxed(g) => g.get(i).is_null(),
        }
    }

    /// Field `i` as a boxed value.
    ///
    /// # Errors
    ///
    /// Returns a data error if packed bytes are malformed.
    pub fn value_at(&self, i: usize, dt: &DataType) -> Result<Value> {
        match self {
            Self::Packed(p) => p.value_at(i, dt),
            Self::Boxed(g) => Ok(g.get(i).clone()),
        }
    }

    /// Copy the borrowed row so it outlives its producer.
    #[must_use]
    pub fn to_owned_row(&self) -> Row {
        match self {
            Self::Packed(p) => Row::Packed(p.copy_row()),
            Self::Boxed(g) => Row::Boxed((*g).clone()),
        }
    }

    /// # Errors
    ///
    /// Returns a data error if packed bytes do not match `schema`.
    pub fn to_generic(&self, schema: &Schema) -> Result<GenericRow> {
        match self {
            Self::Packed(p) => p.to_generic(schema),
            Self::Boxed(g) => Ok((*g).clone()),
        }
    }

    /// Copy into an owned packed row, encoding boxed rows with `schema`.
    ///
    /// # Errors
    ///
    /// Returns a data error if the values do not fit the schema.
    pub fn to_packed(&self, schema: &Schema) -> Result<PackedRow> {
        match self {
            Self::Packed(p) => Ok(p.copy_row()),
            Self::Boxed(g) => PackedRow::from_values(g.values(), schema),
        }
    }

    /// Rough in-memory footprint, used for spill accounting.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Packed(p) => p.size_in_bytes(),
            Self::Boxed(g) => 16 + g.len() * 32,
        }
    }
}

/// Pull-based iterator over borrowed rows.
///
/// Errors from the producer surface from [`advance`](RowIter::advance) and are
/// never swallowed; the task harness treats them as task failure.
pub trait RowIter: Send {
    /// Move to the next row. Returns `false` once exhausted.
    ///
    /// # Errors
    ///
    /// Any failure of the underlying producer.
    fn advance(&mut self) -> Result<bool>;

    /// The row the last successful `advance` positioned on.
    fn current(&self) -> Option<RowRef<'_>>;

    /// Advance and return the new current row.
    ///
    /// # Errors
    ///
    /// Any failure of the underlying producer.
    fn next_row(&mut self) -> Result<Option<RowRef<'_>>> {
        if self.advance()? {
            Ok(self.current())
        } else {
            Ok(None)
        }
    }
}

pub type BoxRowIter = Box<dyn RowIter>;

/// Iterator over owned rows held in shared memory.
pub struct VecRowIter {
    rows: Arc<Vec<Row>>,
    pos: usize,
    started: bool,
}

impl VecRowIter {
    #[must_use]
    pub fn new(rows: Vec<Row>) -> Self {
        Self::shared(Arc::new(rows))
    }

    #[must_use]
    pub const fn shared(rows: Arc<Vec<Row>>) -> Self {
        Self {
            rows,
            pos: 0,
            started: false,
        }
    }

    #[must_use]
    pub fn boxed(rows: Vec<Row>) -> BoxRowIter {
        Box::new(Self::new(rows))
    }
}

impl RowIter for VecRowIter {
    fn advance(&mut self) -> Result<bool> {
        if self.started {
            self.pos += 1;
        } else {
            self.started = true;
        }
        Ok(self.pos < self.rows.len())
    }

    fn current(&self) -> Option<RowRef<'_>> {
        if !self.started {
            return None;
        }
        self.rows.get(self.pos).map(Row::as_ref)
    }
}

pub struct EmptyRowIter;

impl RowIter for EmptyRowIter {
    fn advance(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn current(&self) -> Option<RowRef<'_>> {
        None
    }
}

pub type IterOpener = Box<dyn FnOnce() -> Result<BoxRowIter> + Send>;

/// Concatenates iterators opened lazily, one at a time.
pub struct ChainRowIter {
    pending: VecDeque<IterOpener>,
    current: Option<BoxRowIter>,
}

impl ChainRowIter {
    #[must_use]
    pub fn new(openers: Vec<IterOpener>) -> Self {
        Self {
            pending: openers.into(),
            current: None,
        }
    }
}

impl RowIter for ChainRowIter {
    fn advance(&mut self) -> Result<bool> {
        loop {
            if let Some(it) = self.current.as_mut() {
                if it.advance()? {
                    return Ok(true);
                }
                self.current = None;
            }
            match self.pending.pop_front() {
                Some(open) => self.current = Some(open()?),
                None => return Ok(false),
            }
        }
    }

    fn current(&self) -> Option<RowRef<'_>> {
        self.current.as_ref().and_then(|it| it.current())
    }
}

/// Drain an iterator, copying every row.
///
/// # Errors
///
/// Propagates the first producer failure.
pub fn collect_rows(mut it: BoxRowIter) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    while let Some(r) = it.next_row()? {
        out.push(r.to_owned_row());
    }
    Ok(out)
}

/// Drain an iterator, decoding every row to boxed form.
///
/// # Errors
///
/// Propagates producer failures and decode errors.
pub fn collect_generic(mut it: BoxRowIter, schema: &Schema) -> Result<Vec<GenericRow>> {
    let mut out = Vec::new();
    while let Some(r) = it.next_row()? {
        out.push(r.to_generic(schema)?);
    }
    Ok(out)
}

/// Drain an iterator, counting rows without retaining them.
///
/// # Errors
///
/// Propagates the first producer failure.
pub fn count_rows(mut it: BoxRowIter) -> Result<u64> {
    let mut n = 0u64;
    while it.advance()? {
        n += 1;
    }
    Ok(n)
}
