//! Partitioning and distribution descriptors.
//!
//! A [`Partitioning`] describes how an operator's output rows are actually
//! spread across partitions. A [`Distribution`] is what a parent operator
//! requires of its input. [`Partitioning::satisfies`] decides whether a shuffle
//! is needed; it is a pure function of the two descriptors and never looks at
//! data.
//!
//! ```
//! use ironexec::expr::col;
//! use ironexec::partitioning::{Distribution, Partitioning};
//!
//! let p = Partitioning::hash(vec![col("a")], 4);
//! assert!(p.satisfies(&Distribution::clustered(vec![col("a")])));
//! assert!(!p.satisfies(&Distribution::clustered(vec![col("b")])));
//! ```

use crate::error::planning_err;
use crate::expr::{Expr, SortOrder};
use anyhow::Result;
use std::fmt::{Display, Formatter, Result as FormatResult};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Partitioning {
    /// Exactly one partition.
    Single,
    /// Partition id is `pmod(murmur3(exprs), n)`.
    Hash { exprs: Vec<Expr>, num_partitions: usize },
    /// Partitions hold contiguous, ascending key ranges; bounds are sampled.
    Range {
        ordering: Vec<SortOrder>,
        num_partitions: usize,
    },
    /// Rows dealt out in turn; no placement guarantee.
    RoundRobin(usize),
    /// `n` partitions, nothing known about placement.
    Unknown(usize),
    /// Every consumer partition sees the whole dataset.
    Broadcast,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Distribution {
    Unspecified,
    /// All rows in a single partition.
    AllTuples,
    /// Rows agreeing on `keys` share a partition.
    Clustered {
        keys: Vec<Expr>,
        required_num_partitions: Option<usize>,
    },
    /// Rows globally ordered across partitions by the sort keys.
    Ordered(Vec<SortOrder>),
    /// The whole dataset replicated to every consumer.
    Broadcast,
}

impl Partitioning {
    #[must_use]
    pub const fn hash(exprs: Vec<Expr>, num_partitions: usize) -> Self {
        Self::Hash {
            exprs,
            num_partitions,
        }
    }

    #[must_use]
    pub const fn range(ordering: Vec<SortOrder>, num_partitions: usize) -> Self {
        Self::Range {
            ordering,
            num_partitions,
        }
    }

    #[must_use]
    pub const fn num_partitions(&self) -> usize {
        match self {
            Self::Single | Self::Broadcast => 1,
            Self::Hash { num_partitions, .. } | Self::Range { num_partitions, .. } => {
                *num_partitions
            }
            Self::RoundRobin(n) | Self::Unknown(n) => *n,
        }
    }

    /// Whether data laid out this way already meets `required`.
    #[must_use]
    pub fn satisfies(&self, required: &Distribution) -> bool {
        if let Some(n) = required.required_num_partitions() {
            if n != self.num_partitions() {
                return false;
            }
        }
        match (self, required) {
            (_, Distribution::Unspecified) => true,
            (Self::Broadcast, Distribution::Broadcast) => true,
            (Self::Broadcast, _) | (_, Distribution::Broadcast) => false,
            (Self::Single, _) => true,
            (_, Distribution::AllTuples) => self.num_partitions() == 1,
            (Self::Hash { exprs, .. }, Distribution::Clustered { keys, .. }) => {
                exprs.iter().all(|e| keys.contains(e))
            }
            (Self::Range { ordering, .. }, Distribution::Ordered(required)) => {
                let n = ordering.len().min(required.len());
                ordering[..n] == required[..n]
            }
            (Self::Range { ordering, .. }, Distribution::Clustered { keys, .. }) => {
                ordering.iter().all(|o| keys.contains(&o.expr))
            }
            _ => false,
        }
    }

    /// True if every row placement implied by `other` is also implied by
    /// `self`: the two are interchangeable. Partitionings that promise nothing
    /// guarantee nothing, even when structurally equal.
    #[must_use]
    pub fn guarantees(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unknown(_) | Self::RoundRobin(_), _) => false,
            (Self::Single, other) => other.num_partitions() == 1 && *other != Self::Broadcast,
            _ => self == other,
        }
    }

    /// Whether shuffling to either side leaves both co-partitioned.
    #[must_use]
    pub fn compatible_with(&self, other: &Self) -> bool {
        self.guarantees(other) && other.guarantees(self)
    }

    /// Positions of this partitioning's hash keys within `keys`, used to check
    /// that two children of a join are hash partitioned on matching keys.
    #[must_use]
    pub fn key_positions(&self, keys: &[Expr]) -> Option<Vec<usize>> {
        match self {
            Self::Hash { exprs, .. } => exprs
                .iter()
                .map(|e| keys.iter().position(|k| k == e))
                .collect(),
            _ => None,
        }
    }
}

impl Display for Partitioning {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Single => write!(f, "SinglePartition"),
            Self::Hash {
                exprs,
                num_partitions,
            } => write!(f, "hashpartitioning({}, {num_partitions})", join(exprs)),
            Self::Range {
                ordering,
                num_partitions,
            } => write!(f, "rangepartitioning({}, {num_partitions})", join(ordering)),
            Self::RoundRobin(n) => write!(f, "RoundRobinPartitioning({n})"),
            Self::Unknown(n) => write!(f, "UnknownPartitioning({n})"),
            Self::Broadcast => write!(f, "BroadcastPartitioning"),
        }
    }
}

impl Distribution {
    #[must_use]
    pub const fn clustered(keys: Vec<Expr>) -> Self {
        Self::Clustered {
            keys,
            required_num_partitions: None,
        }
    }

    #[must_use]
    pub const fn required_num_partitions(&self) -> Option<usize> {
        match self {
            Self::AllTuples | Self::Broadcast => Some(1),
            Self::Clustered {
                required_num_partitions,
                ..
            } => *required_num_partitions,
            Self::Unspecified | Self::Ordered(_) => None,
        }
    }

    /// The partitioning an exchange produces to satisfy this distribution.
    ///
    /// # Errors
    ///
    /// Returns a planning error for [`Distribution::Unspecified`], which has no
    /// canonical partitioning.
    pub fn create_partitioning(&self, num_partitions: usize) -> Result<Partitioning> {
        match self {
            Self::AllTuples => Ok(Partitioning::Single),
            Self::Clustered {
                keys,
                required_num_partitions,
            } => Ok(Partitioning::hash(
                keys.clone(),
                required_num_partitions.unwrap_or(num_partitions),
            )),
            Self::Ordered(ordering) => Ok(Partitioning::range(ordering.clone(), num_partitions)),
            Self::Broadcast => Ok(Partitioning::Broadcast),
            Self::Unspecified => {
                planning_err("UnspecifiedDistribution has no canonical partitioning")
            }
        }
    }
}

impl Display for Distribution {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::Unspecified => write!(f, "UnspecifiedDistribution"),
            Self::AllTuples => write!(f, "AllTuples"),
            Self::Clustered { keys, .. } => write!(f, "ClusteredDistribution({})", join(keys)),
            Self::Ordered(ordering) => write!(f, "OrderedDistribution({})", join(ordering)),
            Self::Broadcast => write!(f, "BroadcastDistribution"),
        }
    }
}

fn join<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
