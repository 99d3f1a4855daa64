//! Row to reduce-partition assignment for each partitioning variant.

use crate::context::ExecContext;
use crate::error::planning_err;
use crate::expr::{BoundExpr, RowOrdering, SortOrder, bind_all, eval_all};
use crate::hash::partition_for;
use crate::partitioning::Partitioning;
use crate::plan::PlanRef;
use crate::row::RowRef;
use crate::task::TaskContext;
use crate::types::{Schema, Value};
use crate::utils::{Reservoir, SplitMix64};
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on the total number of sampled keys.
const MAX_SAMPLE_SIZE: f64 = 1e6;
/// Sampled keys per output partition.
const SAMPLES_PER_PARTITION: f64 = 20.0;

pub enum Partitioner {
    Single,
    Hash {
        keys: Vec<BoundExpr>,
        num_partitions: usize,
    },
    /// `bounds[i]` is the inclusive upper key of partition `i`.
    Range {
        ordering: RowOrdering,
        bounds: Arc<Vec<Vec<Value>>>,
        num_partitions: usize,
    },
    RoundRobin {
        num_partitions: usize,
        position: usize,
    },
}

impl Partitioner {
    /// Partitioner for the map task `map_index`.
    ///
    /// Range partitioning needs its sampled `bounds`; round-robin starts at a
    /// position derived from `map_index` so a re-run deals rows identically.
    ///
    /// # Errors
    ///
    /// Returns a planning error for partitionings an exchange cannot produce,
    /// or when range bounds are missing.
    pub fn new(
        partitioning: &Partitioning,
        schema: &Schema,
        map_index: usize,
        bounds: Option<Arc<Vec<Vec<Value>>>>,
    ) -> Result<Self> {
        match partitioning {
            Partitioning::Single => Ok(Self::Single),
            Partitioning::Hash {
                exprs,
                num_partitions,
            } => Ok(Self::Hash {
                keys: bind_all(exprs, schema)?,
                num_partitions: *num_partitions,
            }),
            Partitioning::Range {
                ordering,
                num_partitions,
            } => {
                let Some(bounds) = bounds else {
                    return planning_err("range partitioner built without sampled bounds");
                };
                Ok(Self::Range {
                    ordering: RowOrdering::new(ordering, schema)?,
                    bounds,
                    num_partitions: *num_partitions,
                })
            }
            Partitioning::RoundRobin(n) => {
                let mut rng = SplitMix64::new(map_index as u64);
                Ok(Self::RoundRobin {
                    num_partitions: *n,
                    position: rng.next_below((*n).max(1)),
                })
            }
            Partitioning::Unknown(_) | Partitioning::Broadcast => planning_err(format!(
                "an exchange cannot produce {partitioning}"
            )),
        }
    }

    #[must_use]
    pub const fn num_partitions(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::Hash { num_partitions, .. }
            | Self::Range { num_partitions, .. }
            | Self::RoundRobin { num_partitions, .. } => *num_partitions,
        }
    }

    /// Reduce partition of `row`.
    ///
    /// # Errors
    ///
    /// Propagates key evaluation failures.
    pub fn partition(&mut self, row: RowRef<'_>) -> Result<usize> {
        match self {
            Self::Single => Ok(0),
            Self::Hash {
                keys,
                num_partitions,
            } => Ok(partition_for(&eval_all(keys, row)?, *num_partitions)),
            Self::Range {
                ordering, bounds, ..
            } => {
                let key = ordering.key(row)?;
                Ok(bounds.partition_point(|b| ordering.compare(b, &key).is_lt()))
            }
            Self::RoundRobin {
                num_partitions,
                position,
            } => {
                *position += 1;
                Ok(*position % *num_partitions)
            }
        }
    }
}

/// Pick `partitions - 1` bounds from weighted, sampled keys so that each range
/// carries about the same weight. Equal keys never straddle two bounds.
#[must_use]
pub fn determine_bounds(
    mut candidates: Vec<(Vec<Value>, f64)>,
    partitions: usize,
    ordering: &RowOrdering,
) -> Vec<Vec<Value>> {
    if partitions <= 1 || candidates.is_empty() {
        return Vec::new();
    }
    candidates.sort_by(|a, b| ordering.compare(&a.0, &b.0));
    let total: f64 = candidates.iter().map(|(_, w)| w).sum();
    let step = total / partitions as f64;
    let mut cumulative = 0.0;
    let mut target = step;
    let mut bounds: Vec<Vec<Value>> = Vec::with_capacity(partitions - 1);
    for (key, weight) in candidates {
        cumulative += weight;
        if cumulative >= target {
            let distinct = bounds
                .last()
                .is_none_or(|prev| ordering.compare(&key, prev).is_gt());
            if distinct {
                bounds.push(key);
                target += step;
                if bounds.len() == partitions - 1 {
                    break;
                }
            }
        }
    }
    bounds
}

/// Sample sort keys from every partition of `child` and derive range bounds
/// for `partitions` output partitions.
///
/// Keys are evaluated into owned values before they enter the reservoir; the
/// child's row buffers are never retained.
///
/// # Errors
///
/// Propagates child execution failures.
pub fn sample_range_bounds(
    child: &PlanRef,
    ordering: &[SortOrder],
    partitions: usize,
    ctx: &Arc<ExecContext>,
) -> Result<Vec<Vec<Value>>> {
    let bound = RowOrdering::new(ordering, child.schema())?;
    let maps = child.num_partitions().max(1);
    let sample_size = (SAMPLES_PER_PARTITION * partitions as f64).min(MAX_SAMPLE_SIZE);
    let per_partition = (3.0 * sample_size / maps as f64).ceil() as usize;
    let stage = ctx.next_stage_id();
    let mut candidates: Vec<(Vec<Value>, f64)> = Vec::new();
    for p in 0..child.num_partitions() {
        let task = TaskContext::new(Arc::clone(ctx), stage, p, 0);
        let mut reservoir = Reservoir::new(per_partition, p as u64);
        let mut it = child.execute_partition(p, &task)?;
        while let Some(row) = it.next_row()? {
            if let Some(ticket) = reservoir.admit() {
                reservoir.insert(ticket, bound.key(row)?);
            }
        }
        let seen = reservoir.seen();
        let keys = reservoir.into_items();
        if keys.is_empty() {
            continue;
        }
        let weight = seen as f64 / keys.len() as f64;
        candidates.extend(keys.into_iter().map(|k| (k, weight)));
    }
    let bounds = determine_bounds(candidates, partitions, &bound);
    debug!(partitions, bounds = bounds.len(), "sampled range bounds");
    Ok(bounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::types::{DataType, Field};

    fn ordering() -> RowOrdering {
        let schema = Schema::new(vec![Field::new("k", DataType::Int, false)]);
        RowOrdering::new(&[SortOrder::asc(col("k"))], &schema).unwrap()
    }

    #[test]
    fn bounds_split_evenly() {
        let candidates = (0..100).map(|i| (vec![Value::Int(i)], 1.0)).collect();
        let bounds = determine_bounds(candidates, 4, &ordering());
        assert_eq!(
            bounds,
            vec![vec![Value::Int(24)], vec![Value::Int(49)], vec![Value::Int(74)]]
        );
    }

    #[test]
    fn duplicate_keys_do_not_repeat_bounds() {
        let candidates = (0..10).map(|_| (vec![Value::Int(7)], 1.0)).collect();
        let bounds = determine_bounds(candidates, 4, &ordering());
        assert_eq!(bounds, vec![vec![Value::Int(7)]]);
    }

    #[test]
    fn round_robin_cycles() -> Result<()> {
        let schema = Schema::new(vec![Field::new("k", DataType::Int, false)]);
        let mut p = Partitioner::new(&Partitioning::RoundRobin(3), &schema, 0, None)?;
        let row = crate::row::GenericRow::new(vec![Value::Int(1)]);
        let first = p.partition(RowRef::Boxed(&row))?;
        let second = p.partition(RowRef::Boxed(&row))?;
        assert_eq!(second, (first + 1) % 3);
        Ok(())
    }
}
