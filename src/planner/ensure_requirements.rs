//! Insert exchanges and local sorts wherever an operator's required child
//! distribution or ordering is not already met by what the child produces.

use super::PlannerDecision;
use crate::config::ExecConfig;
use crate::exchange::{BroadcastExchangeExec, ShuffleExchangeExec};
use crate::exec::SortExec;
use crate::expr::{Expr, ordering_satisfies};
use crate::partitioning::{Distribution, Partitioning};
use crate::plan::{PlanRef, downcast, transform_up};
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Rewrite `plan` bottom-up so every operator's child requirements hold.
///
/// # Errors
///
/// Returns a planning error if an exchange or sort cannot be built over a
/// child, e.g. because its keys do not bind.
pub fn ensure_requirements(
    plan: &PlanRef,
    config: &ExecConfig,
) -> Result<(PlanRef, Vec<PlannerDecision>)> {
    let mut decisions = Vec::new();
    let plan = transform_up(plan, &mut |node| ensure_node(node, config, &mut decisions))?;
    Ok((plan, decisions))
}

fn ensure_node(
    node: PlanRef,
    config: &ExecConfig,
    decisions: &mut Vec<PlannerDecision>,
) -> Result<PlanRef> {
    let original = node.children();
    if original.is_empty() {
        return Ok(node);
    }
    let distributions = node.required_child_distribution();
    let orderings = node.required_child_ordering();
    let mut children = original.clone();

    for (i, child) in children.iter_mut().enumerate() {
        let Some(required) = distributions.get(i) else {
            continue;
        };
        if child.output_partitioning().satisfies(required) {
            continue;
        }
        *child = if *required == Distribution::Broadcast {
            decisions.push(PlannerDecision::BroadcastInserted {
                operator: node.name(),
                child: i,
            });
            Arc::new(BroadcastExchangeExec::new(Arc::clone(child)))
        } else {
            let partitioning = required.create_partitioning(config.shuffle_partitions)?;
            shuffle_to(node.name(), i, partitioning, child, decisions)?
        };
    }

    co_partition(node.name(), &distributions, &mut children, config, decisions)?;

    for (i, child) in children.iter_mut().enumerate() {
        let Some(required) = orderings.get(i) else {
            continue;
        };
        if required.is_empty() || ordering_satisfies(&child.output_ordering(), required) {
            continue;
        }
        decisions.push(PlannerDecision::SortInserted {
            operator: node.name(),
            child: i,
            ordering: required.iter().map(ToString::to_string).collect(),
        });
        *child = Arc::new(SortExec::new(required.clone(), false, Arc::clone(child))?);
    }

    let unchanged = children.iter().zip(&original).all(|(a, b)| Arc::ptr_eq(a, b));
    if unchanged {
        Ok(node)
    } else {
        node.with_new_children(children)
    }
}

/// Give every clustered child of a multi-child operator the same partition
/// count and the same hash keys, so matching rows meet in the same task.
fn co_partition(
    operator: &'static str,
    distributions: &[Distribution],
    children: &mut [PlanRef],
    config: &ExecConfig,
    decisions: &mut Vec<PlannerDecision>,
) -> Result<()> {
    let clustered: Vec<usize> = distributions
        .iter()
        .enumerate()
        .filter(|(i, d)| *i < children.len() && matches!(d, Distribution::Clustered { .. }))
        .map(|(i, _)| i)
        .collect();
    if clustered.len() < 2 {
        return Ok(());
    }

    let target = target_partitions(&clustered, distributions, children, config);
    let reconciled = clustered
        .iter()
        .any(|&i| children[i].num_partitions() != target);
    if reconciled {
        decisions.push(PlannerDecision::PartitionCountReconciled {
            operator,
            num_partitions: target,
        });
    }
    for &i in &clustered {
        let child = &children[i];
        if child.num_partitions() == target && child.output_partitioning().satisfies(&distributions[i]) {
            continue;
        }
        let partitioning = distributions[i].create_partitioning(target)?;
        children[i] = shuffle_to(operator, i, partitioning, child, decisions)?;
    }

    if keys_line_up(&clustered, distributions, children) {
        return Ok(());
    }
    debug!(operator, "children are hash partitioned on different keys");
    for &i in &clustered {
        let canonical = distributions[i].create_partitioning(target)?;
        if children[i].output_partitioning() == canonical {
            continue;
        }
        children[i] = shuffle_to(operator, i, canonical, &children[i], decisions)?;
    }
    Ok(())
}

/// Partition count the clustered children are brought to.
///
/// Children that are not shuffles keep their layout when possible, so the
/// largest of their counts wins if every child is one of them. When some
/// children shuffle anyway, the count is never below the configured shuffle
/// partitions.
fn target_partitions(
    clustered: &[usize],
    distributions: &[Distribution],
    children: &[PlanRef],
    config: &ExecConfig,
) -> usize {
    if let Some(n) = clustered
        .iter()
        .find_map(|&i| distributions[i].required_num_partitions())
    {
        return n;
    }
    let non_shuffle: Vec<usize> = clustered
        .iter()
        .filter(|&&i| downcast::<ShuffleExchangeExec>(&children[i]).is_none())
        .map(|&i| children[i].num_partitions())
        .collect();
    match non_shuffle.iter().max() {
        Some(&max) if non_shuffle.len() == clustered.len() => max,
        Some(&max) => max.max(config.shuffle_partitions),
        None => clustered
            .iter()
            .map(|&i| children[i].num_partitions())
            .max()
            .unwrap_or(config.shuffle_partitions),
    }
}

fn keys_line_up(clustered: &[usize], distributions: &[Distribution], children: &[PlanRef]) -> bool {
    if clustered.iter().all(|&i| children[i].num_partitions() == 1) {
        return true;
    }
    let positions: Vec<Option<Vec<usize>>> = clustered
        .iter()
        .map(|&i| {
            let keys: &[Expr] = match &distributions[i] {
                Distribution::Clustered { keys, .. } => keys,
                _ => &[],
            };
            children[i].output_partitioning().key_positions(keys)
        })
        .collect();
    positions.iter().all(Option::is_some) && positions.windows(2).all(|w| w[0] == w[1])
}

/// Shuffle `child` to `partitioning`, retargeting it if it already is a shuffle.
fn shuffle_to(
    operator: &'static str,
    index: usize,
    partitioning: Partitioning,
    child: &PlanRef,
    decisions: &mut Vec<PlannerDecision>,
) -> Result<PlanRef> {
    decisions.push(PlannerDecision::ExchangeInserted {
        operator,
        child: index,
        partitioning: partitioning.to_string(),
    });
    let exchange = match downcast::<ShuffleExchangeExec>(child) {
        Some(existing) => existing.with_partitioning(partitioning)?,
        None => ShuffleExchangeExec::new(partitioning, Arc::clone(child))?,
    };
    Ok(Arc::new(exchange))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;
    use crate::plan::count_nodes;
    use crate::exec::FilterExec;
    use crate::expr::lit;
    use crate::testing::{hash_partitioned_scan, int_schema, sequential_rows};

    #[test]
    fn satisfied_children_are_left_alone() -> Result<()> {
        let schema = int_schema(&["a", "b"]);
        let rows = sequential_rows(&schema, &[10]).concat();
        let scan = hash_partitioned_scan(&schema, rows, &["a"], 3)?;
        let filter: PlanRef = Arc::new(FilterExec::new(col("a").gt(lit(1)), scan)?);
        let (plan, decisions) = ensure_requirements(&filter, &ExecConfig::default())?;
        assert!(decisions.is_empty());
        assert!(Arc::ptr_eq(&plan, &filter));
        assert_eq!(count_nodes(&plan, "ShuffleExchangeExec"), 0);
        Ok(())
    }
}
