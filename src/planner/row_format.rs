//! Insert row-format converters between operators that disagree on packed
//! versus boxed rows.

use super::PlannerDecision;
use crate::exec::{ToBoxedExec, ToPackedExec};
use crate::plan::{FormatRequirement, PlanRef, transform_up};
use crate::row::RowFormat;
use anyhow::Result;
use std::sync::Arc;

/// One bottom-up pass; each converter strictly reduces disagreement so no
/// second pass is needed.
///
/// # Errors
///
/// Returns a planning error if a node cannot be rebuilt over its converted
/// children.
pub fn insert_row_conversions(plan: &PlanRef) -> Result<(PlanRef, Vec<PlannerDecision>)> {
    let mut decisions = Vec::new();
    let plan = transform_up(plan, &mut |node| convert_node(node, &mut decisions))?;
    Ok((plan, decisions))
}

fn convert_node(node: PlanRef, decisions: &mut Vec<PlannerDecision>) -> Result<PlanRef> {
    let children = node.children();
    if children.is_empty() {
        return Ok(node);
    }
    let Some(target) = target_format(node.required_input_format(), &children) else {
        return Ok(node);
    };
    let mut changed = false;
    let mut converted = Vec::with_capacity(children.len());
    for (i, child) in children.into_iter().enumerate() {
        if child.output_format() == target {
            converted.push(child);
            continue;
        }
        changed = true;
        decisions.push(PlannerDecision::ConverterInserted {
            operator: node.name(),
            child: i,
            to: target,
        });
        let wrapped: PlanRef = match target {
            RowFormat::Packed => Arc::new(ToPackedExec::new(child)?),
            RowFormat::Boxed => Arc::new(ToBoxedExec::new(child)),
        };
        converted.push(wrapped);
    }
    if changed {
        node.with_new_children(converted)
    } else {
        Ok(node)
    }
}

/// The format every child must produce, or `None` when they can stay as is.
fn target_format(requirement: FormatRequirement, children: &[PlanRef]) -> Option<RowFormat> {
    match requirement {
        FormatRequirement::Packed => Some(RowFormat::Packed),
        FormatRequirement::Boxed => Some(RowFormat::Boxed),
        FormatRequirement::Any => {
            let first = children.first()?.output_format();
            if children.iter().all(|c| c.output_format() == first) {
                return None;
            }
            let packable = children.iter().all(|c| c.schema().supports_packed());
            Some(if packable {
                RowFormat::Packed
            } else {
                RowFormat::Boxed
            })
        }
    }
}
