//! Collapse chains of compilable operators into fused whole-stage operators.

use super::PlannerDecision;
use crate::exec::WholeStageExec;
use crate::plan::PlanRef;
use anyhow::Result;
use std::sync::Arc;

/// Replace every maximal chain of unary compilable operators with one
/// [`WholeStageExec`]. Stage ids are numbered from 1 within the plan.
///
/// # Errors
///
/// Returns a planning error if a fused chain cannot be rebuilt.
pub fn collapse_codegen_stages(plan: &PlanRef) -> Result<(PlanRef, Vec<PlannerDecision>)> {
    let mut next_stage = 1;
    let mut decisions = Vec::new();
    let plan = collapse(plan, &mut next_stage, &mut decisions)?;
    Ok((plan, decisions))
}

fn collapse(
    plan: &PlanRef,
    next_stage: &mut usize,
    decisions: &mut Vec<PlannerDecision>,
) -> Result<PlanRef> {
    let chain = fusable_chain(plan);
    if chain.is_empty() {
        return rebuild_children(plan, next_stage, decisions);
    }

    let Some(bottom) = chain.last() else {
        return Ok(Arc::clone(plan));
    };
    let input = bottom.children().remove(0);
    let new_input = collapse(&input, next_stage, decisions)?;
    let top = if Arc::ptr_eq(&new_input, &input) {
        Arc::clone(plan)
    } else {
        let mut cur = new_input;
        for node in chain.iter().rev() {
            cur = node.with_new_children(vec![cur])?;
        }
        cur
    };

    let stage_id = *next_stage;
    *next_stage += 1;
    decisions.push(PlannerDecision::StageFused {
        stage_id,
        operators: chain.iter().map(|n| n.name()).collect(),
    });
    Ok(Arc::new(WholeStageExec::new(top, chain.len(), stage_id)?))
}

/// Compilable unary operators from `plan` downwards, top first.
fn fusable_chain(plan: &PlanRef) -> Vec<PlanRef> {
    let mut chain = Vec::new();
    let mut cur = Arc::clone(plan);
    loop {
        let children = cur.children();
        if cur.as_compilable().is_none() || children.len() != 1 {
            break;
        }
        chain.push(Arc::clone(&cur));
        cur = Arc::clone(&children[0]);
    }
    chain
}

fn rebuild_children(
    plan: &PlanRef,
    next_stage: &mut usize,
    decisions: &mut Vec<PlannerDecision>,
) -> Result<PlanRef> {
    let children = plan.children();
    if children.is_empty() {
        return Ok(Arc::clone(plan));
    }
    let new_children = children
        .iter()
        .map(|c| collapse(c, next_stage, decisions))
        .collect::<Result<Vec<_>>>()?;
    if new_children.iter().zip(&children).all(|(a, b)| Arc::ptr_eq(a, b)) {
        Ok(Arc::clone(plan))
    } else {
        plan.with_new_children(new_children)
    }
}
