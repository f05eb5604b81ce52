//! Staged output-slot rewriting.
//!
//! Fused results reach the output node through a staged copy of its
//! argument list. Each group swaps only the slots its waits feed; the
//! staged list hits the real output node once, at finalize. Rewriting
//! disjoint groups therefore commutes, and a slot that no longer holds
//! the wait it should is caught here instead of corrupting the output.

use sheaf_graph::{Arg, NodeId};

use crate::element::FusionElement;
use crate::error::FuseError;
use crate::info::GraphInfo;

/// Swaps each member's output slot from its wait to the fused result.
pub(crate) fn stage_group(
    info: &GraphInfo,
    staged: &mut [Arg],
    members: &[FusionElement],
    results: &[NodeId],
) -> Result<(), FuseError> {
    if members.len() != results.len() {
        return Err(FuseError::invariant(format!(
            "strategy returned {} results for {} members",
            results.len(),
            members.len()
        )));
    }
    for (member, &result) in members.iter().zip(results) {
        let slot = *info.slot_for_wait.get(&member.wait).ok_or_else(|| {
            FuseError::invariant(format!("no output slot recorded for {}", member.wait))
        })?;
        match staged.get(slot) {
            Some(Arg::Node(held)) if *held == member.wait => {}
            Some(held) => {
                return Err(FuseError::invariant(format!(
                    "output slot {slot} holds {held:?}, expected {}",
                    member.wait
                )))
            }
            None => {
                return Err(FuseError::invariant(format!(
                    "output slot {slot} is out of range"
                )))
            }
        }
        staged[slot] = Arg::Node(result);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheaf_graph::mock::backward_graph;
    use sheaf_graph::ReduceKind;

    #[test]
    fn disjoint_groups_commute() {
        let graph = backward_graph(&[&[2], &[3], &[4], &[5]]);
        let info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        let fresh: Vec<Arg> = graph.output_args().unwrap().to_vec();
        let results: Vec<NodeId> = info.elements.iter().map(|e| e.grad).collect();

        let mut forward = fresh.clone();
        stage_group(&info, &mut forward, &info.elements[..2], &results[..2]).unwrap();
        stage_group(&info, &mut forward, &info.elements[2..], &results[2..]).unwrap();

        let mut reverse = fresh.clone();
        stage_group(&info, &mut reverse, &info.elements[2..], &results[2..]).unwrap();
        stage_group(&info, &mut reverse, &info.elements[..2], &results[..2]).unwrap();

        let mut union = fresh;
        stage_group(&info, &mut union, &info.elements, &results).unwrap();

        assert_eq!(forward, reverse);
        assert_eq!(forward, union);
        for (slot, arg) in forward.iter().enumerate() {
            assert!(matches!(arg, Arg::Node(id) if *id == results[slot]));
        }
    }

    #[test]
    fn slot_not_holding_its_wait_is_an_invariant_failure() {
        let graph = backward_graph(&[&[2], &[3]]);
        let info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        let mut staged: Vec<Arg> = graph.output_args().unwrap().to_vec();
        let results: Vec<NodeId> = info.elements.iter().map(|e| e.grad).collect();

        stage_group(&info, &mut staged, &info.elements, &results).unwrap();
        // Second application of the same group: slots now hold results.
        let err = stage_group(&info, &mut staged, &info.elements, &results).unwrap_err();
        assert!(matches!(err, FuseError::Invariant { .. }));
    }

    #[test]
    fn result_count_mismatch_is_an_invariant_failure() {
        let graph = backward_graph(&[&[2], &[3]]);
        let info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        let mut staged: Vec<Arg> = graph.output_args().unwrap().to_vec();
        let results = vec![info.elements[0].grad];
        let err = stage_group(&info, &mut staged, &info.elements, &results).unwrap_err();
        assert!(matches!(err, FuseError::Invariant { .. }));
    }
}
