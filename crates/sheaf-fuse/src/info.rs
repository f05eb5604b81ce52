//! Pass-wide bookkeeping shared by the driver and the strategies.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use sheaf_graph::{CallTarget, Graph, NodeId, ReduceKind};

use crate::element::{self, FusionElement, REDUCTION_OFFSET};
use crate::error::FuseError;

/// Snapshot taken at pass entry plus the mutable state the strategies
/// thread through a rewrite: the scanned elements, the wait-to-output-slot
/// mapping, gradient positions, and the ring staging pool.
#[derive(Debug)]
pub struct GraphInfo {
    /// Node count at entry.
    pub starting_len: usize,
    /// Element count at entry.
    pub starting_elements: usize,
    /// Scanned elements, in program order of their waits.
    pub elements: Vec<FusionElement>,
    /// Peak staging size in elements; set by the ring strategy's prepare.
    pub peak_numel: usize,
    /// Offset of the reduction inside every matched sequence.
    pub reduction_offset: usize,
    /// Output slot index fed by each scanned wait.
    pub slot_for_wait: HashMap<NodeId, usize>,
    /// Program-order position of each raw gradient. Strategies move nodes,
    /// so the driver refreshes this before every group.
    grad_position: HashMap<NodeId, usize>,
    pool: Vec<NodeId>,
    cursor: usize,
}

impl GraphInfo {
    /// Scans the graph and records everything the pass needs up front.
    /// Rejects graphs with no nodes, no output node, or an output whose
    /// wait list disagrees with the scan.
    pub(crate) fn capture(graph: &Graph, expected: ReduceKind) -> Result<Self, FuseError> {
        if graph.is_empty() {
            return Err(FuseError::malformed("graph has no nodes"));
        }
        let output_args = graph
            .output_args()
            .map_err(|_| FuseError::malformed("graph has no output node"))?;

        let elements = element::scan(graph, expected)?;
        for element in &elements {
            let offset = element
                .sequence
                .iter()
                .position(|&n| n == element.reduction);
            if offset != Some(REDUCTION_OFFSET) {
                return Err(FuseError::malformed_at(
                    "reduction sits at an unexpected offset in its sequence",
                    element.reduction,
                ));
            }
        }

        let mut slot_for_wait = HashMap::new();
        let mut wait_slots = 0usize;
        for (slot, arg) in output_args.iter().enumerate() {
            if let Some(id) = arg.as_node() {
                if graph.node(id).is_call(CallTarget::WaitComm) {
                    slot_for_wait.insert(id, slot);
                    wait_slots += 1;
                }
            }
        }
        if wait_slots != elements.len() || slot_for_wait.len() != elements.len() {
            return Err(FuseError::malformed(format!(
                "scanned {} collective sequences but the output reads {} wait slots",
                elements.len(),
                wait_slots
            )));
        }

        Ok(GraphInfo {
            starting_len: graph.len(),
            starting_elements: elements.len(),
            elements,
            peak_numel: 0,
            reduction_offset: REDUCTION_OFFSET,
            slot_for_wait,
            grad_position: HashMap::new(),
            pool: Vec::new(),
            cursor: 0,
        })
    }

    /// Installs the ring staging pool. Resets the cycling cursor.
    pub(crate) fn set_ring_pool(&mut self, pool: Vec<NodeId>) {
        self.pool = pool;
        self.cursor = 0;
    }

    /// Next buffer in the ring, cycling through the pool.
    pub(crate) fn next_ring_buffer(&mut self) -> Result<NodeId, FuseError> {
        if self.pool.is_empty() {
            return Err(FuseError::invariant("ring staging pool is empty"));
        }
        let buffer = self.pool[self.cursor % self.pool.len()];
        self.cursor += 1;
        Ok(buffer)
    }

    /// Rebuilds the gradient position map from the graph's current order.
    pub(crate) fn refresh_grad_positions(&mut self, graph: &Graph) {
        let grads: HashSet<NodeId> = self.elements.iter().map(|e| e.grad).collect();
        self.grad_position.clear();
        for (pos, id) in graph.nodes().enumerate() {
            if grads.contains(&id) {
                self.grad_position.insert(id, pos);
            }
        }
    }

    /// Index (into `elements`) of the group member whose raw gradient is
    /// produced last. Fused nodes are anchored after that gradient so no
    /// staged copy reads a value that does not exist yet.
    pub(crate) fn last_grad_element(&self, group: Range<usize>) -> Result<usize, FuseError> {
        let mut best: Option<(usize, usize)> = None;
        for index in group {
            let grad = self.elements[index].grad;
            let pos = *self
                .grad_position
                .get(&grad)
                .ok_or_else(|| FuseError::invariant(format!("stale position mapping for {grad}")))?;
            if best.map_or(true, |(_, best_pos)| pos > best_pos) {
                best = Some((index, pos));
            }
        }
        best.map(|(index, _)| index)
            .ok_or_else(|| FuseError::invariant("empty fusion group"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheaf_graph::mock::backward_graph;
    use sheaf_graph::Arg;

    #[test]
    fn capture_records_slots_and_sizes() {
        let graph = backward_graph(&[&[10], &[20], &[5]]);
        let info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        assert_eq!(info.starting_elements, 3);
        assert_eq!(info.starting_len, graph.len());
        assert_eq!(info.reduction_offset, REDUCTION_OFFSET);
        for (i, element) in info.elements.iter().enumerate() {
            assert_eq!(info.slot_for_wait[&element.wait], i);
        }
    }

    #[test]
    fn capture_rejects_missing_output() {
        let graph = Graph::new();
        let err = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap_err();
        assert!(matches!(err, FuseError::MalformedGraph { .. }));
    }

    #[test]
    fn capture_rejects_wait_not_read_by_output() {
        let mut graph = backward_graph(&[&[10], &[20]]);
        let args = graph.output_args().unwrap().to_vec();
        // Drop the second wait from the output list.
        graph.rewrite_output(args[..1].to_vec()).unwrap();
        let err = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap_err();
        assert!(matches!(err, FuseError::MalformedGraph { .. }));
    }

    #[test]
    fn ring_pool_cycles() {
        let graph = backward_graph(&[&[4], &[4], &[4]]);
        let mut info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        let a = NodeId::from_index(100);
        let b = NodeId::from_index(101);
        info.set_ring_pool(vec![a, b]);
        assert_eq!(info.next_ring_buffer().unwrap(), a);
        assert_eq!(info.next_ring_buffer().unwrap(), b);
        assert_eq!(info.next_ring_buffer().unwrap(), a);
    }

    #[test]
    fn empty_ring_pool_is_an_invariant_failure() {
        let graph = backward_graph(&[&[4]]);
        let mut info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        let err = info.next_ring_buffer().unwrap_err();
        assert!(matches!(err, FuseError::Invariant { .. }));
    }

    #[test]
    fn last_grad_element_tracks_program_order() {
        let graph = backward_graph(&[&[4], &[6], &[8]]);
        let mut info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        info.refresh_grad_positions(&graph);
        assert_eq!(info.last_grad_element(0..3).unwrap(), 2);
        assert_eq!(info.last_grad_element(0..2).unwrap(), 1);
        assert_eq!(info.last_grad_element(1..2).unwrap(), 1);
    }

    #[test]
    fn stale_positions_surface_as_invariant() {
        let graph = backward_graph(&[&[4], &[6]]);
        let info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        // Positions never refreshed.
        let err = info.last_grad_element(0..2).unwrap_err();
        assert!(matches!(err, FuseError::Invariant { .. }));
    }

    #[test]
    fn output_args_survive_capture() {
        let graph = backward_graph(&[&[10]]);
        let info = GraphInfo::capture(&graph, ReduceKind::Sum).unwrap();
        let args = graph.output_args().unwrap();
        assert!(matches!(args[0], Arg::Node(id) if id == info.elements[0].wait));
    }
}
