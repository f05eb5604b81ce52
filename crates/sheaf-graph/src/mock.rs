//! Synthetic captured graphs for tests and benches.

use crate::graph::Graph;
use crate::meta::{Shape, TensorMeta};
use crate::node::{Arg, CallTarget, NodeId, ReduceKind};

/// Handles into one collective reduce sequence appended by [`reduce_block`].
#[derive(Clone, Copy, Debug)]
pub struct CommBlock {
    pub clone: NodeId,
    pub group: NodeId,
    pub tag: NodeId,
    pub reduction: NodeId,
    pub wait: NodeId,
}

/// Appends the canonical collective sequence for one gradient:
/// clone, comm group handle, reduce tag, async reduction, wait.
pub fn reduce_block(graph: &mut Graph, grad: NodeId, kind: ReduceKind) -> CommBlock {
    let meta = graph.meta(grad).cloned();
    let clone = graph.call(CallTarget::CloneTensor, vec![Arg::Node(grad)]);
    if let Some(meta) = meta.clone() {
        graph.set_meta(clone, meta);
    }
    let group = graph.call(CallTarget::CommGroup, vec![]);
    let tag = graph.call(CallTarget::ReduceTag(kind), vec![]);
    let reduction = graph.call(
        CallTarget::AllReduce,
        vec![Arg::Nodes(vec![clone]), Arg::Node(group), Arg::Node(tag)],
    );
    let wait = graph.call(CallTarget::WaitComm, vec![Arg::Node(reduction)]);
    if let Some(meta) = meta {
        graph.set_meta(reduction, meta.clone());
        graph.set_meta(wait, meta);
    }
    CommBlock {
        clone,
        group,
        tag,
        reduction,
        wait,
    }
}

/// Builds a captured backward step: one parameter per shape, a local
/// gradient for each, a collective reduce sequence per gradient, and an
/// output listing every wait in production order.
pub fn backward_graph(shapes: &[&[usize]]) -> Graph {
    let mut graph = Graph::new();
    let params: Vec<NodeId> = shapes
        .iter()
        .map(|dims| graph.placeholder(Some(TensorMeta::f32(Shape::from_slice(dims)))))
        .collect();
    let mut waits = Vec::with_capacity(shapes.len());
    for (param, dims) in params.into_iter().zip(shapes) {
        let grad = graph.call(CallTarget::Mul, vec![Arg::Node(param), Arg::Node(param)]);
        graph.set_meta(grad, TensorMeta::f32(Shape::from_slice(dims)));
        let block = reduce_block(&mut graph, grad, ReduceKind::Sum);
        waits.push(Arg::Node(block.wait));
    }
    graph
        .set_output(waits)
        .unwrap_or_else(|err| panic!("mock graph output: {err}"));
    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_graph_is_well_formed() {
        let graph = backward_graph(&[&[4, 4], &[16]]);
        graph.verify().unwrap();
        // 2 placeholders, 2 grads, 2 five-node reduce sequences, 1 output.
        assert_eq!(graph.len(), 2 + 2 + 10 + 1);
        let waits = graph
            .nodes()
            .filter(|&n| graph.node(n).is_call(CallTarget::WaitComm))
            .count();
        assert_eq!(waits, 2);
    }
}
