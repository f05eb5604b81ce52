//! Strategy seam and rewiring helpers shared by its implementations.

use std::ops::Range;

use sheaf_graph::{Arg, Graph, NodeId, TensorMeta};

use crate::element::FusionElement;
use crate::error::FuseError;
use crate::info::GraphInfo;

/// One way of collapsing a run of scanned collectives into a single
/// reduction.
///
/// The driver owns sequencing: it validates, scans, plans, prepares once,
/// then calls [`fuse_group`](FusionStrategy::fuse_group) per planned group
/// and stages the returned results into the output node. A strategy only
/// rewrites the nodes of the group it was handed.
pub trait FusionStrategy {
    /// Name used in spans and log lines.
    fn name(&self) -> &'static str;

    /// Rejects unusable options before the graph is touched.
    fn validate(&self) -> Result<(), FuseError>;

    /// Partitions the scanned elements into consecutive groups.
    fn plan(&self, elements: &[FusionElement]) -> Vec<Range<usize>>;

    /// One-time setup between scanning and the first group. The default
    /// does nothing; the ring strategy allocates its staging pool here.
    fn prepare(&self, _graph: &mut Graph, _info: &mut GraphInfo) -> Result<(), FuseError> {
        Ok(())
    }

    /// Collapses one group and returns a replacement result node per
    /// member, in group order.
    fn fuse_group(
        &self,
        graph: &mut Graph,
        info: &mut GraphInfo,
        group: Range<usize>,
    ) -> Result<Vec<NodeId>, FuseError>;
}

/// Consecutive index ranges of at most `size` elements.
pub(crate) fn chunk_ranges(len: usize, size: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < len {
        let stop = usize::min(start + size, len);
        ranges.push(start..stop);
        start = stop;
    }
    ranges
}

/// Points the group's surviving reduction at `input` and drags it, with
/// its comm group and reduce tag, into place after `anchor`. Program order
/// afterwards: `anchor, comm_group, reduce_tag, reduction`.
pub(crate) fn rewire_reduction(
    graph: &mut Graph,
    last: &FusionElement,
    input: NodeId,
    anchor: NodeId,
) -> Result<NodeId, FuseError> {
    let reduction = last.reduction;
    graph.move_after(last.group_handle(), anchor)?;
    graph.move_after(last.reduce_tag(), last.group_handle())?;
    graph.move_after(reduction, last.reduce_tag())?;
    graph.replace_arg(reduction, 0, Arg::Nodes(vec![input]))?;
    Ok(reduction)
}

/// Settles the group's wait after its reduction moved: the wait must sit
/// later in program order than the reduction it consumes (clone disorder
/// can leave it ahead of the moved node), and both now produce the fused
/// flat value.
pub(crate) fn settle_wait(
    graph: &mut Graph,
    wait: NodeId,
    reduction: NodeId,
    fused: TensorMeta,
) -> Result<(), FuseError> {
    let wait_pos = graph
        .position_of(wait)
        .ok_or_else(|| FuseError::invariant(format!("wait {wait} vanished during rewrite")))?;
    let reduction_pos = graph.position_of(reduction).ok_or_else(|| {
        FuseError::invariant(format!("reduction {reduction} vanished during rewrite"))
    })?;
    if wait_pos < reduction_pos {
        graph.move_after(wait, reduction)?;
    }
    graph.set_meta(reduction, fused.clone());
    graph.set_meta(wait, fused);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_partitions_consecutively() {
        assert_eq!(chunk_ranges(5, 2), vec![0..2, 2..4, 4..5]);
        assert_eq!(chunk_ranges(4, 2), vec![0..2, 2..4]);
        assert_eq!(chunk_ranges(3, 8), vec![0..3]);
        assert!(chunk_ranges(0, 2).is_empty());
    }
}
