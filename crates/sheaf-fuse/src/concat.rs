//! Concatenation fusion.
//!
//! Flattens each gradient in a group, concatenates the pieces into one
//! tensor, reduces that once, then splits the result back into
//! per-gradient reshapes. Nothing is staged through shared storage, so
//! there is no pool and no peak estimate, and every result handed to the
//! output is an owned tensor.

use std::ops::Range;

use sheaf_graph::{Arg, CallTarget, Graph, NodeId, TensorMeta};

use crate::config::FusionOptions;
use crate::element::FusionElement;
use crate::error::FuseError;
use crate::info::GraphInfo;
use crate::strategy::{chunk_ranges, rewire_reduction, settle_wait, FusionStrategy};

/// Count-based fusion by concatenation.
pub struct Concatenation {
    options: FusionOptions,
}

impl Concatenation {
    pub fn new(options: FusionOptions) -> Self {
        Concatenation { options }
    }
}

impl FusionStrategy for Concatenation {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn validate(&self) -> Result<(), FuseError> {
        self.options.validate()
    }

    fn plan(&self, elements: &[FusionElement]) -> Vec<Range<usize>> {
        chunk_ranges(elements.len(), self.options.fusion_length)
    }

    fn fuse_group(
        &self,
        graph: &mut Graph,
        info: &mut GraphInfo,
        group: Range<usize>,
    ) -> Result<Vec<NodeId>, FuseError> {
        let members: Vec<FusionElement> = info.elements[group.clone()].to_vec();
        let last = members
            .last()
            .ok_or_else(|| FuseError::invariant("empty fusion group"))?;
        let total: usize = members.iter().map(|m| m.numel).sum();

        let anchor_index = info.last_grad_element(group)?;
        let mut cursor = info.elements[anchor_index].grad;

        // Flatten every raw gradient behind the last-produced one, then
        // pack the pieces into a single tensor.
        let mut flats = Vec::with_capacity(members.len());
        for member in &members {
            let flat = graph.call_after(cursor, CallTarget::Flatten, vec![Arg::Node(member.grad)])?;
            graph.set_meta(flat, TensorMeta::flat_f32(member.numel));
            flats.push(flat);
            cursor = flat;
        }
        let packed = graph.call_after(cursor, CallTarget::Concat, vec![Arg::Nodes(flats)])?;
        graph.set_meta(packed, TensorMeta::flat_f32(total));

        let reduction = rewire_reduction(graph, last, packed, packed)?;
        settle_wait(graph, last.wait, reduction, TensorMeta::flat_f32(total))?;

        // Split the reduced tensor and restore each gradient's shape.
        let sizes: Vec<usize> = members.iter().map(|m| m.numel).collect();
        let split = graph.call_after(
            last.wait,
            CallTarget::SplitTensor,
            vec![Arg::Node(last.wait), Arg::Sizes(sizes)],
        )?;
        let mut results = Vec::with_capacity(members.len());
        let mut cursor = split;
        for (index, member) in members.iter().enumerate() {
            let piece = graph.call_after(
                cursor,
                CallTarget::IndexItem,
                vec![Arg::Node(split), Arg::Size(index)],
            )?;
            graph.set_meta(piece, TensorMeta::flat_f32(member.numel));
            let shaped = graph.call_after(
                piece,
                CallTarget::Reshape,
                vec![Arg::Node(piece), Arg::Sizes(member.shape.dims().to_vec())],
            )?;
            graph.set_meta(shaped, TensorMeta::f32(member.shape.clone()));
            results.push(shaped);
            cursor = shaped;
        }
        Ok(results)
    }
}
