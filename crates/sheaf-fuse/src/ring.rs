//! Ring-buffer copy fusion.
//!
//! Stages each group's gradients into one slot of a pre-allocated buffer
//! pool, reduces the whole buffer in a single collective, then copies the
//! reduced slices back out into the original staging clones:
//!
//! ```text
//!   clone0 ─┐                      ┌─▶ slice0 ─ reshape0 ─▶ clone0
//!   clone1 ─┼─▶ buffer ─ reduce ─ wait ─ slice1 ─ reshape1 ─▶ clone1
//!   clone2 ─┘                      └─▶ slice2 ─ reshape2 ─▶ clone2
//! ```
//!
//! The pool is sized once from the peak group footprint, so no per-group
//! allocation happens. Staging and unpacking are built as scratch
//! templates and spliced in, which keeps the emission order independent of
//! the host graph's layout.

use std::ops::Range;

use tracing::debug;

use sheaf_graph::{Arg, CallTarget, Graph, NodeId, TensorMeta};

use crate::config::FusionOptions;
use crate::element::FusionElement;
use crate::error::FuseError;
use crate::estimate::peak_group_numel;
use crate::info::GraphInfo;
use crate::strategy::{chunk_ranges, rewire_reduction, settle_wait, FusionStrategy};

/// Count-based fusion through a cycling pool of staging buffers.
///
/// Results handed back for the output node are the original staging
/// clones: the reduced values are copied into storage the graph already
/// owns, so downstream consumers see ordinary independent tensors.
pub struct RingBufferCopy {
    options: FusionOptions,
}

impl RingBufferCopy {
    pub fn new(options: FusionOptions) -> Self {
        RingBufferCopy { options }
    }
}

impl FusionStrategy for RingBufferCopy {
    fn name(&self) -> &'static str {
        "ring_buffer_copy"
    }

    fn validate(&self) -> Result<(), FuseError> {
        self.options.validate()
    }

    fn plan(&self, elements: &[FusionElement]) -> Vec<Range<usize>> {
        chunk_ranges(elements.len(), self.options.fusion_length)
    }

    fn prepare(&self, graph: &mut Graph, info: &mut GraphInfo) -> Result<(), FuseError> {
        let peak = peak_group_numel(&info.elements, self.options.fusion_length);
        if peak == 0 {
            return Err(FuseError::invariant(
                "peak staging estimate is zero; nothing to stage",
            ));
        }
        info.peak_numel = peak;

        let anchor = graph
            .first_non_placeholder()
            .ok_or_else(|| FuseError::invariant("graph has no body to stage into"))?;
        let mut pool = Vec::with_capacity(self.options.ring_buffers);
        for _ in 0..self.options.ring_buffers {
            let buffer = graph.call_before(anchor, CallTarget::EmptyBuffer, vec![Arg::Size(peak)])?;
            graph.set_meta(buffer, TensorMeta::flat_f32(peak));
            pool.push(buffer);
        }
        debug!(peak, buffers = pool.len(), "allocated ring staging pool");
        info.set_ring_pool(pool);
        Ok(())
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
        if total > info.peak_numel {
            return Err(FuseError::invariant(format!(
                "group footprint {total} exceeds staging capacity {}",
                info.peak_numel
            )));
        }

        let buffer = info.next_ring_buffer()?;
        let anchor_index = info.last_grad_element(group)?;
        let mut cursor = info.elements[anchor_index].grad;

        // Pull the group's clones together behind the last-produced
        // gradient so every staged copy reads an existing value.
        for member in &members {
            graph.move_after(member.staged, cursor)?;
            cursor = member.staged;
        }

        let reduction = rewire_reduction(graph, last, buffer, cursor)?;
        let staging = staging_template(info.peak_numel, &members);
        let mut bindings = vec![buffer];
        bindings.extend(members.iter().map(|m| m.staged));
        graph.splice_before(reduction, &staging, &bindings)?;

        settle_wait(graph, last.wait, reduction, TensorMeta::flat_f32(info.peak_numel))?;

        let after_wait = graph
            .next_node(last.wait)
            .ok_or_else(|| FuseError::invariant("wait has nothing after it; output missing"))?;
        let unpack = unpack_template(info.peak_numel, &members);
        let mut bindings = vec![last.wait];
        bindings.extend(members.iter().map(|m| m.staged));
        graph.splice_before(after_wait, &unpack, &bindings)?;

        Ok(members.iter().map(|m| m.staged).collect())
    }
}

/// Scratch graph copying each gradient into its slice of the staging
/// buffer. Placeholders: the buffer, then one per staged clone.
fn staging_template(buffer_numel: usize, members: &[FusionElement]) -> Graph {
    let mut template = Graph::new();
    let buffer = template.placeholder(Some(TensorMeta::flat_f32(buffer_numel)));
    let staged: Vec<NodeId> = members
        .iter()
        .map(|m| template.placeholder(Some(TensorMeta::f32(m.shape.clone()))))
        .collect();
    let mut offset = 0;
    for (member, &src) in members.iter().zip(&staged) {
        let flat = template.call(CallTarget::Flatten, vec![Arg::Node(src)]);
        template.set_meta(flat, TensorMeta::flat_f32(member.numel));
        let slice = template.call(
            CallTarget::SliceRange,
            vec![
                Arg::Node(buffer),
                Arg::Size(offset),
                Arg::Size(offset + member.numel),
            ],
        );
        template.set_meta(slice, TensorMeta::flat_f32(member.numel));
        template.call(CallTarget::CopyInto, vec![Arg::Node(slice), Arg::Node(flat)]);
        offset += member.numel;
    }
    template
}

/// Scratch graph copying each reduced slice back into its staging clone.
/// Placeholders: the reduced buffer value, then one per staged clone.
fn unpack_template(buffer_numel: usize, members: &[FusionElement]) -> Graph {
    let mut template = Graph::new();
    let reduced = template.placeholder(Some(TensorMeta::flat_f32(buffer_numel)));
    let staged: Vec<NodeId> = members
        .iter()
        .map(|m| template.placeholder(Some(TensorMeta::f32(m.shape.clone()))))
        .collect();
    let mut offset = 0;
    for (member, &dst) in members.iter().zip(&staged) {
        let slice = template.call(
            CallTarget::SliceRange,
            vec![
                Arg::Node(reduced),
                Arg::Size(offset),
                Arg::Size(offset + member.numel),
            ],
        );
        template.set_meta(slice, TensorMeta::flat_f32(member.numel));
        let shaped = template.call(
            CallTarget::Reshape,
            vec![Arg::Node(slice), Arg::Sizes(member.shape.dims().to_vec())],
        );
        template.set_meta(shaped, TensorMeta::f32(member.shape.clone()));
        template.call(CallTarget::CopyInto, vec![Arg::Node(dst), Arg::Node(shaped)]);
        offset += member.numel;
    }
    template
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_template_shape() {
        let graph = sheaf_graph::mock::backward_graph(&[&[2, 3], &[4]]);
        let info = GraphInfo::capture(&graph, sheaf_graph::ReduceKind::Sum).unwrap();
        let template = staging_template(10, &info.elements);
        template.verify().unwrap();
        // Buffer + 2 gradients in, then flatten/slice/copy per element.
        assert_eq!(template.len(), 3 + 3 * 2);
        let copies = template
            .nodes()
            .filter(|&n| template.node(n).is_call(CallTarget::CopyInto))
            .count();
        assert_eq!(copies, 2);
    }

    #[test]
    fn unpack_template_restores_shapes() {
        let graph = sheaf_graph::mock::backward_graph(&[&[2, 3], &[4]]);
        let info = GraphInfo::capture(&graph, sheaf_graph::ReduceKind::Sum).unwrap();
        let template = unpack_template(10, &info.elements);
        template.verify().unwrap();
        let reshapes: Vec<NodeId> = template
            .nodes()
            .filter(|&n| template.node(n).is_call(CallTarget::Reshape))
            .collect();
        assert_eq!(reshapes.len(), 2);
        assert_eq!(template.meta(reshapes[0]).unwrap().shape.dims(), &[2, 3]);
        assert_eq!(template.meta(reshapes[1]).unwrap().shape.dims(), &[4]);
    }
}
