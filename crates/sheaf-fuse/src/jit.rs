//! Just-in-time buffer fusion.
//!
//! Groups by byte budget instead of element count, and materializes one
//! exactly-sized buffer per group at fuse time. Unlike the ring strategy
//! the staged copies are emitted straight into the host graph rather than
//! through a scratch template.
//!
//! The results handed to the output are views into the reduced buffer,
//! not owned copies. A caller that mutates one returned gradient in place
//! will observe the shared storage; both count strategies return owned
//! tensors instead. That asymmetry is part of this strategy's contract:
//! skipping the copy-out is exactly where its bandwidth win comes from.

use std::ops::Range;

use sheaf_graph::{Arg, CallTarget, Graph, NodeId, TensorMeta};

use crate::config::FusionOptions;
use crate::element::FusionElement;
use crate::error::FuseError;
use crate::info::GraphInfo;
use crate::strategy::{rewire_reduction, settle_wait, FusionStrategy};

/// Byte-budget fusion into per-group buffers.
pub struct JustInTime {
    options: FusionOptions,
    budget_bytes: usize,
}

impl JustInTime {
    /// Reads `fusion_length` as the group budget in MiB.
    pub fn new(options: FusionOptions) -> Self {
        let budget_bytes = options.fusion_length << 20;
        JustInTime {
            options,
            budget_bytes,
        }
    }

    /// Exact byte budget, bypassing the MiB convention.
    pub fn with_budget_bytes(options: FusionOptions, budget_bytes: usize) -> Self {
        JustInTime {
            options,
            budget_bytes,
        }
    }
}

impl FusionStrategy for JustInTime {
    fn name(&self) -> &'static str {
        "jit_buffer"
    }

    fn validate(&self) -> Result<(), FuseError> {
        self.options.validate()?;
        if self.budget_bytes == 0 {
            return Err(FuseError::InvalidConfiguration(
                "byte budget must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Accumulates gradient bytes and cuts a group after the element that
    /// reaches the budget; the trailing partial group is always flushed.
    fn plan(&self, elements: &[FusionElement]) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        let mut bytes = 0usize;
        for (index, element) in elements.iter().enumerate() {
            bytes += element.numel * element.dtype.size_bytes();
            if bytes >= self.budget_bytes {
                ranges.push(start..index + 1);
                start = index + 1;
                bytes = 0;
            }
        }
        if start < elements.len() {
            ranges.push(start..elements.len());
        }
        ranges
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
        let anchor = info.elements[anchor_index].grad;

        // Fresh buffer sized to this group alone, then one
        // flatten/slice/copy chain per gradient straight into it.
        let buffer = graph.call_after(anchor, CallTarget::EmptyBuffer, vec![Arg::Size(total)])?;
        graph.set_meta(buffer, TensorMeta::flat_f32(total));
        let mut cursor = buffer;
        let mut offset = 0;
        for member in &members {
            let flat = graph.call_after(cursor, CallTarget::Flatten, vec![Arg::Node(member.grad)])?;
            graph.set_meta(flat, TensorMeta::flat_f32(member.numel));
            let slice = graph.call_after(
                flat,
                CallTarget::SliceRange,
                vec![
                    Arg::Node(buffer),
                    Arg::Size(offset),
                    Arg::Size(offset + member.numel),
                ],
            )?;
            graph.set_meta(slice, TensorMeta::flat_f32(member.numel));
            cursor = graph.call_after(
                slice,
                CallTarget::CopyInto,
                vec![Arg::Node(slice), Arg::Node(flat)],
            )?;
            offset += member.numel;
        }

        let reduction = rewire_reduction(graph, last, buffer, cursor)?;
        settle_wait(graph, last.wait, reduction, TensorMeta::flat_f32(total))?;

        // Views over the reduced buffer, one per gradient.
        let mut results = Vec::with_capacity(members.len());
        let mut cursor = last.wait;
        let mut offset = 0;
        for member in &members {
            let slice = graph.call_after(
                cursor,
                CallTarget::SliceRange,
                vec![
                    Arg::Node(last.wait),
                    Arg::Size(offset),
                    Arg::Size(offset + member.numel),
                ],
            )?;
            graph.set_meta(slice, TensorMeta::flat_f32(member.numel));
            let view = graph.call_after(
                slice,
                CallTarget::ViewAs,
                vec![Arg::Node(slice), Arg::Sizes(member.shape.dims().to_vec())],
            )?;
            graph.set_meta(view, TensorMeta::f32(member.shape.clone()));
            results.push(view);
            cursor = view;
            offset += member.numel;
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheaf_graph::ReduceKind;

    fn scanned(shapes: &[&[usize]]) -> Vec<FusionElement> {
        let graph = sheaf_graph::mock::backward_graph(shapes);
        GraphInfo::capture(&graph, ReduceKind::Sum).unwrap().elements
    }

    #[test]
    fn budget_cut_includes_the_element_that_reached_it() {
        let elements = scanned(&[&[10], &[20], &[5], &[8]]);
        // f32 bytes: 40, 80, 20, 32. Budget holds exactly the first three.
        let jit = JustInTime::with_budget_bytes(FusionOptions::default(), 140);
        assert_eq!(jit.plan(&elements), vec![0..3, 3..4]);
    }

    #[test]
    fn under_budget_run_flushes_as_one_trailing_group() {
        let elements = scanned(&[&[2], &[3]]);
        let jit = JustInTime::with_budget_bytes(FusionOptions::default(), 1 << 20);
        assert_eq!(jit.plan(&elements), vec![0..2]);
    }

    #[test]
    fn default_budget_is_fusion_length_mib() {
        let jit = JustInTime::new(FusionOptions::default().with_fusion_length(3));
        assert_eq!(jit.budget_bytes, 3 << 20);
    }

    #[test]
    fn zero_budget_rejected() {
        let jit = JustInTime::with_budget_bytes(FusionOptions::default(), 0);
        assert!(matches!(
            jit.validate(),
            Err(FuseError::InvalidConfiguration(_))
        ));
    }
}
