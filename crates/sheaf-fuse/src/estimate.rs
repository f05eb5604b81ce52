//! Peak staging-memory estimate for count-based grouping.

use crate::element::FusionElement;

/// Largest summed element count over consecutive groups of
/// `fusion_length`. The trailing partial group participates: a dominant
/// remainder still has to fit the staging buffer it is copied into.
pub(crate) fn peak_group_numel(elements: &[FusionElement], fusion_length: usize) -> usize {
    elements
        .chunks(fusion_length)
        .map(|group| group.iter().map(|e| e.numel).sum())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementState;
    use sheaf_graph::{DType, NodeId, Shape};

    fn element(numel: usize) -> FusionElement {
        let n = NodeId::from_index(0);
        FusionElement {
            sequence: vec![n; 5],
            grad: n,
            staged: n,
            reduction: n,
            wait: n,
            numel,
            shape: Shape::flat(numel),
            dtype: DType::F32,
            preceding: None,
            state: ElementState::Unprocessed,
        }
    }

    #[test]
    fn peak_over_full_groups() {
        let elements: Vec<_> = [4, 6, 2, 8].into_iter().map(element).collect();
        assert_eq!(peak_group_numel(&elements, 2), 10);
    }

    #[test]
    fn trailing_partial_group_can_dominate() {
        let elements: Vec<_> = [1, 1, 10].into_iter().map(element).collect();
        assert_eq!(peak_group_numel(&elements, 2), 10);
    }

    #[test]
    fn no_elements_estimate_zero() {
        assert_eq!(peak_group_numel(&[], 4), 0);
    }
}
