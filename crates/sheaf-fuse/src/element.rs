//! Scanner for fusable collective sequences.
//!
//! A fusable element is the five-node sequence a captured backward step
//! emits per gradient:
//!
//! ```text
//!   clone(grad) -> comm_group -> reduce_tag -> all_reduce -> wait_comm
//! ```
//!
//! The scanner walks the graph in program order, matches one element per
//! `wait_comm` node, and records everything a strategy needs to rewrite the
//! sequence later: the raw gradient, the staging clone, the reduction and
//! wait handles, and the element's tensor size.

use sheaf_graph::{CallTarget, DType, Graph, NodeId, ReduceKind, Shape};

use crate::error::FuseError;

/// Offset of the reduction node within a matched sequence.
pub(crate) const REDUCTION_OFFSET: usize = 3;

/// Lifecycle of an element as the pass rewrites its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementState {
    /// Scanned, not yet part of an active group.
    Unprocessed,
    /// Its group is being rewritten; staged nodes are live in the graph.
    InGraph,
    /// Its group's rewrite is staged for the output node.
    Fused,
}

/// One scanned collective sequence.
#[derive(Clone, Debug)]
pub struct FusionElement {
    /// The matched nodes in program order: clone, comm group, reduce tag,
    /// reduction, wait.
    pub sequence: Vec<NodeId>,
    /// Raw gradient the clone stages.
    pub grad: NodeId,
    /// Staging clone consumed by the reduction.
    pub staged: NodeId,
    /// The async reduction call.
    pub reduction: NodeId,
    /// Completion node consumed by the output.
    pub wait: NodeId,
    /// Element count of the gradient tensor.
    pub numel: usize,
    pub shape: Shape,
    pub dtype: DType,
    /// Node immediately before the sequence, if any.
    pub preceding: Option<NodeId>,
    pub state: ElementState,
}

impl FusionElement {
    /// Comm group handle argument of the reduction.
    pub fn group_handle(&self) -> NodeId {
        self.sequence[1]
    }

    /// Reduce tag argument of the reduction.
    pub fn reduce_tag(&self) -> NodeId {
        self.sequence[2]
    }
}

/// Matches every `wait_comm` in the graph against the collective pattern.
/// Elements come back in program order of their waits.
pub fn scan(graph: &Graph, expected: ReduceKind) -> Result<Vec<FusionElement>, FuseError> {
    let order: Vec<NodeId> = graph.nodes().collect();
    let mut elements = Vec::new();
    for (pos, &id) in order.iter().enumerate() {
        if graph.node(id).is_call(CallTarget::WaitComm) {
            elements.push(match_sequence(graph, &order, pos, id, expected)?);
        }
    }
    Ok(elements)
}

fn match_sequence(
    graph: &Graph,
    order: &[NodeId],
    wait_pos: usize,
    wait: NodeId,
    expected: ReduceKind,
) -> Result<FusionElement, FuseError> {
    let args = graph.node(wait).args();
    let reduction = match args {
        [arg] => arg
            .as_node()
            .ok_or_else(|| FuseError::malformed_at("wait consumes a non-node argument", wait))?,
        _ => {
            return Err(FuseError::malformed_at(
                format!("wait carries {} arguments, expected 1", args.len()),
                wait,
            ))
        }
    };
    let reduction_node = graph
        .try_node(reduction)
        .ok_or_else(|| FuseError::malformed_at("wait consumes an erased node", wait))?;
    if !reduction_node.is_call(CallTarget::AllReduce) {
        return Err(FuseError::malformed_at(
            "wait does not consume an async reduction",
            wait,
        ));
    }

    let reduction_args = reduction_node.args();
    if reduction_args.len() != 3 {
        return Err(FuseError::malformed_at(
            format!(
                "reduction carries {} arguments, expected inputs, comm group, reduce tag",
                reduction_args.len()
            ),
            reduction,
        ));
    }
    let inputs = reduction_args[0]
        .as_nodes()
        .ok_or_else(|| FuseError::malformed_at("reduction input list is malformed", reduction))?;
    let clone = match inputs {
        [single] => *single,
        _ => {
            return Err(FuseError::malformed_at(
                format!("reduction stages {} inputs, expected exactly 1", inputs.len()),
                reduction,
            ))
        }
    };
    let group = reduction_args[1]
        .as_node()
        .ok_or_else(|| FuseError::malformed_at("reduction lacks a comm group handle", reduction))?;
    let tag = reduction_args[2]
        .as_node()
        .ok_or_else(|| FuseError::malformed_at("reduction lacks a reduce tag", reduction))?;

    let clone_node = graph
        .try_node(clone)
        .ok_or_else(|| FuseError::malformed_at("reduction input was erased", reduction))?;
    if !clone_node.is_call(CallTarget::CloneTensor) {
        return Err(FuseError::malformed_at(
            "reduction input is not a staging clone",
            clone,
        ));
    }
    let grad = clone_node
        .arg_node(0)
        .ok_or_else(|| FuseError::malformed_at("staging clone has no source gradient", clone))?;

    if !graph.node(group).is_call(CallTarget::CommGroup) {
        return Err(FuseError::malformed_at(
            "reduction argument is not a comm group handle",
            group,
        ));
    }
    let kind = match graph.node(tag).target() {
        Some(CallTarget::ReduceTag(kind)) => kind,
        _ => {
            return Err(FuseError::malformed_at(
                "reduction argument is not a reduce tag",
                tag,
            ))
        }
    };
    if kind != expected {
        return Err(FuseError::malformed_at(
            format!("reduce tag {kind} does not match configured {expected}"),
            tag,
        ));
    }

    let sequence = vec![clone, group, tag, reduction, wait];
    if wait_pos + 1 < sequence.len() {
        return Err(FuseError::malformed_at(
            "collective sequence is not contiguous",
            wait,
        ));
    }
    let start = wait_pos + 1 - sequence.len();
    if order[start..=wait_pos] != sequence[..] {
        return Err(FuseError::malformed_at(
            "collective sequence is not contiguous",
            wait,
        ));
    }

    let meta = graph
        .meta(clone)
        .ok_or_else(|| FuseError::malformed_at("staging clone carries no tensor metadata", clone))?;

    Ok(FusionElement {
        grad,
        staged: clone,
        reduction,
        wait,
        numel: meta.numel(),
        shape: meta.shape.clone(),
        dtype: meta.dtype,
        preceding: start.checked_sub(1).map(|p| order[p]),
        state: ElementState::Unprocessed,
        sequence,
    })
}
