//! Graph node types and the NodeId handle.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::meta::TensorMeta;

/// Handle into the graph arena. Lightweight (4 bytes), Copy.
///
/// Ids stay stable across node moves and erasures; erased slots become
/// tombstones instead of being reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Create a NodeId from a raw index.
    #[inline]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// The raw index of this node in the arena.
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Reduction operation carried by a `ReduceTag` node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    /// Element-wise sum across participants.
    #[default]
    Sum,
    /// Element-wise mean across participants.
    Mean,
}

impl fmt::Display for ReduceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Mean => write!(f, "mean"),
        }
    }
}

/// Operation vocabulary for call nodes.
///
/// The collective block (`CloneTensor` → `CommGroup`/`ReduceTag` →
/// `AllReduce` → `WaitComm`) is what the fusion pass matches; the staging
/// targets are what its strategies emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallTarget {
    // Collective block
    /// Asynchronous collective reduction over a list of tensors.
    /// Args: (inputs, group handle, reduce tag).
    AllReduce,
    /// Completion of an `AllReduce`; produces the reduced tensor.
    WaitComm,
    /// Process-group handle, materialized once per collective call site.
    CommGroup,
    /// Reduction-kind token, materialized once per collective call site.
    ReduceTag(ReduceKind),

    // Staging
    /// Deep copy of a tensor value.
    CloneTensor,
    /// Uninitialized flat buffer of a given element count.
    EmptyBuffer,
    /// Flatten to 1-D.
    Flatten,
    /// Concatenate 1-D tensors into one.
    Concat,
    /// Split a 1-D tensor into pieces of the given sizes.
    SplitTensor,
    /// Select one piece of a multi-value result by index.
    IndexItem,
    /// Reshape producing an independently owned tensor.
    Reshape,
    /// Reshape producing a view that aliases its input's storage.
    ViewAs,
    /// 1-D range of a buffer, aliasing its storage. Args: (src, start, stop).
    SliceRange,
    /// In-place write of `src` into `dst`'s storage. Args: (dst, src).
    CopyInto,

    // Compute, for building backward graphs around the collective blocks
    /// Element-wise addition.
    Add,
    /// Element-wise multiplication.
    Mul,
}

impl CallTarget {
    /// Whether this call mutates existing storage rather than producing a
    /// value someone reads. Side-effecting calls are dead-code roots.
    #[inline]
    pub fn has_side_effect(&self) -> bool {
        matches!(self, Self::CopyInto)
    }

    /// Lower-case name used by the dump format.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AllReduce => "all_reduce",
            Self::WaitComm => "wait_comm",
            Self::CommGroup => "comm_group",
            Self::ReduceTag(_) => "reduce_tag",
            Self::CloneTensor => "clone",
            Self::EmptyBuffer => "empty_buffer",
            Self::Flatten => "flatten",
            Self::Concat => "concat",
            Self::SplitTensor => "split",
            Self::IndexItem => "index_item",
            Self::Reshape => "reshape",
            Self::ViewAs => "view_as",
            Self::SliceRange => "slice_range",
            Self::CopyInto => "copy_into",
            Self::Add => "add",
            Self::Mul => "mul",
        }
    }
}

/// Positional argument of a call node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    /// Reference to another node's value.
    Node(NodeId),
    /// Reference to a list of node values (reduction inputs, concat inputs).
    Nodes(Vec<NodeId>),
    /// Scalar size or index.
    Size(usize),
    /// Shape dimensions or per-piece sizes.
    Sizes(Vec<usize>),
}

impl Arg {
    /// The referenced node, if this is a single-node argument.
    #[inline]
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Self::Node(id) => Some(*id),
            _ => None,
        }
    }

    /// The referenced node list, if this is a node-list argument.
    #[inline]
    pub fn as_nodes(&self) -> Option<&[NodeId]> {
        match self {
            Self::Nodes(ids) => Some(ids),
            _ => None,
        }
    }

    /// The scalar size, if this is a size argument.
    #[inline]
    pub fn as_size(&self) -> Option<usize> {
        match self {
            Self::Size(n) => Some(*n),
            _ => None,
        }
    }

    /// Visit every node referenced by this argument.
    pub fn for_each_node(&self, mut f: impl FnMut(NodeId)) {
        match self {
            Self::Node(id) => f(*id),
            Self::Nodes(ids) => ids.iter().copied().for_each(f),
            Self::Size(_) | Self::Sizes(_) => {}
        }
    }
}

/// What a node is: graph input, operation call, or the output list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// Graph input (parameter, activation, upstream gradient).
    Placeholder,
    /// Operation call with positional arguments.
    Call(CallTarget),
    /// The designated output; its arguments are the produced values in order.
    Output,
}

/// A node in the dataflow graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) args: Vec<Arg>,
    pub(crate) users: BTreeSet<NodeId>,
    pub(crate) meta: Option<TensorMeta>,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, args: Vec<Arg>, meta: Option<TensorMeta>) -> Self {
        Self {
            kind,
            args,
            users: BTreeSet::new(),
            meta,
        }
    }

    /// Node kind.
    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Call target, if this is a call node.
    #[inline]
    pub fn target(&self) -> Option<CallTarget> {
        match self.kind {
            NodeKind::Call(t) => Some(t),
            _ => None,
        }
    }

    /// Positional arguments.
    #[inline]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// The single node referenced by argument `i`, if it is one.
    #[inline]
    pub fn arg_node(&self, i: usize) -> Option<NodeId> {
        self.args.get(i).and_then(Arg::as_node)
    }

    /// Nodes that reference this node's value through their arguments.
    #[inline]
    pub fn users(&self) -> &BTreeSet<NodeId> {
        &self.users
    }

    /// Attached tensor metadata, if any.
    #[inline]
    pub fn meta(&self) -> Option<&TensorMeta> {
        self.meta.as_ref()
    }

    /// Whether this node is a placeholder.
    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.kind == NodeKind::Placeholder
    }

    /// Whether this node is a call on the given target.
    #[inline]
    pub fn is_call(&self, target: CallTarget) -> bool {
        self.kind == NodeKind::Call(target)
    }

    /// Every node referenced by this node's arguments, in argument order.
    pub fn input_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for arg in &self.args {
            arg.for_each_node(|id| out.push(id));
        }
        out
    }
}
