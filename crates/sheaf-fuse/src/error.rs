//! Error types for the fusion passes.
//!
//! Every error is fatal to the invocation that raised it: the driver never
//! applies a partial rewrite. `MalformedGraph` blames the input,
//! `InvalidConfiguration` blames the caller, and `Invariant` blames us.

use std::fmt;

use sheaf_graph::{GraphError, NodeId};

#[derive(Debug)]
pub enum FuseError {
    /// The captured graph does not match the collective pattern the scanner
    /// expects, or is structurally unsound.
    MalformedGraph {
        detail: String,
        node: Option<NodeId>,
    },
    /// The options were rejected before the pass touched the graph.
    InvalidConfiguration(String),
    /// A pass-internal invariant failed mid-rewrite. The graph is rolled
    /// back to its pre-pass state; this points at a bug, not at bad input.
    Invariant {
        detail: String,
        group: Option<usize>,
    },
}

impl FuseError {
    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        FuseError::MalformedGraph {
            detail: detail.into(),
            node: None,
        }
    }

    pub(crate) fn malformed_at(detail: impl Into<String>, node: NodeId) -> Self {
        FuseError::MalformedGraph {
            detail: detail.into(),
            node: Some(node),
        }
    }

    pub(crate) fn invariant(detail: impl Into<String>) -> Self {
        FuseError::Invariant {
            detail: detail.into(),
            group: None,
        }
    }

    /// Tags an invariant failure with the fusion group it surfaced in.
    pub(crate) fn in_group(self, group: usize) -> Self {
        match self {
            FuseError::Invariant { detail, group: None } => FuseError::Invariant {
                detail,
                group: Some(group),
            },
            other => other,
        }
    }
}

impl fmt::Display for FuseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FuseError::MalformedGraph { detail, node: Some(node) } => {
                write!(f, "malformed graph: {detail} (at {node})")
            }
            FuseError::MalformedGraph { detail, node: None } => {
                write!(f, "malformed graph: {detail}")
            }
            FuseError::InvalidConfiguration(detail) => {
                write!(f, "invalid configuration: {detail}")
            }
            FuseError::Invariant { detail, group: Some(group) } => {
                write!(f, "internal invariant violated in group {group}: {detail}")
            }
            FuseError::Invariant { detail, group: None } => {
                write!(f, "internal invariant violated: {detail}")
            }
        }
    }
}

impl std::error::Error for FuseError {}

impl From<GraphError> for FuseError {
    fn from(err: GraphError) -> Self {
        FuseError::invariant(err.to_string())
    }
}
