//! Error types for sheaf-graph.

use std::fmt;

use crate::node::NodeId;

/// Errors from structural graph mutation.
#[derive(Debug)]
pub enum GraphError {
    /// The id does not refer to a live node.
    UnknownNode(NodeId),
    /// Erase refused: the node still has users.
    HasUsers { node: NodeId, users: usize },
    /// The graph has no output node.
    NoOutput,
    /// An output node already exists.
    OutputExists(NodeId),
    /// Template splice given the wrong number of placeholder bindings.
    BindingMismatch { expected: usize, got: usize },
    /// Argument index out of range for the node.
    NoSuchArg { node: NodeId, index: usize },
    /// Internal consistency check failed.
    Corrupt(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(id) => write!(f, "node {id} is not live in the graph"),
            Self::HasUsers { node, users } => {
                write!(f, "cannot erase {node}: {users} user(s) remain")
            }
            Self::NoOutput => write!(f, "graph has no output node"),
            Self::OutputExists(id) => write!(f, "graph already has output node {id}"),
            Self::BindingMismatch { expected, got } => {
                write!(f, "template expects {expected} binding(s), got {got}")
            }
            Self::NoSuchArg { node, index } => {
                write!(f, "node {node} has no argument {index}")
            }
            Self::Corrupt(msg) => write!(f, "graph consistency violated: {msg}"),
        }
    }
}

impl std::error::Error for GraphError {}
