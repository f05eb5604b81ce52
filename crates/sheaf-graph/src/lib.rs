//! sheaf-graph — Arena dataflow graph for captured training steps.
//!
//! A captured step is a list of nodes in program order: placeholders
//! (inputs), calls (operations), and one output node whose arguments are
//! the produced values. Graph rewriting passes splice, move, and erase
//! nodes while the graph keeps data edges and user sets consistent.
//!
//! # Design principles
//! - Stable `NodeId` handles into a tombstoned arena: moves and erasures
//!   never invalidate an id
//! - Program order is an explicit vector: insert is a splice, position is
//!   a lookup, no pointer chasing
//! - Per-node user sets updated transactionally on every edge change;
//!   dead-code elimination is rooted at the output and at side-effecting
//!   calls, so nothing needs manual keep-alive registration
//! - Optional shape/dtype/layout metadata per node

pub mod display;
pub mod error;
pub mod graph;
pub mod meta;
pub mod mock;
pub mod node;

pub use error::GraphError;
pub use graph::Graph;
pub use meta::{DType, Layout, Shape, TensorMeta};
pub use node::{Arg, CallTarget, Node, NodeId, NodeKind, ReduceKind};
