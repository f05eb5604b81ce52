//! Pretty-printing for graphs.

use std::fmt::Write;

use crate::graph::Graph;
use crate::node::{Arg, CallTarget, NodeKind};

impl Graph {
    /// Render the graph one line per node in program order, for trace
    /// logs and test failure output.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for id in self.nodes() {
            let node = self.node(id);
            match node.kind() {
                NodeKind::Placeholder => {
                    let _ = write!(out, "{id}: placeholder");
                }
                NodeKind::Call(target) => {
                    let _ = write!(out, "{id}: {}(", target_name(target));
                    let _ = write!(out, "{})", fmt_args(node.args()));
                }
                NodeKind::Output => {
                    let _ = write!(out, "{id}: output({})", fmt_args(node.args()));
                }
            }
            if let Some(meta) = node.meta() {
                let _ = write!(out, " : {}{}", meta.dtype, meta.shape);
            }
            out.push('\n');
        }
        out
    }
}

fn target_name(target: CallTarget) -> String {
    match target {
        CallTarget::ReduceTag(kind) => format!("reduce_tag<{kind}>"),
        other => other.name().to_string(),
    }
}

fn fmt_args(args: &[Arg]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match arg {
            Arg::Node(id) => {
                let _ = write!(out, "{id}");
            }
            Arg::Nodes(ids) => {
                out.push('[');
                for (j, id) in ids.iter().enumerate() {
                    if j > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{id}");
                }
                out.push(']');
            }
            Arg::Size(n) => {
                let _ = write!(out, "{n}");
            }
            Arg::Sizes(ns) => {
                let _ = write!(out, "{ns:?}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Shape, TensorMeta};
    use crate::node::ReduceKind;

    #[test]
    fn dump_lines() {
        let mut g = Graph::new();
        let grad = g.placeholder(Some(TensorMeta::f32(Shape::from_slice(&[10]))));
        let clone = g.call(CallTarget::CloneTensor, vec![Arg::Node(grad)]);
        let group = g.call(CallTarget::CommGroup, vec![]);
        let tag = g.call(CallTarget::ReduceTag(ReduceKind::Sum), vec![]);
        let comm = g.call(
            CallTarget::AllReduce,
            vec![Arg::Nodes(vec![clone]), Arg::Node(group), Arg::Node(tag)],
        );
        g.set_output(vec![Arg::Node(comm)]).unwrap();

        let dump = g.dump();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "n0: placeholder : f32[10]");
        assert_eq!(lines[1], "n1: clone(n0)");
        assert_eq!(lines[3], "n3: reduce_tag<sum>()");
        assert_eq!(lines[4], "n4: all_reduce([n1], n2, n3)");
        assert_eq!(lines[5], "n5: output(n4)");
    }
}
