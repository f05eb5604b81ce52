//! Arena dataflow graph with explicit program order.

use std::collections::{HashMap, HashSet};

use crate::error::GraphError;
use crate::meta::TensorMeta;
use crate::node::{Arg, CallTarget, Node, NodeId, NodeKind};

/// Dataflow graph: a tombstoned node arena plus an explicit program order.
///
/// `NodeId`s are stable across moves and erasures (erased slots become
/// tombstones, never reused). "Insert before/after" is a splice of the
/// order vector; "position of" is an order lookup. Per-node user sets are
/// kept in sync with arguments on every edge change, so liveness is a
/// structural property, not a manually patched one.
///
/// ```text
/// slots:  [ n0 ][ n1 ][ ── ][ n3 ][ n4 ]     stable ids, tombstones stay
/// order:   n0 → n1 → n3 → n4                 program order, spliced
/// ```
///
/// Accessors panic on a dead id (programmer error); structural mutations
/// that can fail on well-formed input return `Result`.
#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    slots: Vec<Option<Node>>,
    order: Vec<NodeId>,
    output: Option<NodeId>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            order: Vec::new(),
            output: None,
        }
    }

    /// Number of live nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no live nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live node ids in program order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied()
    }

    /// Whether the id refers to a live node.
    #[inline]
    pub fn is_live(&self, id: NodeId) -> bool {
        self.slots
            .get(id.0 as usize)
            .map_or(false, Option::is_some)
    }

    /// Look up a live node. Panics if the id is dead.
    pub fn node(&self, id: NodeId) -> &Node {
        match self.slots.get(id.0 as usize).and_then(Option::as_ref) {
            Some(n) => n,
            None => panic!("node {id} is not live"),
        }
    }

    /// Look up a node, or `None` if the id is dead.
    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(n) => n,
            None => panic!("node {id} is not live"),
        }
    }

    /// Attached tensor metadata, if any.
    #[inline]
    pub fn meta(&self, id: NodeId) -> Option<&TensorMeta> {
        self.node(id).meta()
    }

    /// Attach (or replace) tensor metadata on a node.
    pub fn set_meta(&mut self, id: NodeId, meta: TensorMeta) {
        self.node_mut(id).meta = Some(meta);
    }

    /// Position of a node in program order, if live.
    pub fn position_of(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&n| n == id)
    }

    /// The node immediately after `id` in program order.
    pub fn next_node(&self, id: NodeId) -> Option<NodeId> {
        let pos = self.position_of(id)?;
        self.order.get(pos + 1).copied()
    }

    /// The designated output node, if one has been set.
    #[inline]
    pub fn output(&self) -> Option<NodeId> {
        self.output
    }

    /// The output node's argument list.
    pub fn output_args(&self) -> Result<&[Arg], GraphError> {
        let out = self.output.ok_or(GraphError::NoOutput)?;
        Ok(self.node(out).args())
    }

    /// The first node in program order that is not a placeholder.
    pub fn first_non_placeholder(&self) -> Option<NodeId> {
        self.nodes().find(|&id| !self.node(id).is_placeholder())
    }

    // ---- creation ------------------------------------------------------

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Some(node));
        id
    }

    /// Register `id` as a user of every node its arguments reference.
    fn link(&mut self, id: NodeId) {
        for input in self.node(id).input_nodes() {
            self.node_mut(input).users.insert(id);
        }
    }

    /// Remove `id` from the user sets of every node its arguments reference.
    fn unlink(&mut self, id: NodeId) {
        for input in self.node(id).input_nodes() {
            self.node_mut(input).users.remove(&id);
        }
    }

    /// Create a placeholder (graph input). Placeholders always form a
    /// prefix of the program order.
    pub fn placeholder(&mut self, meta: Option<TensorMeta>) -> NodeId {
        let id = self.alloc(Node::new(NodeKind::Placeholder, Vec::new(), meta));
        let pos = self
            .order
            .iter()
            .position(|&n| !self.node(n).is_placeholder())
            .unwrap_or(self.order.len());
        self.order.insert(pos, id);
        id
    }

    /// Create a call node at the end of the program (before the output
    /// node if one exists). Panics if an argument references a dead node.
    pub fn call(&mut self, target: CallTarget, args: Vec<Arg>) -> NodeId {
        let id = self.alloc(Node::new(NodeKind::Call(target), args, None));
        self.link(id);
        let pos = match self.output {
            Some(out) => self.position_of(out).unwrap_or(self.order.len()),
            None => self.order.len(),
        };
        self.order.insert(pos, id);
        id
    }

    /// Create a call node immediately before `anchor`.
    pub fn call_before(
        &mut self,
        anchor: NodeId,
        target: CallTarget,
        args: Vec<Arg>,
    ) -> Result<NodeId, GraphError> {
        let pos = self
            .position_of(anchor)
            .ok_or(GraphError::UnknownNode(anchor))?;
        let id = self.alloc(Node::new(NodeKind::Call(target), args, None));
        self.link(id);
        self.order.insert(pos, id);
        Ok(id)
    }

    /// Create a call node immediately after `anchor`.
    pub fn call_after(
        &mut self,
        anchor: NodeId,
        target: CallTarget,
        args: Vec<Arg>,
    ) -> Result<NodeId, GraphError> {
        let pos = self
            .position_of(anchor)
            .ok_or(GraphError::UnknownNode(anchor))?;
        let id = self.alloc(Node::new(NodeKind::Call(target), args, None));
        self.link(id);
        self.order.insert(pos + 1, id);
        Ok(id)
    }

    /// Create the output node at the end of the program. The arguments are
    /// the graph's produced values, in the order the caller will read them.
    pub fn set_output(&mut self, args: Vec<Arg>) -> Result<NodeId, GraphError> {
        if let Some(out) = self.output {
            return Err(GraphError::OutputExists(out));
        }
        let id = self.alloc(Node::new(NodeKind::Output, args, None));
        self.link(id);
        self.order.push(id);
        self.output = Some(id);
        Ok(id)
    }

    /// Replace the output node's argument list transactionally: old edges
    /// are unregistered, new edges registered, node id preserved.
    pub fn rewrite_output(&mut self, args: Vec<Arg>) -> Result<(), GraphError> {
        let out = self.output.ok_or(GraphError::NoOutput)?;
        let mut refs = Vec::new();
        for arg in &args {
            arg.for_each_node(|id| refs.push(id));
        }
        for id in refs {
            if !self.is_live(id) {
                return Err(GraphError::UnknownNode(id));
            }
        }
        self.unlink(out);
        self.node_mut(out).args = args;
        self.link(out);
        Ok(())
    }

    // ---- mutation ------------------------------------------------------

    /// Replace one argument of a node, keeping user sets in sync.
    pub fn replace_arg(
        &mut self,
        node: NodeId,
        index: usize,
        arg: Arg,
    ) -> Result<(), GraphError> {
        if !self.is_live(node) {
            return Err(GraphError::UnknownNode(node));
        }
        if index >= self.node(node).args().len() {
            return Err(GraphError::NoSuchArg { node, index });
        }
        let mut refs = Vec::new();
        arg.for_each_node(|id| refs.push(id));
        for id in refs {
            if !self.is_live(id) {
                return Err(GraphError::UnknownNode(id));
            }
        }
        self.unlink(node);
        self.node_mut(node).args[index] = arg;
        self.link(node);
        Ok(())
    }

    /// Move a node to immediately before `anchor`.
    pub fn move_before(&mut self, node: NodeId, anchor: NodeId) -> Result<(), GraphError> {
        if node == anchor {
            return Ok(());
        }
        let from = self.position_of(node).ok_or(GraphError::UnknownNode(node))?;
        self.order.remove(from);
        let to = self
            .position_of(anchor)
            .ok_or(GraphError::UnknownNode(anchor))?;
        self.order.insert(to, node);
        Ok(())
    }

    /// Move a node to immediately after `anchor`.
    pub fn move_after(&mut self, node: NodeId, anchor: NodeId) -> Result<(), GraphError> {
        if node == anchor {
            return Ok(());
        }
        let from = self.position_of(node).ok_or(GraphError::UnknownNode(node))?;
        self.order.remove(from);
        let to = self
            .position_of(anchor)
            .ok_or(GraphError::UnknownNode(anchor))?;
        self.order.insert(to + 1, node);
        Ok(())
    }

    /// Erase a node. Refuses while any user still references it.
    pub fn erase(&mut self, node: NodeId) -> Result<(), GraphError> {
        if !self.is_live(node) {
            return Err(GraphError::UnknownNode(node));
        }
        let users = self.node(node).users().len();
        if users > 0 {
            return Err(GraphError::HasUsers { node, users });
        }
        self.unlink(node);
        if let Some(pos) = self.position_of(node) {
            self.order.remove(pos);
        }
        if self.output == Some(node) {
            self.output = None;
        }
        self.slots[node.0 as usize] = None;
        Ok(())
    }

    // ---- templates -----------------------------------------------------

    /// Splice a template graph into this one immediately before `anchor`.
    ///
    /// The template's placeholders are bound positionally to `bindings`
    /// (live nodes of this graph); its output node, if any, is skipped.
    /// Returns the template-id → host-id remap for the copied call nodes.
    pub fn splice_before(
        &mut self,
        anchor: NodeId,
        template: &Graph,
        bindings: &[NodeId],
    ) -> Result<HashMap<NodeId, NodeId>, GraphError> {
        if !self.is_live(anchor) {
            return Err(GraphError::UnknownNode(anchor));
        }
        for &b in bindings {
            if !self.is_live(b) {
                return Err(GraphError::UnknownNode(b));
            }
        }
        let placeholders: Vec<NodeId> = template
            .nodes()
            .filter(|&id| template.node(id).is_placeholder())
            .collect();
        if placeholders.len() != bindings.len() {
            return Err(GraphError::BindingMismatch {
                expected: placeholders.len(),
                got: bindings.len(),
            });
        }
        let mut remap: HashMap<NodeId, NodeId> = placeholders
            .iter()
            .copied()
            .zip(bindings.iter().copied())
            .collect();
        for id in template.nodes() {
            let node = template.node(id);
            let target = match node.kind() {
                NodeKind::Placeholder | NodeKind::Output => continue,
                NodeKind::Call(t) => t,
            };
            let mut args = Vec::with_capacity(node.args().len());
            for arg in node.args() {
                args.push(remap_arg(arg, &remap)?);
            }
            let new_id = self.call_before(anchor, target, args)?;
            if let Some(meta) = node.meta() {
                self.set_meta(new_id, meta.clone());
            }
            remap.insert(id, new_id);
        }
        Ok(remap)
    }

    // ---- bookkeeping ---------------------------------------------------

    /// Check arena/order/user-set consistency. The graph analogue of
    /// "recompile": any mismatch means a mutation bypassed the invariants.
    ///
    /// Checks: order and slots agree; placeholders form a prefix; the
    /// output node (if any) is unique and last; every argument references
    /// a live node defined earlier in program order; every user set equals
    /// the set recomputed from arguments.
    pub fn verify(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::new();
        for &id in &self.order {
            if !self.is_live(id) {
                return Err(GraphError::Corrupt(format!("order lists dead node {id}")));
            }
            if !seen.insert(id) {
                return Err(GraphError::Corrupt(format!("order lists {id} twice")));
            }
        }
        let live = self.slots.iter().filter(|s| s.is_some()).count();
        if live != self.order.len() {
            return Err(GraphError::Corrupt(format!(
                "{live} live slot(s) but {} in order",
                self.order.len()
            )));
        }

        let mut in_calls = false;
        for &id in &self.order {
            match self.node(id).kind() {
                NodeKind::Placeholder => {
                    if in_calls {
                        return Err(GraphError::Corrupt(format!(
                            "placeholder {id} after first call"
                        )));
                    }
                }
                _ => in_calls = true,
            }
        }

        match self.output {
            Some(out) => {
                if !self.is_live(out) || self.node(out).kind() != NodeKind::Output {
                    return Err(GraphError::Corrupt(format!("output {out} is not live")));
                }
                if self.order.last() != Some(&out) {
                    return Err(GraphError::Corrupt(format!("output {out} is not last")));
                }
            }
            None => {
                if let Some(id) = self
                    .nodes()
                    .find(|&id| self.node(id).kind() == NodeKind::Output)
                {
                    return Err(GraphError::Corrupt(format!(
                        "unregistered output node {id}"
                    )));
                }
            }
        }

        let position: HashMap<NodeId, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        let mut expected: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        for &id in &self.order {
            for input in self.node(id).input_nodes() {
                if !self.is_live(input) {
                    return Err(GraphError::Corrupt(format!(
                        "{id} references dead node {input}"
                    )));
                }
                if position[&input] >= position[&id] {
                    return Err(GraphError::Corrupt(format!(
                        "{id} uses {input} before it is defined"
                    )));
                }
                expected.entry(input).or_default().insert(id);
            }
        }
        for &id in &self.order {
            let want = expected.remove(&id).unwrap_or_default();
            let have: HashSet<NodeId> = self.node(id).users().iter().copied().collect();
            if want != have {
                return Err(GraphError::Corrupt(format!(
                    "user set of {id} is stale ({} recorded, {} actual)",
                    have.len(),
                    want.len()
                )));
            }
        }
        Ok(())
    }

    /// Remove every node unreachable from the output node and from
    /// side-effecting calls. Placeholders are never removed (they define
    /// the caller's calling convention). Returns the number removed.
    pub fn eliminate_dead_code(&mut self) -> usize {
        let mut live: HashSet<NodeId> = HashSet::new();
        let mut work: Vec<NodeId> = Vec::new();
        for id in self.nodes() {
            let node = self.node(id);
            let root = match node.kind() {
                NodeKind::Output | NodeKind::Placeholder => true,
                NodeKind::Call(t) => t.has_side_effect(),
            };
            if root {
                work.push(id);
            }
        }
        while let Some(id) = work.pop() {
            if !live.insert(id) {
                continue;
            }
            work.extend(self.node(id).input_nodes());
        }

        let dead: Vec<NodeId> = self
            .order
            .iter()
            .copied()
            .filter(|id| !live.contains(id))
            .collect();
        for &id in &dead {
            self.slots[id.0 as usize] = None;
        }
        self.order.retain(|id| live.contains(id));

        // Rebuild user sets from scratch; dead users must not linger.
        let ids: Vec<NodeId> = self.order.clone();
        for &id in &ids {
            self.node_mut(id).users.clear();
        }
        for id in ids {
            self.link(id);
        }
        dead.len()
    }
}

fn remap_arg(arg: &Arg, remap: &HashMap<NodeId, NodeId>) -> Result<Arg, GraphError> {
    let lookup = |id: NodeId| -> Result<NodeId, GraphError> {
        remap.get(&id).copied().ok_or_else(|| {
            GraphError::Corrupt(format!("template references unmapped node {id}"))
        })
    };
    Ok(match arg {
        Arg::Node(id) => Arg::Node(lookup(*id)?),
        Arg::Nodes(ids) => Arg::Nodes(
            ids.iter()
                .map(|&id| lookup(id))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Arg::Size(n) => Arg::Size(*n),
        Arg::Sizes(ns) => Arg::Sizes(ns.clone()),
    })
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Shape, TensorMeta};

    #[test]
    fn placeholders_stay_prefixed() {
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let c = g.call(CallTarget::CloneTensor, vec![Arg::Node(a)]);
        let b = g.placeholder(None);
        let order: Vec<NodeId> = g.nodes().collect();
        assert_eq!(order, vec![a, b, c]);
        assert!(g.verify().is_ok());
    }

    #[test]
    fn calls_land_before_output() {
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let x = g.call(CallTarget::CloneTensor, vec![Arg::Node(a)]);
        g.set_output(vec![Arg::Node(x)]).unwrap();
        let y = g.call(CallTarget::Flatten, vec![Arg::Node(x)]);
        let order: Vec<NodeId> = g.nodes().collect();
        assert_eq!(order.last(), Some(&g.output().unwrap()));
        assert_eq!(order[2], y);
    }

    #[test]
    fn user_sets_track_edges() {
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let b = g.placeholder(None);
        let c = g.call(CallTarget::Add, vec![Arg::Node(a), Arg::Node(b)]);
        assert!(g.node(a).users().contains(&c));
        assert!(g.node(b).users().contains(&c));

        g.replace_arg(c, 1, Arg::Node(a)).unwrap();
        assert!(g.node(a).users().contains(&c));
        assert!(!g.node(b).users().contains(&c));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn duplicate_edges_survive_partial_replace() {
        // c references a through two arguments; dropping one keeps the edge.
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let b = g.placeholder(None);
        let c = g.call(CallTarget::Mul, vec![Arg::Node(a), Arg::Node(a)]);
        g.replace_arg(c, 0, Arg::Node(b)).unwrap();
        assert!(g.node(a).users().contains(&c));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn erase_refuses_while_used() {
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let c = g.call(CallTarget::CloneTensor, vec![Arg::Node(a)]);
        assert!(matches!(
            g.erase(a),
            Err(GraphError::HasUsers { users: 1, .. })
        ));
        g.erase(c).unwrap();
        g.erase(a).unwrap();
        assert!(g.is_empty());
    }

    #[test]
    fn move_after_splices_order() {
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let x = g.call(CallTarget::CloneTensor, vec![Arg::Node(a)]);
        let y = g.call(CallTarget::Flatten, vec![Arg::Node(a)]);
        let z = g.call(CallTarget::Reshape, vec![Arg::Node(a), Arg::Sizes(vec![1])]);
        g.move_after(y, z).unwrap();
        let order: Vec<NodeId> = g.nodes().collect();
        assert_eq!(order, vec![a, x, z, y]);
        assert_eq!(g.position_of(y), Some(3));
    }

    #[test]
    fn rewrite_output_swaps_slots() {
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let x = g.call(CallTarget::CloneTensor, vec![Arg::Node(a)]);
        let y = g.call(CallTarget::Flatten, vec![Arg::Node(a)]);
        let out = g.set_output(vec![Arg::Node(x), Arg::Node(y)]).unwrap();
        g.rewrite_output(vec![Arg::Node(y), Arg::Node(y)]).unwrap();
        assert!(!g.node(x).users().contains(&out));
        assert!(g.node(y).users().contains(&out));
        assert_eq!(g.output(), Some(out));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn splice_binds_template_placeholders() {
        let mut template = Graph::new();
        let tb = template.placeholder(None);
        let tg = template.placeholder(None);
        let flat = template.call(CallTarget::Flatten, vec![Arg::Node(tg)]);
        let slice = template.call(
            CallTarget::SliceRange,
            vec![Arg::Node(tb), Arg::Size(0), Arg::Size(10)],
        );
        template.call(CallTarget::CopyInto, vec![Arg::Node(slice), Arg::Node(flat)]);

        let mut g = Graph::new();
        let buf = g.placeholder(Some(TensorMeta::flat_f32(10)));
        let grad = g.placeholder(Some(TensorMeta::f32(Shape::from_slice(&[10]))));
        let anchor = g.call(CallTarget::CloneTensor, vec![Arg::Node(grad)]);

        let remap = g.splice_before(anchor, &template, &[buf, grad]).unwrap();
        assert_eq!(remap.len(), 5); // 2 bindings + 3 copied calls
        assert!(g.verify().is_ok());

        // Copied nodes sit just before the anchor, in template order.
        let order: Vec<NodeId> = g.nodes().collect();
        assert_eq!(order.len(), 6);
        assert_eq!(order[5], anchor);
        assert_eq!(g.node(order[2]).target(), Some(CallTarget::Flatten));
        assert_eq!(g.node(order[4]).target(), Some(CallTarget::CopyInto));
    }

    #[test]
    fn splice_checks_binding_arity() {
        let mut template = Graph::new();
        template.placeholder(None);
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let anchor = g.call(CallTarget::CloneTensor, vec![Arg::Node(a)]);
        assert!(matches!(
            g.splice_before(anchor, &template, &[]),
            Err(GraphError::BindingMismatch {
                expected: 1,
                got: 0
            })
        ));
    }

    #[test]
    fn dce_keeps_side_effects_and_placeholders() {
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let unused = g.placeholder(None);
        let kept = g.call(CallTarget::CloneTensor, vec![Arg::Node(a)]);
        let orphan = g.call(CallTarget::Flatten, vec![Arg::Node(a)]);
        let slice = g.call(
            CallTarget::SliceRange,
            vec![Arg::Node(kept), Arg::Size(0), Arg::Size(4)],
        );
        let copy = g.call(CallTarget::CopyInto, vec![Arg::Node(kept), Arg::Node(slice)]);
        g.set_output(vec![Arg::Node(kept)]).unwrap();

        let removed = g.eliminate_dead_code();
        assert_eq!(removed, 1);
        assert!(!g.is_live(orphan));
        assert!(g.is_live(copy));
        assert!(g.is_live(slice));
        assert!(g.is_live(unused));
        assert!(g.verify().is_ok());
    }

    #[test]
    fn verify_rejects_use_before_def() {
        let mut g = Graph::new();
        let a = g.placeholder(None);
        let x = g.call(CallTarget::CloneTensor, vec![Arg::Node(a)]);
        let y = g.call(CallTarget::Flatten, vec![Arg::Node(a)]);
        g.replace_arg(x, 0, Arg::Node(y)).unwrap();
        assert!(matches!(g.verify(), Err(GraphError::Corrupt(_))));
    }
}
