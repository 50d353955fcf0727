//! Graph vertices: concrete stores or pending promises.

use smallvec::SmallVec;
use weft_action::{ModelAction, Promise};

/// Stable index of a node in the graph arena.
///
/// Indices are never invalidated: merged-away promise nodes are retired in
/// place rather than removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) type EdgeList = SmallVec<[NodeId; 4]>;

/// What a node stands for.
#[derive(Debug)]
pub(crate) enum NodeShape {
    /// A store action whose writer is known.
    Concrete(ModelAction),
    /// A speculative future write, keyed by its reader.
    Promise(Promise),
    /// Former promise node that was merged into a concrete node. The slot
    /// stays allocated so indices remain stable; it has no edges and no
    /// map entry.
    Retired,
}

/// A vertex of the cycle graph.
///
/// Forward `edges` are the must-happen-before successors used by
/// reachability; `back_edges` mirror them and exist only so promise merge
/// and rollback can remove edges in O(deg). `y ∈ x.edges ⇔ x ∈
/// y.back_edges` at all times.
#[derive(Debug)]
pub struct CycleNode {
    pub(crate) shape: NodeShape,
    pub(crate) edges: EdgeList,
    pub(crate) back_edges: EdgeList,
    pub(crate) rmw: Option<NodeId>,
}

impl CycleNode {
    pub(crate) fn new_concrete(action: ModelAction) -> Self {
        CycleNode {
            shape: NodeShape::Concrete(action),
            edges: EdgeList::new(),
            back_edges: EdgeList::new(),
            rmw: None,
        }
    }

    pub(crate) fn new_promise(promise: Promise) -> Self {
        CycleNode {
            shape: NodeShape::Promise(promise),
            edges: EdgeList::new(),
            back_edges: EdgeList::new(),
            rmw: None,
        }
    }

    pub fn is_promise(&self) -> bool {
        matches!(self.shape, NodeShape::Promise(_))
    }

    /// The store action, for concrete nodes.
    pub fn action(&self) -> Option<&ModelAction> {
        match &self.shape {
            NodeShape::Concrete(action) => Some(action),
            _ => None,
        }
    }

    /// The promise descriptor, for promise nodes.
    pub fn promise(&self) -> Option<&Promise> {
        match &self.shape {
            NodeShape::Promise(promise) => Some(promise),
            _ => None,
        }
    }

    pub fn edges(&self) -> &[NodeId] {
        &self.edges
    }

    pub fn back_edges(&self) -> &[NodeId] {
        &self.back_edges
    }

    /// The unique RMW node that reads from this store, if any.
    pub fn rmw(&self) -> Option<NodeId> {
        self.rmw
    }

    /// Install the RMW successor. Returns true if one was already set (a
    /// store may feed at most one RMW).
    pub(crate) fn set_rmw(&mut self, node: NodeId) -> bool {
        if self.rmw.is_some() {
            return true;
        }
        self.rmw = Some(node);
        false
    }

    pub(crate) fn clear_rmw(&mut self) {
        self.rmw = None;
    }

    /// Convert a promise node in place into a concrete node for `writer`.
    /// Only valid when no concrete node for `writer` exists yet.
    pub(crate) fn resolve_promise(&mut self, writer: &ModelAction) {
        let promise = self
            .promise()
            .expect("resolve_promise on a non-promise node");
        assert!(
            promise.is_compatible(writer),
            "resolving promise against an incompatible writer"
        );
        self.shape = NodeShape::Concrete(writer.clone());
    }

    /// Retire a merged-away promise node, yielding its promise.
    pub(crate) fn take_promise(&mut self) -> Promise {
        match std::mem::replace(&mut self.shape, NodeShape::Retired) {
            NodeShape::Promise(promise) => promise,
            _ => panic!("take_promise on a non-promise node"),
        }
    }
}
