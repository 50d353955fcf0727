//! The cycle graph: edge insertion, reachability, promises, rollback.

use crate::node::{CycleNode, EdgeList, NodeId, NodeShape};
use ahash::{AHashMap, AHashSet};
use std::cell::RefCell;
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, trace};
use weft_action::{ModelAction, Promise, SeqNum};

/// A graph operation contradicted the current execution.
///
/// Every variant also leaves `has_cycles()` set, so drivers that only poll
/// the cycle flag keep working.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Transferring edges during a promise merge closed a cycle.
    #[error("modification-order contradiction while merging promise nodes")]
    Contradiction,

    /// The promise cannot be satisfied by the proposed writer.
    #[error("promise of reader {reader} is incompatible with writer {writer}")]
    IncompatiblePromise { reader: SeqNum, writer: SeqNum },

    /// Two RMW actions tried to read from the same store.
    #[error("store {store} already feeds rmw {prior}; rejected rmw {rmw}")]
    RmwAtomicityViolation {
        store: SeqNum,
        prior: SeqNum,
        rmw: SeqNum,
    },
}

/// Directed graph over store actions encoding the must-happen-before
/// constraints of the current execution.
///
/// Nodes live in an arena and are addressed by stable [`NodeId`]s. Edge
/// insertions between `start_changes` and `commit_changes` are logged and
/// can be undone exactly by `rollback_changes`; promise resolution is not
/// transactional and must only be performed on committed state.
pub struct CycleGraph {
    nodes: Vec<CycleNode>,
    /// Concrete nodes, keyed by store action.
    action_to_node: AHashMap<SeqNum, NodeId>,
    /// Outstanding promise nodes, keyed by the reader that created them.
    /// `None` is a tombstone left behind by resolution.
    reader_to_promise: AHashMap<SeqNum, Option<NodeId>>,
    has_cycles: bool,
    old_cycles: bool,
    /// Nodes whose last forward edge must be popped on rollback, in
    /// insertion order.
    rollback: Vec<NodeId>,
    /// Nodes whose `rmw` must be cleared on rollback.
    rmw_rollback: Vec<NodeId>,
    /// Scratch set for reachability queries. Reused between calls; queries
    /// must not nest (the core is single-threaded and never does).
    discovered: RefCell<AHashSet<NodeId>>,
}

impl CycleGraph {
    pub fn new() -> Self {
        CycleGraph {
            nodes: Vec::new(),
            action_to_node: AHashMap::new(),
            reader_to_promise: AHashMap::new(),
            has_cycles: false,
            old_cycles: false,
            rollback: Vec::new(),
            rmw_rollback: Vec::new(),
            discovered: RefCell::new(AHashSet::new()),
        }
    }

    pub fn node(&self, id: NodeId) -> &CycleNode {
        &self.nodes[id.index()]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes in insertion order, retired slots included.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &CycleNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (NodeId(i as u32), n))
    }

    fn alloc(&mut self, node: CycleNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// The concrete node for `act`, if one exists.
    pub fn find_action_node(&self, act: &ModelAction) -> Option<NodeId> {
        self.action_to_node.get(&act.seq()).copied()
    }

    /// The outstanding promise node created by `reader`, if any. A
    /// resolved promise reads as absent.
    pub fn find_promise_node(&self, reader: &ModelAction) -> Option<NodeId> {
        self.reader_to_promise
            .get(&reader.seq())
            .copied()
            .flatten()
    }

    /// Get or create the concrete node for a store action.
    pub fn node_for_action(&mut self, act: &ModelAction) -> NodeId {
        if let Some(&id) = self.action_to_node.get(&act.seq()) {
            return id;
        }
        let id = self.alloc(CycleNode::new_concrete(act.clone()));
        self.action_to_node.insert(act.seq(), id);
        id
    }

    /// Get or create the node for an outstanding promise.
    pub fn node_for_promise(&mut self, promise: &Promise) -> NodeId {
        let reader = promise.reader_seq();
        if let Some(Some(id)) = self.reader_to_promise.get(&reader) {
            return *id;
        }
        let id = self.alloc(CycleNode::new_promise(promise.clone()));
        self.reader_to_promise.insert(reader, Some(id));
        id
    }

    /// Insert `from -> to` with its back-edge mirror. Duplicates and
    /// self-loops insert nothing. O(deg) duplicate check.
    fn add_edge(&mut self, from: NodeId, to: NodeId) -> bool {
        if from == to || self.nodes[from.index()].edges.contains(&to) {
            return false;
        }
        self.nodes[from.index()].edges.push(to);
        self.nodes[to.index()].back_edges.push(from);
        true
    }

    /// Pop the last forward edge of `from`, unhooking the mirror.
    fn remove_last_edge(&mut self, from: NodeId) -> Option<NodeId> {
        let to = self.nodes[from.index()].edges.pop()?;
        let back = &mut self.nodes[to.index()].back_edges;
        let pos = back
            .iter()
            .position(|&n| n == from)
            .expect("back-edge mirror missing");
        back.remove(pos);
        Some(to)
    }

    /// Pop the last back edge of `of`, unhooking the mirror.
    fn remove_last_back_edge(&mut self, of: NodeId) -> Option<NodeId> {
        let from = self.nodes[of.index()].back_edges.pop()?;
        let edges = &mut self.nodes[from.index()].edges;
        let pos = edges
            .iter()
            .position(|&n| n == of)
            .expect("forward-edge mirror missing");
        edges.remove(pos);
        Some(from)
    }

    /// Whether `to` can be reached from `from` over forward edges.
    ///
    /// Iterative search over the shared scratch set; O(V+E), not nestable.
    pub fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        let mut discovered = self.discovered.borrow_mut();
        discovered.clear();

        let mut stack = vec![from];
        discovered.insert(from);
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            for &next in self.nodes[id.index()].edges.iter() {
                if discovered.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Reachability between two actions; false if either has no node.
    pub fn check_reachable(&self, from: &ModelAction, to: &ModelAction) -> bool {
        match (self.find_action_node(from), self.find_action_node(to)) {
            (Some(f), Some(t)) => self.reachable(f, t),
            _ => false,
        }
    }

    /// Insert the must-happen-before edge `from -> to`, flagging a cycle if
    /// `from` was already reachable from `to`.
    ///
    /// If `from` has an RMW successor other than `to`, the successor
    /// inherits the edge as well: nothing the store precedes may be
    /// inserted between the store and its RMW.
    ///
    /// Returns whether any new edge was added.
    pub fn add_node_edge(&mut self, from: NodeId, to: NodeId) -> bool {
        if !self.has_cycles {
            self.has_cycles = self.reachable(to, from);
            if self.has_cycles {
                debug!(?from, ?to, "edge closes a cycle");
            }
        }

        let mut added = false;
        if self.add_edge(from, to) {
            self.rollback.push(from);
            added = true;
        }

        if let Some(rmw) = self.nodes[from.index()].rmw {
            if rmw != to {
                if !self.has_cycles {
                    self.has_cycles = self.reachable(to, rmw);
                    if self.has_cycles {
                        debug!(?rmw, ?to, "inherited rmw edge closes a cycle");
                    }
                }
                if self.add_edge(rmw, to) {
                    self.rollback.push(rmw);
                    added = true;
                }
            }
        }
        added
    }

    /// Edge between two actions, creating nodes as needed.
    pub fn add_action_edge(&mut self, from: &ModelAction, to: &ModelAction) -> bool {
        let from = self.node_for_action(from);
        let to = self.node_for_action(to);
        self.add_node_edge(from, to)
    }

    /// Record that `rmw` reads from the store `from`.
    ///
    /// The RMW successor inherits every outgoing edge of its store. No
    /// cycle check is needed for the inherited edges: the caller guarantees
    /// one of the two nodes is brand new, so either `rmw` has no in-edges
    /// yet or `from` has no out-edges yet.
    pub fn add_rmw_edge(&mut self, from: &ModelAction, rmw: &ModelAction) -> Result<(), GraphError> {
        let from_id = self.node_for_action(from);
        let rmw_id = self.node_for_action(rmw);

        let prior = self.nodes[from_id.index()].rmw;
        let violation = if self.nodes[from_id.index()].set_rmw(rmw_id) {
            self.has_cycles = true;
            let prior = prior.expect("set_rmw failed without a prior rmw");
            let prior_seq = self.nodes[prior.index()]
                .action()
                .expect("rmw successor is a concrete store")
                .seq();
            debug!(store = %from.seq(), rmw = %rmw.seq(), "second rmw reading from one store");
            Some(GraphError::RmwAtomicityViolation {
                store: from.seq(),
                prior: prior_seq,
                rmw: rmw.seq(),
            })
        } else {
            self.rmw_rollback.push(from_id);
            None
        };

        let inherited: EdgeList = self.nodes[from_id.index()].edges.clone();
        for to in inherited {
            if to != rmw_id && self.add_edge(rmw_id, to) {
                self.rollback.push(rmw_id);
            }
        }

        self.add_node_edge(from_id, rmw_id);

        match violation {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve the promise created by `reader` against `writer`.
    ///
    /// If no concrete node for `writer` exists, the promise node converts
    /// in place and migrates to the concrete map. Otherwise the promise
    /// node merges into the writer's node; other outstanding promises the
    /// merge forces to resolve to the same writer are returned.
    ///
    /// Merging is not transactional: callers must only resolve promises on
    /// committed state, and must discard the execution on error.
    pub fn resolve_promise(
        &mut self,
        reader: &ModelAction,
        writer: &ModelAction,
    ) -> Result<Vec<Promise>, GraphError> {
        let p_id = self
            .reader_to_promise
            .get(&reader.seq())
            .copied()
            .flatten()
            .expect("resolve_promise: no outstanding promise for this reader");

        let mut must_also = Vec::new();
        match self.action_to_node.get(&writer.seq()).copied() {
            Some(w_id) => {
                self.merge_nodes(w_id, p_id, &mut must_also)?;
            }
            None => {
                // No existing write node; just convert the promise node.
                self.nodes[p_id.index()].resolve_promise(writer);
                self.reader_to_promise.insert(reader.seq(), None);
                self.action_to_node.insert(writer.seq(), p_id);
                debug!(reader = %reader.seq(), writer = %writer.seq(), "promise resolved in place");
            }
        }
        Ok(must_also)
    }

    /// Merge promise node `p` into concrete node `w`, re-anchoring every
    /// edge of `p` on `w`.
    ///
    /// A promise neighbor whose re-anchored edge would close a cycle is
    /// transitively merged instead; its promise is appended to `must_also`
    /// before the recursive merge, so outer promises precede deeper ones.
    fn merge_nodes(
        &mut self,
        w: NodeId,
        p: NodeId,
        must_also: &mut Vec<Promise>,
    ) -> Result<(), GraphError> {
        assert!(
            !self.nodes[w.index()].is_promise(),
            "merge target must be concrete"
        );
        let w_seq = self.nodes[w.index()]
            .action()
            .expect("merge target must be a live concrete node")
            .seq();
        let (reader_seq, compatible) = {
            let promise = self.nodes[p.index()]
                .promise()
                .expect("merge source must be a promise node");
            let writer = self.nodes[w.index()].action().unwrap();
            (promise.reader_seq(), promise.is_compatible(writer))
        };
        if !compatible {
            self.has_cycles = true;
            debug!(reader = %reader_seq, writer = %w_seq, "incompatible promise resolution");
            return Err(GraphError::IncompatiblePromise {
                reader: reader_seq,
                writer: w_seq,
            });
        }

        // Transfer back edges to w.
        while let Some(back) = self.remove_last_back_edge(p) {
            if back == w {
                continue;
            }
            if self.nodes[back.index()].is_promise() {
                if self.reachable(w, back) {
                    // Edge would create a cycle; merge instead.
                    must_also.push(self.nodes[back.index()].promise().unwrap().clone());
                    self.merge_nodes(w, back, must_also)?;
                } else {
                    self.add_edge(back, w);
                }
            } else {
                self.add_node_edge(back, w);
            }
        }

        // Transfer forward edges to w.
        while let Some(forward) = self.remove_last_edge(p) {
            if forward == w {
                continue;
            }
            if self.nodes[forward.index()].is_promise() {
                if self.reachable(forward, w) {
                    must_also.push(self.nodes[forward.index()].promise().unwrap().clone());
                    self.merge_nodes(w, forward, must_also)?;
                } else {
                    self.add_edge(w, forward);
                }
            } else {
                self.add_node_edge(w, forward);
            }
        }

        self.reader_to_promise.insert(reader_seq, None);
        let _ = self.nodes[p.index()].take_promise();
        debug!(reader = %reader_seq, writer = %w_seq, "promise node merged");

        if self.has_cycles {
            return Err(GraphError::Contradiction);
        }
        Ok(())
    }

    /// Whether `promise` has become unsatisfiable given that everything
    /// reachable from `from` now happens after it: each concrete node
    /// visited eliminates its thread from the promise.
    pub fn check_promise(&self, from: &ModelAction, promise: &mut Promise) -> bool {
        if promise.has_failed() {
            return true;
        }
        let from_id = self
            .find_action_node(from)
            .expect("check_promise from an unknown action");

        let mut discovered = self.discovered.borrow_mut();
        discovered.clear();

        let mut queue = vec![from_id];
        discovered.insert(from_id);
        while let Some(id) = queue.pop() {
            let node = &self.nodes[id.index()];
            if let Some(act) = node.action() {
                if promise.eliminate_thread(act.tid()) {
                    return true;
                }
            }
            for &next in node.edges.iter() {
                if discovered.insert(next) {
                    queue.push(next);
                }
            }
        }
        false
    }

    pub fn has_cycles(&self) -> bool {
        self.has_cycles
    }

    /// Open a transaction. At most one may be open at a time.
    pub fn start_changes(&self) {
        assert!(self.rollback.is_empty(), "rollback log not empty");
        assert!(self.rmw_rollback.is_empty(), "rmw rollback log not empty");
        assert!(
            self.old_cycles == self.has_cycles,
            "cycle flag changed outside a transaction"
        );
    }

    /// Keep everything since `start_changes`.
    pub fn commit_changes(&mut self) {
        self.rollback.clear();
        self.rmw_rollback.clear();
        self.old_cycles = self.has_cycles;
    }

    /// Undo everything since `start_changes`, restoring edges, RMW links
    /// and the cycle flag exactly.
    pub fn rollback_changes(&mut self) {
        trace!(
            edges = self.rollback.len(),
            rmws = self.rmw_rollback.len(),
            "rolling back graph changes"
        );
        let rollback = std::mem::take(&mut self.rollback);
        for id in rollback {
            let _ = self.remove_last_edge(id);
        }
        let rmw_rollback = std::mem::take(&mut self.rmw_rollback);
        for id in rmw_rollback {
            self.nodes[id.index()].clear_rmw();
        }
        self.has_cycles = self.old_cycles;
    }

    fn dot_id(&self, id: NodeId) -> String {
        match &self.nodes[id.index()].shape {
            NodeShape::Concrete(act) => format!("N{}", act.seq()),
            NodeShape::Promise(promise) => format!("P{}", promise.reader_seq()),
            NodeShape::Retired => unreachable!("retired nodes have no edges"),
        }
    }

    /// Write the graph as a Graphviz digraph: forward edges solid, the RMW
    /// successor dotted.
    pub fn dump_dot<W: Write>(&self, name: &str, out: &mut W) -> io::Result<()> {
        writeln!(out, "digraph {} {{", name)?;
        for (id, node) in self.nodes() {
            match &node.shape {
                NodeShape::Concrete(act) => {
                    writeln!(
                        out,
                        "N{} [label=\"{}, T{}\"];",
                        act.seq(),
                        act.seq(),
                        act.tid()
                    )?;
                }
                NodeShape::Promise(promise) => {
                    writeln!(
                        out,
                        "P{} [label=\"promise, reader {}\", shape=box];",
                        promise.reader_seq(),
                        promise.reader_seq()
                    )?;
                }
                NodeShape::Retired => continue,
            }
            let this = self.dot_id(id);
            if let Some(rmw) = node.rmw {
                writeln!(out, "{} -> {} [style=dotted];", this, self.dot_id(rmw))?;
            }
            for &to in node.edges.iter() {
                writeln!(out, "{} -> {};", this, self.dot_id(to))?;
            }
        }
        writeln!(out, "}}")
    }
}

impl Default for CycleGraph {
    fn default() -> Self {
        Self::new()
    }
}
