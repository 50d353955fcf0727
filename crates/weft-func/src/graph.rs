//! Inter-function graph: which functions may follow which.

use crate::node::FuncNode;
use ahash::AHashMap;
use std::collections::VecDeque;

/// Stable index of a function node in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub(crate) u32);

impl FuncId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Direction of a recorded edge relative to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeKind {
    Out,
    In,
    Bi,
}

/// Registry owning every [`FuncNode`] and their call-graph edges.
#[derive(Default)]
pub struct FuncGraph {
    nodes: Vec<FuncNode>,
}

impl FuncGraph {
    pub fn new() -> Self {
        FuncGraph::default()
    }

    pub fn add_function(&mut self, name: &str) -> FuncId {
        let id = FuncId(self.nodes.len() as u32);
        self.nodes.push(FuncNode::new(id, name));
        id
    }

    pub fn func(&self, id: FuncId) -> &FuncNode {
        &self.nodes[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut FuncNode {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Record that `to` may run after `from`. Idempotent per direction; an
    /// edge already known in the opposite direction upgrades to
    /// bidirectional on both endpoints.
    pub fn add_out_edge(&mut self, from: FuncId, to: FuncId) {
        self.nodes[from.index()].note_out_edge(to);
        self.nodes[to.index()].note_in_edge(from);
    }

    /// Breadth-first distance from `from` to `target` over out-edges,
    /// cut off at `max_step`. Returns -1 when the target is unreachable or
    /// the distance would exceed the cutoff.
    pub fn compute_distance(&self, from: FuncId, target: FuncId, max_step: u32) -> i32 {
        if from == target {
            return 0;
        }

        let mut queue = VecDeque::new();
        let mut distances: AHashMap<FuncId, u32> = AHashMap::new();
        queue.push_back(from);
        distances.insert(from, 0);

        while let Some(curr) = queue.pop_front() {
            let dist = distances[&curr];
            if max_step <= dist {
                return -1;
            }

            for &out in self.nodes[curr.index()].out_edges() {
                if !distances.contains_key(&out) {
                    if out == target {
                        return dist as i32 + 1;
                    }
                    queue.push_back(out);
                    distances.insert(out, dist + 1);
                }
            }
        }

        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_edges_are_idempotent_and_upgrade_to_bidirectional() {
        let mut g = FuncGraph::new();
        let a = g.add_function("producer");
        let b = g.add_function("consumer");

        g.add_out_edge(a, b);
        g.add_out_edge(a, b);
        assert_eq!(g.func(a).out_edges(), &[b]);
        assert!(g.func(b).out_edges().is_empty());

        g.add_out_edge(b, a);
        assert_eq!(g.func(b).out_edges(), &[a]);
        assert_eq!(g.func(a).out_edges(), &[b]);
    }

    #[test]
    fn distance_respects_cutoff() {
        let mut g = FuncGraph::new();
        let f: Vec<FuncId> = (0..5).map(|i| g.add_function(&format!("f{i}"))).collect();
        for w in f.windows(2) {
            g.add_out_edge(w[0], w[1]);
        }

        assert_eq!(g.compute_distance(f[0], f[0], 10), 0);
        assert_eq!(g.compute_distance(f[0], f[3], 10), 3);
        assert_eq!(g.compute_distance(f[0], f[3], 2), -1);
        assert_eq!(g.compute_distance(f[3], f[0], 10), -1);
    }
}
