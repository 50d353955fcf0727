//! Property tests for the universal graph invariants: back-edge symmetry,
//! duplicate-free adjacency, no self-loops, cycle-flag soundness, and
//! rollback exactness.

use proptest::prelude::*;
use weft_action::{ActionKind, Loc, MemOrder, ModelAction, SeqNum, ThreadId};
use weft_graph::{CycleGraph, NodeId};

const POOL: u64 = 8;

fn store(seq: u64) -> ModelAction {
    ModelAction::new(
        SeqNum::new(seq),
        ThreadId::new((seq % 3) as u32),
        ActionKind::AtomicWrite,
        MemOrder::Release,
        Loc::new(0x100),
        seq,
    )
}

fn rmw(seq: u64) -> ModelAction {
    ModelAction::new(
        SeqNum::new(seq),
        ThreadId::new((seq % 3) as u32),
        ActionKind::AtomicRmw,
        MemOrder::AcqRel,
        Loc::new(0x100),
        seq,
    )
}

#[derive(Debug, Clone)]
enum Op {
    /// Happens-before edge between two pool stores.
    Edge(u64, u64),
    /// Fresh RMW reading from a pool store.
    Rmw(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1..=POOL, 1..=POOL).prop_map(|(a, b)| Op::Edge(a, b)),
        1 => (1..=POOL).prop_map(Op::Rmw),
    ]
}

fn apply(g: &mut CycleGraph, op: &Op, next_rmw_seq: &mut u64) {
    match *op {
        Op::Edge(a, b) => {
            let from = g.node_for_action(&store(a));
            let to = g.node_for_action(&store(b));
            let closes = g.reachable(to, from);
            g.add_node_edge(from, to);
            if closes {
                assert!(g.has_cycles(), "edge closed a cycle but the flag is unset");
            }
        }
        Op::Rmw(a) => {
            // The rmw node must be brand new (caller contract of
            // add_rmw_edge), so draw from a disjoint seq namespace.
            let act = rmw(*next_rmw_seq);
            *next_rmw_seq += 1;
            let _ = g.add_rmw_edge(&store(a), &act);
        }
    }
}

type NodeSnapshot = (Vec<NodeId>, Vec<NodeId>, Option<NodeId>);

fn snapshot(g: &CycleGraph) -> (Vec<NodeSnapshot>, bool) {
    let nodes = g
        .nodes()
        .map(|(_, n)| (n.edges().to_vec(), n.back_edges().to_vec(), n.rmw()))
        .collect();
    (nodes, g.has_cycles())
}

fn check_adjacency_invariants(g: &CycleGraph) {
    for (id, node) in g.nodes() {
        assert!(!node.edges().contains(&id), "self-loop at {id:?}");
        for (i, &a) in node.edges().iter().enumerate() {
            assert!(
                !node.edges()[i + 1..].contains(&a),
                "duplicate forward edge at {id:?}"
            );
        }
        for (i, &a) in node.back_edges().iter().enumerate() {
            assert!(
                !node.back_edges()[i + 1..].contains(&a),
                "duplicate back edge at {id:?}"
            );
        }
        for &to in node.edges() {
            assert!(
                g.node(to).back_edges().contains(&id),
                "missing back-edge mirror for {id:?} -> {to:?}"
            );
        }
        for &from in node.back_edges() {
            assert!(
                g.node(from).edges().contains(&id),
                "missing forward mirror for {from:?} -> {id:?}"
            );
        }
    }
}

fn check_cycle_flag_soundness(g: &CycleGraph) {
    if g.has_cycles() {
        return;
    }
    for (id, node) in g.nodes() {
        for &to in node.edges() {
            assert!(
                !g.reachable(to, id),
                "graph has a cycle through {id:?} but the flag is unset"
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn rollback_restores_committed_state(
        committed in proptest::collection::vec(op_strategy(), 0..12),
        speculative in proptest::collection::vec(op_strategy(), 1..12),
    ) {
        let mut g = CycleGraph::new();
        let mut next_rmw_seq = 1000;
        for op in &committed {
            apply(&mut g, op, &mut next_rmw_seq);
        }
        g.commit_changes();

        let (before_nodes, before_cycles) = snapshot(&g);
        let before_count = g.node_count();

        g.start_changes();
        for op in &speculative {
            apply(&mut g, op, &mut next_rmw_seq);
        }
        check_adjacency_invariants(&g);
        check_cycle_flag_soundness(&g);
        g.rollback_changes();

        let (after_nodes, after_cycles) = snapshot(&g);
        prop_assert_eq!(after_cycles, before_cycles);
        prop_assert_eq!(&after_nodes[..before_count], &before_nodes[..]);
        // Nodes created inside the transaction survive rollback, but bare.
        for extra in &after_nodes[before_count..] {
            prop_assert!(extra.0.is_empty() && extra.1.is_empty() && extra.2.is_none());
        }
        check_adjacency_invariants(&g);
    }

    #[test]
    fn adjacency_invariants_hold_under_any_ops(
        ops in proptest::collection::vec(op_strategy(), 0..25),
    ) {
        let mut g = CycleGraph::new();
        let mut next_rmw_seq = 1000;
        for op in &ops {
            apply(&mut g, op, &mut next_rmw_seq);
            check_adjacency_invariants(&g);
            check_cycle_flag_soundness(&g);
        }
    }
}
