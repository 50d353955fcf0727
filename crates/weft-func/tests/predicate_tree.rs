//! Property tests: predicate-tree growth is deterministic, and every
//! source position resolves to exactly one instruction record per action
//! kind (collision-chain siblings included).

use proptest::prelude::*;
use std::collections::HashSet;
use weft_action::{
    ActionKind, ExecutionCtx, Loc, MemOrder, ModelAction, Params, SeqNum, ThreadId,
};
use weft_func::{FuncGraph, FuncId, NullHistory};

#[derive(Debug, Clone)]
struct Event {
    site: u8,
    is_write: bool,
    value: u64,
}

fn event_strategy() -> impl Strategy<Value = Event> {
    (0u8..4, any::<bool>(), 0u64..3).prop_map(|(site, is_write, value)| Event {
        site,
        is_write,
        value,
    })
}

fn action_for(seq: u64, ev: &Event) -> ModelAction {
    let pos = format!("gen.c:{}", ev.site);
    // Sites share locations so equality predicates arise.
    let loc = Loc::new(0x100 + u64::from(ev.site % 3));
    if ev.is_write {
        ModelAction::new(
            SeqNum::new(seq),
            ThreadId::new(0),
            ActionKind::AtomicWrite,
            MemOrder::Release,
            loc,
            ev.value,
        )
        .with_position(pos)
    } else {
        ModelAction::new(
            SeqNum::new(seq),
            ThreadId::new(0),
            ActionKind::AtomicRead,
            MemOrder::Acquire,
            loc,
            0,
        )
        .with_read_value(ev.value)
        .with_position(pos)
    }
}

fn grow_tree(events: &[Event]) -> (FuncGraph, FuncId) {
    let mut graph = FuncGraph::new();
    let id = graph.add_function("generated");
    let ctx = ExecutionCtx::new(Params::default());
    let mut hist = NullHistory;
    let t0 = ThreadId::new(0);

    let f = graph.func_mut(id);
    f.function_entry_handler(t0);
    for (i, ev) in events.iter().enumerate() {
        let act = action_for(i as u64 + 1, ev);
        f.add_inst(&act, &ctx);
        f.update_tree(&act, &mut hist);
    }
    f.function_exit_handler(t0);
    (graph, id)
}

fn tree_dump(graph: &FuncGraph, id: FuncId) -> String {
    let mut out = Vec::new();
    graph.func(id).dump_predicate_tree(&mut out).unwrap();
    String::from_utf8(out).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn tree_growth_is_deterministic(
        events in proptest::collection::vec(event_strategy(), 1..30),
    ) {
        let (g1, id1) = grow_tree(&events);
        let (g2, id2) = grow_tree(&events);

        prop_assert_eq!(tree_dump(&g1, id1), tree_dump(&g2, id2));

        let mut leaves1: Vec<u32> =
            g1.func(id1).predicate_leaves().map(|p| p.as_u32()).collect();
        let mut leaves2: Vec<u32> =
            g2.func(id2).predicate_leaves().map(|p| p.as_u32()).collect();
        leaves1.sort_unstable();
        leaves2.sort_unstable();
        prop_assert_eq!(leaves1, leaves2);
    }

    #[test]
    fn positions_resolve_to_one_record_per_kind(
        events in proptest::collection::vec(
            (0u8..4, any::<bool>(), 0u64..2),
            1..40,
        ),
    ) {
        let mut graph = FuncGraph::new();
        let id = graph.add_function("generated");
        let ctx = ExecutionCtx::new(Params::default());

        let f = graph.func_mut(id);
        for (i, &(site, is_write, loc_salt)) in events.iter().enumerate() {
            // The location varies independently of the site, so some sites
            // go multi-location.
            let loc = Loc::new(0x100 + u64::from(site) + loc_salt);
            let kind = if is_write {
                ActionKind::AtomicWrite
            } else {
                ActionKind::AtomicRead
            };
            let act = ModelAction::new(
                SeqNum::new(i as u64 + 1),
                ThreadId::new(0),
                kind,
                MemOrder::SeqCst,
                loc,
                0,
            )
            .with_position(format!("gen.c:{site}"));
            f.add_inst(&act, &ctx);
        }

        let mut seen = HashSet::new();
        for (_, inst) in graph.func(id).insts() {
            prop_assert!(
                seen.insert((inst.position().to_string(), inst.kind())),
                "two records share position {} and kind {:?}",
                inst.position(),
                inst.kind(),
            );
        }
    }
}
