//! Per-function owner of instruction records and the predicate tree.

use crate::graph::{EdgeKind, FuncId};
use crate::history::History;
use crate::inst::{FuncInst, InstId};
use crate::predicate::{HalfExpr, PredExpr, PredId, Predicate, NULLITY_MASK};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::trace;
use weft_action::{ActionKind, ExecutionCtx, Loc, ModelAction, SeqNum, ThreadId};

/// Per-function decision tree over atomic-operation sites.
///
/// The tree and the instruction records persist across executions; the
/// location/value sets are snapshot-scope and reset via
/// [`FuncNode::on_new_execution`]. Per-thread state is stacked so
/// recursive entry works.
pub struct FuncNode {
    id: FuncId,
    name: String,
    exit_count: u64,
    /// Generation counter bumped on every function entry; stale markers
    /// invalidate last-read values without clearing them.
    marker: u64,
    inst_counter: u32,

    insts: Vec<FuncInst>,
    inst_map: AHashMap<Arc<str>, InstId>,
    entry_insts: Vec<InstId>,

    preds: Vec<Predicate>,
    tree_entry: PredId,
    tree_exit: PredId,
    predicate_leaves: AHashSet<PredId>,
    failed_predicates: AHashSet<PredId>,

    // Per-thread state, indexed by thread id.
    thrd_marker: Vec<u64>,
    thrd_position: Vec<Vec<PredId>>,
    thrd_trace: Vec<Vec<Vec<PredId>>>,
    thrd_loc_inst: Vec<AHashMap<Loc, InstId>>,
    thrd_inst_id: Vec<AHashMap<InstId, u32>>,
    thrd_inst_pred: Vec<AHashMap<InstId, PredId>>,
    thrd_inst_act: Vec<AHashMap<InstId, SeqNum>>,

    // Snapshot scope: rebuilt on each execution restart.
    read_locations: AHashSet<Loc>,
    write_locations: AHashSet<Loc>,
    val_loc_map: AHashMap<u64, BTreeSet<Loc>>,
    loc_may_equal_map: AHashMap<Loc, BTreeSet<Loc>>,

    edge_table: AHashMap<FuncId, EdgeKind>,
    out_edges: Vec<FuncId>,
}

impl FuncNode {
    pub(crate) fn new(id: FuncId, name: &str) -> Self {
        let preds = vec![Predicate::new_entry(), Predicate::new_exit()];
        FuncNode {
            id,
            name: name.to_string(),
            exit_count: 0,
            marker: 1,
            inst_counter: 1,
            insts: Vec::new(),
            inst_map: AHashMap::new(),
            entry_insts: Vec::new(),
            preds,
            tree_entry: PredId(0),
            tree_exit: PredId(1),
            predicate_leaves: AHashSet::new(),
            failed_predicates: AHashSet::new(),
            thrd_marker: Vec::new(),
            thrd_position: Vec::new(),
            thrd_trace: Vec::new(),
            thrd_loc_inst: Vec::new(),
            thrd_inst_id: Vec::new(),
            thrd_inst_pred: Vec::new(),
            thrd_inst_act: Vec::new(),
            read_locations: AHashSet::new(),
            write_locations: AHashSet::new(),
            val_loc_map: AHashMap::new(),
            loc_may_equal_map: AHashMap::new(),
            edge_table: AHashMap::new(),
            out_edges: Vec::new(),
        }
    }

    pub fn id(&self) -> FuncId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exit_count(&self) -> u64 {
        self.exit_count
    }

    pub fn tree_entry(&self) -> PredId {
        self.tree_entry
    }

    pub fn tree_exit(&self) -> PredId {
        self.tree_exit
    }

    pub fn predicate(&self, id: PredId) -> &Predicate {
        &self.preds[id.index()]
    }

    pub fn inst(&self, id: InstId) -> &FuncInst {
        &self.insts[id.index()]
    }

    pub fn insts(&self) -> impl Iterator<Item = (InstId, &FuncInst)> {
        self.insts
            .iter()
            .enumerate()
            .map(|(i, inst)| (InstId(i as u32), inst))
    }

    pub fn predicate_leaves(&self) -> impl Iterator<Item = PredId> + '_ {
        self.predicate_leaves.iter().copied()
    }

    pub fn is_leaf(&self, id: PredId) -> bool {
        self.predicate_leaves.contains(&id)
    }

    /// Current marker of `tid`, as stamped at its last entry.
    pub fn thread_marker(&self, tid: ThreadId) -> u64 {
        self.thrd_marker.get(tid.as_index()).copied().unwrap_or(0)
    }

    /// The thread's current position in the predicate tree.
    pub fn tree_position(&self, tid: ThreadId) -> Option<PredId> {
        self.thrd_position
            .get(tid.as_index())
            .and_then(|stack| stack.last())
            .copied()
    }

    fn alloc_pred(&mut self, pred: Predicate) -> PredId {
        let id = PredId(self.preds.len() as u32);
        self.preds.push(pred);
        id
    }

    fn attach_child(&mut self, parent: PredId, child: PredId) {
        let depth = self.preds[parent.index()].depth() + 1;
        self.preds[parent.index()].add_child(child);
        self.preds[child.index()].set_parent(parent);
        self.preds[child.index()].set_depth(depth);
    }

    fn create_inst(&mut self, act: &ModelAction, ctx: &ExecutionCtx) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts
            .push(FuncInst::new(act, ctx.execution_number()));
        id
    }

    /// Register the instruction record for `act`, or merge it into the one
    /// already at its position. Actions without a position (thread and lock
    /// operations) are ignored.
    pub fn add_inst(&mut self, act: &ModelAction, ctx: &ExecutionCtx) {
        let Some(position) = act.position() else {
            return;
        };

        let Some(&head) = self.inst_map.get(position) else {
            let id = self.create_inst(act, ctx);
            self.inst_map.insert(position.clone(), id);
            return;
        };

        // Volatile ++/-- and decomposed CAS produce read and write actions
        // at one position; chain a collision sibling per distinct kind.
        let mut inst = head;
        if self.insts[head.index()].kind() != act.kind() {
            match self.search_in_collision(head, act) {
                Some(sibling) => inst = sibling,
                None => {
                    let sibling = self.create_inst(act, ctx);
                    self.insts[head.index()].add_collision(sibling);
                    return;
                }
            }
        }
        assert_eq!(self.insts[inst.index()].kind(), act.kind());

        // Re-stamp the canonical location when a new execution starts.
        let exec = ctx.execution_number();
        if self.insts[inst.index()].execution_number() != exec {
            self.insts[inst.index()].set_location(act.location());
            self.insts[inst.index()].set_execution_number(exec);
        }

        if self.insts[inst.index()].location() != act.location() {
            self.insts[inst.index()].not_single_location();
        }
    }

    /// Find the collision sibling of `head` matching `act`'s kind.
    fn search_in_collision(&self, head: InstId, act: &ModelAction) -> Option<InstId> {
        self.insts[head.index()]
            .collisions()
            .iter()
            .copied()
            .find(|sibling| self.insts[sibling.index()].kind() == act.kind())
    }

    /// The instruction record `act` belongs to. The read phase of a source
    /// CAS matches the RMW and plain-read actions it later produces.
    pub fn get_inst(&self, act: &ModelAction) -> Option<InstId> {
        let position = act.position()?;
        let &head = self.inst_map.get(position)?;

        let inst_kind = self.insts[head.index()].kind();
        let act_kind = act.kind();
        if inst_kind == act_kind {
            Some(head)
        } else if inst_kind == ActionKind::AtomicRmwReadCas
            && matches!(act_kind, ActionKind::AtomicRmw | ActionKind::AtomicRead)
        {
            Some(head)
        } else {
            self.search_in_collision(head, act)
        }
    }

    /// Duplicate-free insert into the entry-instruction list.
    pub fn add_entry_inst(&mut self, inst: InstId) {
        if !self.entry_insts.contains(&inst) {
            self.entry_insts.push(inst);
        }
    }

    pub fn entry_insts(&self) -> &[InstId] {
        &self.entry_insts
    }

    /// Link a traversed instruction list: the first becomes an entry
    /// instruction, consecutive pairs become predecessor/successor.
    pub fn update_inst_tree(&mut self, list: &[InstId]) {
        let Some(&first) = list.first() else {
            return;
        };
        self.add_entry_inst(first);

        for pair in list.windows(2) {
            let (prev, curr) = (pair[0], pair[1]);
            self.insts[prev.index()].add_succ(curr);
            self.insts[curr.index()].add_pred(prev);
        }
    }

    fn ensure_thread(&mut self, tid: ThreadId) {
        let needed = tid.as_index() + 1;
        if self.thrd_marker.len() < needed {
            self.thrd_marker.resize(needed, 0);
            self.thrd_position.resize_with(needed, Vec::new);
            self.thrd_trace.resize_with(needed, Vec::new);
            self.thrd_loc_inst.resize_with(needed, AHashMap::new);
            self.thrd_inst_id.resize_with(needed, AHashMap::new);
            self.thrd_inst_pred.resize_with(needed, AHashMap::new);
            self.thrd_inst_act.resize_with(needed, AHashMap::new);
        }
    }

    fn set_marker(&mut self, tid: ThreadId) {
        self.marker += 1;
        self.thrd_marker[tid.as_index()] = self.marker;
    }

    /// `tid` entered this function: bump its marker and push fresh
    /// tree-position and trace frames.
    pub fn function_entry_handler(&mut self, tid: ThreadId) {
        self.ensure_thread(tid);
        self.set_marker(tid);
        let t = tid.as_index();
        self.thrd_position[t].push(self.tree_entry);
        self.thrd_trace[t].push(Vec::new());
    }

    /// `tid` left this function: wire the exit pointer, update weights,
    /// and pop the per-entry state.
    pub fn function_exit_handler(&mut self, tid: ThreadId) {
        self.exit_count += 1;
        let t = tid.as_index();

        self.thrd_inst_act[t].clear();
        self.thrd_loc_inst[t].clear();
        self.thrd_inst_id[t].clear();
        self.thrd_inst_pred[t].clear();

        let terminal = *self.thrd_position[t]
            .last()
            .expect("function_exit_handler without a matching entry");
        if self.preds[terminal.index()].exit_pred().is_none() {
            let exit = self.tree_exit;
            self.preds[terminal.index()].set_exit_pred(exit);
        }

        self.update_predicate_tree_weight(tid);

        self.thrd_position[t].pop();
        self.thrd_trace[t].pop();
    }

    /// Record the predicate observation for one atomic action of `tid`:
    /// maintain the coarse location sets, inform the history of first
    /// touches, then advance the thread's position in the predicate tree.
    pub fn update_tree(&mut self, act: &ModelAction, history: &mut dyn History) {
        if !act.is_read() && !act.is_write() {
            return;
        }
        let Some(inst) = self.get_inst(act) else {
            return;
        };
        let loc = act.location();

        if act.is_write() && !self.write_locations.contains(&loc) {
            self.write_locations.insert(loc);
            history.note_write_location(loc, self.id);
        }

        // The first time a single-location site reads some location,
        // import every value written there so far; those values connect
        // locations that may alias.
        if act.is_read()
            && !self.read_locations.contains(&loc)
            && self.insts[inst.index()].is_single_location()
        {
            self.read_locations.insert(loc);
            if let Some(values) = history.write_values(loc) {
                for value in values {
                    self.add_to_val_loc_map(value, loc);
                }
            }
            history.note_read_location(loc, self.id);
        }

        self.update_predicate_tree(act, inst);
    }

    fn update_predicate_tree(&mut self, act: &ModelAction, inst: InstId) {
        let tid = act.tid();
        let t = tid.as_index();
        assert!(
            t < self.thrd_position.len() && !self.thrd_position[t].is_empty(),
            "update_tree for a thread that has not entered this function"
        );
        let this_marker = self.thrd_marker[t];
        let mut curr = *self.thrd_position[t].last().unwrap();

        loop {
            if let Some(value) = act.read_value() {
                self.insts[inst.index()].set_last_read(tid, value, this_marker);
            }

            let (matched, unset) = self.follow_branch(curr, inst, act, this_marker);
            let mut branch = matched;

            // A branch whose predicate expression is still unset matches
            // anything, unless the observation lets us split it now.
            if branch.is_none() {
                if let Some(unset_pred) = unset {
                    if self.amend_predicate_expr(curr, inst, unset_pred, act) {
                        continue;
                    }
                    branch = Some(unset_pred);
                }
            }

            // Revisiting an instruction with an id at or below the current
            // one means the thread looped; close a back-edge and rewalk
            // from the loop head's parent.
            if branch.is_none() {
                if let Some(&next_id) = self.thrd_inst_id[t].get(&inst) {
                    let curr_id = self.preds[curr.index()]
                        .func_inst()
                        .and_then(|i| self.thrd_inst_id[t].get(&i))
                        .copied()
                        .unwrap_or(0);
                    if curr_id >= next_id {
                        let old_pred = self.thrd_inst_pred[t][&inst];
                        let back = self.preds[old_pred.index()]
                            .parent()
                            .expect("loop target has a parent");
                        self.preds[curr.index()].add_backedge(back);
                        trace!(func = %self.name, ?curr, ?back, "predicate loop edge");
                        curr = back;
                        continue;
                    }
                }
            }

            let Some(branch) = branch else {
                let half = self.infer_predicates(inst, act);
                self.generate_predicates(curr, inst, &half);
                continue;
            };

            if act.is_write() {
                self.preds[branch.index()].set_write(true);
            }
            if act.is_read() {
                let inst_loc = self.insts[inst.index()].location();
                self.thrd_loc_inst[t].insert(inst_loc, inst);
            }

            self.thrd_inst_pred[t].insert(inst, branch);
            *self.thrd_position[t].last_mut().unwrap() = branch;

            if !self.thrd_inst_id[t].contains_key(&inst) {
                let id = self.inst_counter;
                self.inst_counter += 1;
                self.thrd_inst_id[t].insert(inst, id);
            }

            self.preds[branch.index()].incr_expl_count();
            self.thrd_trace[t].last_mut().unwrap().push(branch);
            break;
        }
    }

    /// Search `curr`'s children for the branch at `inst` whose expressions
    /// all hold of `act`. Also reports the unique unset branch, if one
    /// exists (only read sites may have one).
    fn follow_branch(
        &self,
        curr: PredId,
        inst: InstId,
        act: &ModelAction,
        marker: u64,
    ) -> (Option<PredId>, Option<PredId>) {
        let mut unset = None;
        for &branch in self.preds[curr.index()].children() {
            let pred = &self.preds[branch.index()];
            if pred.func_inst() != Some(inst) {
                continue;
            }

            if pred.exprs().is_empty() {
                assert!(
                    unset.is_none(),
                    "more than one unset branch for one instruction"
                );
                unset = Some(branch);
                continue;
            }

            if pred
                .exprs()
                .iter()
                .all(|expr| self.eval_expr(expr, act, marker))
            {
                return (Some(branch), unset);
            }
        }
        (None, unset)
    }

    fn eval_expr(&self, expr: &PredExpr, act: &ModelAction, marker: u64) -> bool {
        match *expr {
            PredExpr::NoPredicate => true,
            PredExpr::Equality { inst, expect } => {
                let last = self.insts[inst.index()]
                    .last_read(act.tid(), marker)
                    .expect("equality predicate with no recorded last read");
                let next = act
                    .read_value()
                    .expect("equality predicate on an action without a read value");
                (last == next) == expect
            }
            PredExpr::Nullity { expect } => {
                let next = act
                    .read_value()
                    .expect("nullity predicate on an action without a read value");
                ((next & NULLITY_MASK) == 0) == expect
            }
        }
    }

    /// Propose the half-expressions a new branch at `inst` should
    /// discriminate on.
    fn infer_predicates(&self, inst: InstId, act: &ModelAction) -> Vec<HalfExpr> {
        let mut half = Vec::new();
        let loc = act.location();
        let t = act.tid().as_index();

        if self.insts[inst.index()].is_read() {
            if let Some(&last) = self.thrd_loc_inst[t].get(&loc) {
                half.push(HalfExpr::Equality(last));
            } else if self.insts[inst.index()].is_single_location() {
                // No read at this location yet; compare against reads at
                // locations its values say it may equal.
                if let Some(neighbors) = self.loc_may_equal_map.get(&loc) {
                    for neighbor in neighbors {
                        if let Some(&last) = self.thrd_loc_inst[t].get(neighbor) {
                            half.push(HalfExpr::Equality(last));
                        }
                    }
                }
            } else if act.read_value() == Some(0) {
                half.push(HalfExpr::Nullity);
            }
        }
        half
    }

    /// Attach one child per polarity combination of `half` under `curr`.
    /// With no half-expressions, a single child is attached; it carries the
    /// tautology at the entry node and for pure-write sites, and stays
    /// unset otherwise.
    fn generate_predicates(&mut self, curr: PredId, inst: InstId, half: &[HalfExpr]) {
        if half.is_empty() {
            let child = self.alloc_pred(Predicate::new(Some(inst)));
            self.attach_child(curr, child);
            self.predicate_leaves.insert(child);
            self.predicate_leaves.remove(&curr);

            if self.preds[curr.index()].is_entry() || self.insts[inst.index()].is_write() {
                self.preds[child.index()].add_expr(PredExpr::NoPredicate);
            }
            return;
        }

        let mut combos: Vec<Vec<PredExpr>> = vec![
            vec![half[0].with_polarity(true)],
            vec![half[0].with_polarity(false)],
        ];
        for expr in &half[1..] {
            let old = combos.len();
            for j in 0..old {
                let mut negated = combos[j].clone();
                combos[j].push(expr.with_polarity(true));
                negated.push(expr.with_polarity(false));
                combos.push(negated);
            }
        }

        trace!(func = %self.name, branches = combos.len(), "generating predicate branches");
        for combo in combos {
            let child = self.alloc_pred(Predicate::new(Some(inst)));
            for expr in combo {
                self.preds[child.index()].add_expr(expr);
            }
            self.attach_child(curr, child);
            self.predicate_leaves.insert(child);
        }
        self.predicate_leaves.remove(&curr);
    }

    /// Split an unset branch once a null observation arrives at a
    /// multi-location site: the unset branch becomes the non-null side and
    /// a fresh null side is attached. Returns whether it amended.
    fn amend_predicate_expr(
        &mut self,
        curr: PredId,
        inst: InstId,
        unset_pred: PredId,
        act: &ModelAction,
    ) -> bool {
        if self.insts[inst.index()].is_single_location() || act.read_value() != Some(0) {
            return false;
        }

        let null_side = self.alloc_pred(Predicate::new(Some(inst)));
        self.attach_child(curr, null_side);
        self.predicate_leaves.insert(null_side);

        self.preds[unset_pred.index()].add_expr(PredExpr::Nullity { expect: false });
        self.preds[null_side.index()].add_expr(PredExpr::Nullity { expect: true });
        trace!(func = %self.name, ?curr, "amended unset branch with nullity split");
        true
    }

    fn add_to_val_loc_map(&mut self, value: u64, loc: Loc) {
        let old_locations = self.val_loc_map.entry(value).or_default().clone();
        self.update_loc_may_equal_map(loc, &old_locations);
        self.val_loc_map.entry(value).or_default().insert(loc);
    }

    /// Locations that shared a value with `new_loc` become mutual
    /// may-equal neighbors.
    fn update_loc_may_equal_map(&mut self, new_loc: Loc, old_locations: &BTreeSet<Loc>) {
        if old_locations.contains(&new_loc) {
            return;
        }

        let neighbors = self.loc_may_equal_map.entry(new_loc).or_default();
        for &member in old_locations {
            neighbors.insert(member);
        }
        for &member in old_locations {
            self.loc_may_equal_map
                .entry(member)
                .or_default()
                .insert(new_loc);
        }
    }

    /// Remember which action `tid` last produced at `act`'s instruction.
    pub fn update_inst_act_map(&mut self, tid: ThreadId, act: &ModelAction) {
        let Some(inst) = self.get_inst(act) else {
            return;
        };
        self.thrd_inst_act[tid.as_index()].insert(inst, act.seq());
    }

    pub fn inst_act_map(&self, tid: ThreadId) -> Option<&AHashMap<InstId, SeqNum>> {
        self.thrd_inst_act.get(tid.as_index())
    }

    /// Mark `pred` as a failed exploration target.
    pub fn add_failed_predicate(&mut self, pred: PredId) {
        self.failed_predicates.insert(pred);
    }

    pub fn failed_predicates(&self) -> impl Iterator<Item = PredId> + '_ {
        self.failed_predicates.iter().copied()
    }

    pub fn incr_fail_count(&mut self, pred: PredId) {
        self.preds[pred.index()].incr_fail_count();
    }

    /// Recompute weights along the thread's trace, tail to head. Leaves
    /// decay with exploration and failure counts; interior nodes average
    /// their children, damped by depth.
    fn update_predicate_tree_weight(&mut self, tid: ThreadId) {
        self.failed_predicates.clear();

        let trace = self.thrd_trace[tid.as_index()]
            .last()
            .expect("weight update without a trace frame")
            .clone();
        for &node in trace.iter().rev() {
            let weight = if self.predicate_leaves.contains(&node) {
                let pred = &self.preds[node.index()];
                100.0 / f64::from(pred.expl_count() + pred.fail_count() + 1).sqrt()
            } else {
                let children = self.preds[node.index()].children();
                let sum: f64 = children
                    .iter()
                    .map(|c| self.preds[c.index()].weight())
                    .sum();
                let average = sum / children.len() as f64;
                average * 0.9f64.powi(self.preds[node.index()].depth() as i32)
            };
            self.preds[node.index()].set_weight(weight);
        }
    }

    pub(crate) fn note_out_edge(&mut self, other: FuncId) {
        match self.edge_table.get(&other) {
            None => {
                self.edge_table.insert(other, EdgeKind::Out);
                self.out_edges.push(other);
            }
            Some(EdgeKind::In) => {
                self.edge_table.insert(other, EdgeKind::Bi);
                self.out_edges.push(other);
            }
            Some(_) => {}
        }
    }

    pub(crate) fn note_in_edge(&mut self, other: FuncId) {
        match self.edge_table.get(&other) {
            None => {
                self.edge_table.insert(other, EdgeKind::In);
            }
            Some(EdgeKind::Out) => {
                self.edge_table.insert(other, EdgeKind::Bi);
            }
            Some(_) => {}
        }
    }

    pub fn out_edges(&self) -> &[FuncId] {
        &self.out_edges
    }

    /// Rebuild snapshot-scope state for a fresh execution. The predicate
    /// tree and instruction records persist.
    pub fn on_new_execution(&mut self) {
        self.read_locations.clear();
        self.write_locations.clear();
        self.val_loc_map.clear();
        self.loc_may_equal_map.clear();
    }

    /// Write the predicate tree as a Graphviz digraph: children solid,
    /// back-edges dashed, exit pointers dotted.
    pub fn dump_predicate_tree<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "digraph function_{} {{", self.name)?;
        for (i, pred) in self.preds.iter().enumerate() {
            let label = if pred.is_entry() {
                "entry".to_string()
            } else if pred.is_exit() {
                "exit".to_string()
            } else {
                let exprs: Vec<String> = pred.exprs().iter().map(|e| e.to_string()).collect();
                format!(
                    "i{}: [{}] expl {} fail {}",
                    pred.func_inst().map_or(0, |inst| inst.as_u32()),
                    exprs.join(" && "),
                    pred.expl_count(),
                    pred.fail_count()
                )
            };
            writeln!(out, "P{} [label=\"{}\"];", i, label)?;
            for child in pred.children() {
                writeln!(out, "P{} -> P{};", i, child.as_u32())?;
            }
            for back in pred.backedges() {
                writeln!(out, "P{} -> P{} [style=dashed];", i, back.as_u32())?;
            }
            if let Some(exit) = pred.exit_pred() {
                writeln!(out, "P{} -> P{} [style=dotted];", i, exit.as_u32())?;
            }
        }
        writeln!(out, "}}")
    }
}
