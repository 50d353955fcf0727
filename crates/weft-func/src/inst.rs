//! Per-source-position instruction records.

use smallvec::SmallVec;
use std::sync::Arc;
use weft_action::{ActionKind, Loc, MemOrder, ModelAction, ThreadId};

/// Stable index of an instruction record in its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub(crate) u32);

impl InstId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// One last-read observation; a stale marker makes it unreadable.
#[derive(Debug, Clone, Copy, Default)]
struct LastRead {
    marker: u64,
    value: u64,
}

/// A lexical atomic-operation site inside a function.
///
/// Many actions map onto one instruction. Sites whose actions are observed
/// at more than one memory location in an execution lose their
/// single-location flag; sites that produce actions of a different kind at
/// the same position (a volatile `++`, a decomposed CAS) chain collision
/// siblings.
#[derive(Debug)]
pub struct FuncInst {
    position: Arc<str>,
    /// Location observed when the record was created or last re-stamped.
    location: Loc,
    kind: ActionKind,
    order: MemOrder,
    single_location: bool,
    execution_number: u32,
    collisions: SmallVec<[InstId; 2]>,
    predecessors: SmallVec<[InstId; 2]>,
    successors: SmallVec<[InstId; 2]>,
    /// Indexed by thread; markers 0 mean "never recorded".
    last_reads: Vec<LastRead>,
}

impl FuncInst {
    pub(crate) fn new(act: &ModelAction, execution_number: u32) -> Self {
        let position = act
            .position()
            .expect("instruction records require a source position")
            .clone();
        FuncInst {
            position,
            location: act.location(),
            kind: act.kind(),
            order: act.order(),
            single_location: true,
            execution_number,
            collisions: SmallVec::new(),
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            last_reads: Vec::new(),
        }
    }

    pub fn position(&self) -> &Arc<str> {
        &self.position
    }

    pub fn location(&self) -> Loc {
        self.location
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn order(&self) -> MemOrder {
        self.order
    }

    pub fn is_read(&self) -> bool {
        self.kind.is_read()
    }

    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }

    /// Whether every action at this site so far used one location.
    pub fn is_single_location(&self) -> bool {
        self.single_location
    }

    pub(crate) fn not_single_location(&mut self) {
        self.single_location = false;
    }

    pub(crate) fn set_location(&mut self, loc: Loc) {
        self.location = loc;
    }

    pub(crate) fn execution_number(&self) -> u32 {
        self.execution_number
    }

    pub(crate) fn set_execution_number(&mut self, n: u32) {
        self.execution_number = n;
    }

    pub(crate) fn add_collision(&mut self, inst: InstId) {
        self.collisions.push(inst);
    }

    pub fn collisions(&self) -> &[InstId] {
        &self.collisions
    }

    /// Duplicate-free predecessor insert; true if inserted.
    pub fn add_pred(&mut self, other: InstId) -> bool {
        if self.predecessors.contains(&other) {
            return false;
        }
        self.predecessors.push(other);
        true
    }

    /// Duplicate-free successor insert; true if inserted.
    pub fn add_succ(&mut self, other: InstId) -> bool {
        if self.successors.contains(&other) {
            return false;
        }
        self.successors.push(other);
        true
    }

    pub fn predecessors(&self) -> &[InstId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[InstId] {
        &self.successors
    }

    /// Record the value `tid` read at this site under `marker`.
    pub fn set_last_read(&mut self, tid: ThreadId, value: u64, marker: u64) {
        let idx = tid.as_index();
        if self.last_reads.len() <= idx {
            self.last_reads.resize(idx + 1, LastRead::default());
        }
        self.last_reads[idx] = LastRead { marker, value };
    }

    /// The value `tid` last read at this site, if it was recorded under the
    /// current `marker`. Stale markers read as absent, which is how
    /// per-function-entry last-reads reset without clearing storage.
    pub fn last_read(&self, tid: ThreadId, marker: u64) -> Option<u64> {
        let entry = self.last_reads.get(tid.as_index())?;
        (entry.marker == marker).then_some(entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_action::SeqNum;

    fn read_at(pos: &str, loc: u64) -> ModelAction {
        ModelAction::new(
            SeqNum::new(1),
            ThreadId::new(0),
            ActionKind::AtomicRead,
            MemOrder::Acquire,
            Loc::new(loc),
            0,
        )
        .with_position(pos)
    }

    #[test]
    fn stale_marker_reads_as_absent() {
        let mut inst = FuncInst::new(&read_at("a.c:1", 0x10), 1);
        let tid = ThreadId::new(2);
        inst.set_last_read(tid, 99, 7);
        assert_eq!(inst.last_read(tid, 7), Some(99));
        assert_eq!(inst.last_read(tid, 8), None);
        assert_eq!(inst.last_read(ThreadId::new(0), 7), None);
    }

    #[test]
    fn pred_succ_inserts_are_duplicate_free() {
        let mut inst = FuncInst::new(&read_at("a.c:1", 0x10), 1);
        assert!(inst.add_pred(InstId(3)));
        assert!(!inst.add_pred(InstId(3)));
        assert!(inst.add_succ(InstId(4)));
        assert!(!inst.add_succ(InstId(4)));
        assert_eq!(inst.predecessors(), &[InstId(3)]);
        assert_eq!(inst.successors(), &[InstId(4)]);
    }
}
