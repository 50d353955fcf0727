//! Atomic actions observed by the checker core.

use crate::ids::{Loc, SeqNum, ThreadId};
use std::fmt;
use std::sync::Arc;

/// Kind of a model action.
///
/// `AtomicRmwReadCas` is the read phase of a source-level compare-and-swap;
/// the same lexical site later produces `AtomicRmw` (success) or plain
/// `AtomicRead` (failure) actions, which instruction lookup must treat as
/// equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ThreadCreate,
    ThreadYield,
    ThreadJoin,
    AtomicRead,
    AtomicWrite,
    AtomicRmw,
    AtomicRmwReadCas,
    Fence,
    Lock,
    Unlock,
}

impl ActionKind {
    pub fn is_read(self) -> bool {
        matches!(
            self,
            ActionKind::AtomicRead | ActionKind::AtomicRmw | ActionKind::AtomicRmwReadCas
        )
    }

    pub fn is_write(self) -> bool {
        matches!(self, ActionKind::AtomicWrite | ActionKind::AtomicRmw)
    }
}

/// Memory order of an atomic action.
///
/// A crate-local enum rather than `std::sync::atomic::Ordering`, which has
/// no Consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemOrder {
    Relaxed,
    Consume,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

/// A single atomic operation performed by a model thread.
///
/// Cloning is cheap: the source position is a shared `Arc<str>`.
#[derive(Debug, Clone)]
pub struct ModelAction {
    seq: SeqNum,
    tid: ThreadId,
    kind: ActionKind,
    order: MemOrder,
    loc: Loc,
    value: u64,
    read_value: Option<u64>,
    position: Option<Arc<str>>,
}

impl ModelAction {
    pub fn new(
        seq: SeqNum,
        tid: ThreadId,
        kind: ActionKind,
        order: MemOrder,
        loc: Loc,
        value: u64,
    ) -> Self {
        ModelAction {
            seq,
            tid,
            kind,
            order,
            loc,
            value,
            read_value: None,
            position: None,
        }
    }

    /// Attach the value this action read from its chosen store.
    pub fn with_read_value(mut self, value: u64) -> Self {
        self.read_value = Some(value);
        self
    }

    /// Attach the source position tag. Thread and lock actions carry none.
    pub fn with_position(mut self, position: impl Into<Arc<str>>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn order(&self) -> MemOrder {
        self.order
    }

    pub fn location(&self) -> Loc {
        self.loc
    }

    /// The value written, for write-like actions.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The value observed by a read-like action, once the driver has chosen
    /// a store to read from.
    pub fn read_value(&self) -> Option<u64> {
        self.read_value
    }

    pub fn position(&self) -> Option<&Arc<str>> {
        self.position.as_ref()
    }

    pub fn is_read(&self) -> bool {
        self.kind.is_read()
    }

    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }

    pub fn same_location(&self, other: &ModelAction) -> bool {
        self.loc == other.loc
    }
}

impl fmt::Display for ModelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} T{} {:?} @ {}",
            self.seq, self.tid, self.kind, self.loc
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rmw_is_both_read_and_write() {
        assert!(ActionKind::AtomicRmw.is_read());
        assert!(ActionKind::AtomicRmw.is_write());
        assert!(ActionKind::AtomicRmwReadCas.is_read());
        assert!(!ActionKind::AtomicRmwReadCas.is_write());
        assert!(!ActionKind::ThreadCreate.is_read());
    }

    #[test]
    fn builder_carries_read_value_and_position() {
        let act = ModelAction::new(
            SeqNum::new(7),
            ThreadId::new(2),
            ActionKind::AtomicRead,
            MemOrder::Acquire,
            Loc::new(0x40),
            0,
        )
        .with_read_value(13)
        .with_position("queue.c:42");

        assert_eq!(act.read_value(), Some(13));
        assert_eq!(act.position().map(|p| p.as_ref()), Some("queue.c:42"));
    }
}
