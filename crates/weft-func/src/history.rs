//! Interface to the cross-function write history.

use crate::graph::FuncId;
use weft_action::Loc;

/// What the predicate engine consumes from the model-wide history.
///
/// The history itself (write sets per location, function-graph upkeep)
/// lives with the execution driver; the core only reads recorded write
/// values and announces the first read or write a function performs at a
/// location in the current execution.
pub trait History {
    /// Every value recorded as written to `loc`, if any.
    fn write_values(&self, loc: Loc) -> Option<Vec<u64>>;

    /// Called the first time `func` reads `loc` in this execution.
    fn note_read_location(&mut self, loc: Loc, func: FuncId);

    /// Called the first time `func` writes `loc` in this execution.
    fn note_write_location(&mut self, loc: Loc, func: FuncId);
}

/// History stub for drivers that do not track cross-function writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHistory;

impl History for NullHistory {
    fn write_values(&self, _loc: Loc) -> Option<Vec<u64>> {
        None
    }

    fn note_read_location(&mut self, _loc: Loc, _func: FuncId) {}

    fn note_write_location(&mut self, _loc: Loc, _func: FuncId) {}
}
