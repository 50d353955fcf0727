//! Action identities, promises, and execution context for the weft model checker.

pub mod action;
pub mod exec;
pub mod ids;
pub mod promise;

pub use action::{ActionKind, MemOrder, ModelAction};
pub use exec::{ExecOutcome, ExecStats, ExecutionCtx, Params};
pub use ids::{Loc, SeqNum, ThreadId};
pub use promise::{Promise, ThreadSet};
