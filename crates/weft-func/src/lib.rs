//! Per-function predicate decision trees for the weft model checker.
//!
//! A [`FuncNode`] records, for each lexical atomic-operation site inside a
//! function, the read-value predicates under which its branches have been
//! explored, guiding the scheduler toward fresh behavior. [`FuncGraph`]
//! owns all function nodes and their call-graph edges.

pub mod graph;
pub mod history;
pub mod inst;
pub mod node;
pub mod predicate;

pub use graph::{FuncGraph, FuncId};
pub use history::{History, NullHistory};
pub use inst::{FuncInst, InstId};
pub use node::FuncNode;
pub use predicate::{PredExpr, PredId, Predicate};
