//! Modification-order cycle engine for the weft model checker.
//!
//! A dynamically maintained directed graph over store actions whose
//! reachability relation encodes the constraints of the current execution.
//! Supports online cycle detection, speculative future writes (promises)
//! and their resolution, read-modify-write atomicity edges, and
//! transactional rollback.

pub mod graph;
pub mod node;

pub use graph::{CycleGraph, GraphError};
pub use node::{CycleNode, NodeId};
