//! Stable identifiers shared across the checker core.

use std::fmt;

/// Identifier of a model-level thread.
///
/// Threads whose interleavings are explored are a data-model concept; they
/// never run core code concurrently, so this is just a dense index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    pub const fn new(id: u32) -> Self {
        ThreadId(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Dense index into per-thread tables.
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A memory location, identified by its address bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Loc(u64);

impl Loc {
    pub const fn new(addr: u64) -> Self {
        Loc(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Global sequence number of an action within one execution.
///
/// Sequence numbers are the stable identity by which the cycle graph looks
/// up store actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeqNum(u64);

impl SeqNum {
    pub const fn new(n: u64) -> Self {
        SeqNum(n)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
