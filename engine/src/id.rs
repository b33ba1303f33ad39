// id.rs — Identifiers for plan-graph nodes
//
// Array and operation nodes are named by process-local monotonic counters.
// The allocator is owned by the plan-builder `Context` and shared by every
// array created from it, so two contexts never interfere.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identifier of an array node (`array-001`, `array-002`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(pub u32);

/// Identifier of an operation node (`op-001`, `op-002`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u32);

impl fmt::Display for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "array-{:03}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{:03}", self.0)
    }
}

/// Allocator for node identifiers. Produces monotonically increasing IDs
/// starting at 1, in allocation order.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_array: AtomicU32,
    next_op: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_array(&self) -> ArrayId {
        ArrayId(self.next_array.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn alloc_op(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
