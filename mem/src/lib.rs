//! Memory management for the μVM: a simplified Immix-style heap with
//! block-granular mark-sweep collection, stop-the-world coordination of
//! concurrent mutators, and external roots supplied by a client
//! callback.

use std::fmt;

mod heap;
mod memory;
mod mutator;
mod space;

pub use heap::{Client, Heap, HeapInner, HeapSettings, ObjectMarker};
pub use memory::{
    load_u16, load_u32, load_u64, load_u8, store_u16, store_u32, store_u64, store_u8, Address,
    MemoryRegion, OS_PAGE_SIZE,
};
pub use mutator::Mutator;

/// Allocation failures surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No block (or block run) could be found, even after a collection
    /// cycle.
    OutOfMemory { requested: u64 },
    /// The object exceeds the block size on the small-object path.
    ObjectTooBig { size: u64 },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory: {requested} bytes requested after gc")
            }
            Self::ObjectTooBig { size } => {
                write!(f, "object too big: {size} bytes exceeds the block size")
            }
        }
    }
}

impl std::error::Error for HeapError {}
