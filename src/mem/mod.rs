//! Memory management for fiber stacks and caller-placed objects.
//!
//! Fiber stacks come from a pluggable [`StackAllocator`]; the default maps
//! them with a guard page on unix. [`Placed`] builds any runtime object inside
//! memory supplied by the caller.

pub mod placed;
pub mod stack;

pub use placed::Placed;
pub use stack::{
    default_stack_allocator, HeapStackAllocator, MemoryCounters, Stack, StackAllocator,
    StackMemory, MIN_STACK_SIZE,
};

#[cfg(unix)]
pub use stack::MmapStackAllocator;
