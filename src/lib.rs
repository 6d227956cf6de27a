//! Layered virtual memory allocator.
//!
//! Instead of carving blocks out of heap regions obtained from the runtime,
//! this allocator reserves one giant contiguous range of virtual addresses up
//! front (35 TiB by default, with no backing storage) and slices it into
//! fixed-span *layers*, one per power-of-two size class. Physical memory is
//! only committed for the pages a live block actually covers, so blocks of a
//! page or more never fragment each other, and reallocations of large blocks
//! can move page mappings instead of bytes. See [`Valloc`] for the full
//! picture and usage examples.

use std::ptr::NonNull;

mod allocator;
mod arena;
mod freelist;
mod layer;
mod realloc;
mod size_class;
mod spin;
mod vmem;

#[cfg(test)]
mod tests;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::Valloc;
pub use arena::ChunkArena;

/// Total physical memory installed on the machine, in bytes. The allocator
/// never sizes anything from this (the reservation is address space, not
/// memory), but callers picking a custom geometry usually want to know it.
pub fn total_physical_memory() -> usize {
    unsafe { vmem::total_memory() }
}
