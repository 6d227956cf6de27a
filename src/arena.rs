use std::ptr::NonNull;

use crate::{size_class::round_down_to, vmem, Pointer};

/// Fixed size chunk arena over memory provided by somebody else. The arena
/// doesn't reserve anything itself: it is handed a range of reserved address
/// space and commits chunks the first time they are handed out. Deleted
/// chunks are never returned to the OS, they form a LIFO of reusable chunks
/// instead, so the arena suits workloads with a fairly stable number of live
/// chunks rather than ones that spike and drain.
///
/// Like the main allocator's free lists, the recycling metadata lives inside
/// the memory it describes: a deleted chunk stores the one-based index of
/// the chunk deleted before it in its first word (zero meaning none). One
/// word per chunk, no side table:
///
/// ```text
///                     last_deleted
///                          |
///                          v
/// +---------+---------+---------+---------+---------+-----------+
/// | chunk 0 | chunk 1 | chunk 2 | chunk 3 | chunk 4 |   never   |
/// |  live   | [0]: 0  |  live   | [0]: 2  |  live   | committed |
/// +---------+---------+---------+---------+---------+-----------+
///                ^                   |
///                +-------------------+
///                 chunk 3 was deleted after chunk 1
/// ```
pub struct ChunkArena {
    /// First address of the backing range.
    memory: usize,
    /// Chunk size in bytes, a power of two.
    chunk_size: usize,
    /// Total chunks that fit in the backing range.
    max_chunks: usize,
    /// Chunks currently handed out.
    chunks: usize,
    /// Index of the first chunk that has never been committed.
    next_fresh: usize,
    /// One-based index of the most recently deleted chunk, or zero.
    last_deleted: usize,
}

impl ChunkArena {
    /// Builds an arena over `memory_size` bytes of reserved address space at
    /// `memory`.
    ///
    /// # Safety
    ///
    /// `memory` must point at a reserved (not necessarily committed) range
    /// at least `memory_size` bytes long that stays valid for the arena's
    /// lifetime and is used by nobody else. `chunk_size` must be a power of
    /// two, a multiple of the page size, and must divide both `memory_size`
    /// and the address in `memory`.
    pub unsafe fn new(memory: NonNull<u8>, memory_size: usize, chunk_size: usize) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        debug_assert!(memory.as_ptr() as usize % chunk_size == 0);
        debug_assert!(memory_size % chunk_size == 0);

        Self {
            memory: memory.as_ptr() as usize,
            chunk_size,
            max_chunks: memory_size >> chunk_size.trailing_zeros(),
            chunks: 0,
            next_fresh: 0,
            last_deleted: 0,
        }
    }

    /// Hands out one chunk, reviving the most recently deleted chunk when
    /// one exists and committing a fresh one otherwise. Returns `None` when
    /// every chunk is handed out.
    ///
    /// # Safety
    ///
    /// The backing range must still be valid.
    pub unsafe fn take_chunk(&mut self) -> Pointer<u8> {
        if self.chunks == self.max_chunks {
            return None;
        }

        self.chunks += 1;

        if self.last_deleted == 0 {
            let chunk = self.chunk_address(self.next_fresh);
            vmem::commit(chunk, self.chunk_size);
            self.next_fresh += 1;

            Some(chunk)
        } else {
            Some(self.revive_last_deleted())
        }
    }

    /// Returns a chunk to the arena. Any pointer into the chunk works, it is
    /// rounded down to the chunk boundary.
    ///
    /// # Safety
    ///
    /// `address` must point into a chunk previously returned by
    /// [`ChunkArena::take_chunk`] and not deleted since.
    pub unsafe fn delete_chunk(&mut self, address: NonNull<u8>) {
        let chunk = round_down_to(address.as_ptr() as usize, self.chunk_size);
        let index = (chunk - self.memory) >> self.chunk_size.trailing_zeros();

        (chunk as *mut usize).write(self.last_deleted);
        self.last_deleted = index + 1;
        self.chunks -= 1;
    }

    unsafe fn revive_last_deleted(&mut self) -> NonNull<u8> {
        let chunk = self.chunk_address(self.last_deleted - 1);

        // Deleted chunks stay committed, so the link is still readable.
        self.last_deleted = chunk.cast::<usize>().as_ptr().read();

        chunk
    }

    #[inline]
    unsafe fn chunk_address(&self, index: usize) -> NonNull<u8> {
        NonNull::new_unchecked((self.memory + index * self.chunk_size) as *mut u8)
    }
}
