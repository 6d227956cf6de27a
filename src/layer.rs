use std::ptr::NonNull;

use crate::{freelist::FreeList, Pointer};

/// One size class of the allocator. A layer owns a fixed contiguous slice of
/// the reservation and hands out blocks of exactly one size from it, so a
/// block's address alone pins down its layer and therefore its size.
///
/// Blocks are handed out from two sources. The *bump index* walks forward
/// over block slots that have never been used; everything behind it has been
/// handed out at least once. Freed blocks go onto the layer's [`FreeList`]
/// and are reused before the bump index moves again, newest first:
///
/// ```text
/// layer base                                                    layer end
/// +--------+--------+--------+--------+--------+--------     --+
/// |  live  |  free  |  live  |  free  |  never used ...        |
/// +--------+--------+--------+--------+--------+--------     --+
///               ^                     ^
///               |                     |
///               +--- on the free list +--- bump index
/// ```
pub(crate) struct Layer {
    /// First address of this layer's slice of the reservation.
    base: usize,
    /// Block size of this size class, a power of two.
    block_size: usize,
    /// Total number of block slots that fit in the layer span.
    capacity: usize,
    /// Blocks handed out and not yet freed.
    live: usize,
    /// Index of the next never used block slot.
    bump: usize,
    /// Previously handed out blocks waiting to be reused.
    freed: FreeList,
}

impl Layer {
    /// Placeholder for building layer tables before initialization runs.
    pub const EMPTY: Self = Self {
        base: 0,
        block_size: 0,
        capacity: 0,
        live: 0,
        bump: 0,
        freed: FreeList::new(),
    };

    /// Gives the layer its geometry. Called once, when the owning allocator
    /// claims its reservation.
    pub fn init(&mut self, base: usize, block_size: usize, capacity: usize) {
        self.base = base;
        self.block_size = block_size;
        self.capacity = capacity;
        self.live = 0;
        self.bump = 0;
        self.freed = FreeList::new();
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently handed out from this layer.
    #[cfg(test)]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Hands out a block address, reusing the most recently freed block if
    /// there is one and bumping into never used territory otherwise. Returns
    /// `None` only when every slot of the layer is live at once. The caller
    /// is responsible for committing the pages covering the block, this
    /// function never touches the block's memory on the bump path.
    ///
    /// # Safety
    ///
    /// The layer must be initialized and `page_size` must be the real page
    /// size cached by the owning allocator.
    pub unsafe fn take_spot(&mut self, page_size: usize) -> Pointer<u8> {
        let spot = match self.freed.pop(self.block_size, page_size) {
            Some(reused) => reused,
            None => {
                if self.bump == self.capacity {
                    return None;
                }

                let address = self.base + self.bump * self.block_size;
                self.bump += 1;

                NonNull::new_unchecked(address as *mut u8)
            }
        };

        self.live += 1;

        Some(spot)
    }

    /// Returns a block to the layer's free list.
    ///
    /// # Safety
    ///
    /// `spot` must be a live block previously handed out by this layer.
    /// Anything else is undefined, there is no metadata left to detect a
    /// foreign or doubly freed pointer with.
    pub unsafe fn release_spot(&mut self, spot: NonNull<u8>, page_size: usize) {
        self.freed.push(spot, self.block_size, page_size);
        self.live -= 1;
    }
}
