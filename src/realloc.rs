use std::ptr::NonNull;

use crate::vmem;

/// This is used to carry reallocation metadata around the code as we don't
/// want to pass the same parameters over and over again. For the real
/// reallocation business, see [`crate::allocator`].
pub(crate) struct Realloc {
    /// Current user pointer, the block whose contents are moving.
    pub address: NonNull<u8>,
    /// Layer the current pointer lives in.
    pub old_layer: usize,
    /// Block size of the old layer.
    pub old_block_size: usize,
    /// Layer the destination block comes from.
    pub new_layer: usize,
    /// Block size of the new layer.
    pub new_block_size: usize,
}

/// How the contents travel from the old block to the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strategy {
    /// Commit the destination and copy the bytes over. Cheaper than a round
    /// trip through the kernel for small blocks.
    Copy,
    /// Ask the kernel to move the page mappings of the old block to the
    /// destination address. Constant time in the size of the allocation,
    /// which is the whole selling point of this allocator for big blocks.
    Remap,
}

impl Realloc {
    /// Picks the transfer strategy for this reallocation. Remapping only
    /// pays off once the destination block crosses `memcpy_threshold`, and
    /// only on hosts that can move a mapping without unmapping the source.
    /// The source must span whole pages of its own: mappings move with page
    /// granularity, and a sub page block shares its page with neighbors
    /// whose memory must stay put. Everything else copies.
    pub fn strategy(&self, memcpy_threshold: usize, page_size: usize) -> Strategy {
        if self.new_block_size < memcpy_threshold
            || self.old_block_size < page_size
            || !vmem::remap_supported()
        {
            Strategy::Copy
        } else {
            Strategy::Remap
        }
    }
}
