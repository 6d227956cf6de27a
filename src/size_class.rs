//! Size class arithmetic. Every allocation lives in the layer whose block
//! size is the request rounded up to a power of two, and the layer of an
//! existing pointer falls out of plain integer division against the
//! reservation base. Both directions have to agree for every pointer the
//! allocator ever returns, there is no side table to fall back on.

use std::mem;

/// Machine word size in bytes. Free list metadata is stored as words written
/// straight into freed blocks, see [`crate::freelist`].
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// Returns `(block_size, layer_index)` for an allocation request of `size`
/// bytes. Requests below the minimum block size are padded up to it, so the
/// result is always a valid class. The caller must reject sizes above the
/// layer span before calling this.
#[inline]
pub(crate) fn class_of_request(size: usize, min_shift: u32) -> (usize, usize) {
    let block_size = size.max(1 << min_shift).next_power_of_two();
    let layer_index = (block_size.trailing_zeros() - min_shift) as usize;

    (block_size, layer_index)
}

/// Recovers the layer index of an allocated pointer from nothing but its
/// position inside the reservation. Layers are laid out back to back, each
/// `layer_span` bytes long, so the index is the distance from the base
/// divided by the span.
#[inline]
pub(crate) fn layer_of_address(address: usize, base: usize, layer_span: usize) -> usize {
    (address - base) / layer_span
}

/// Rounds `size` down to the nearest multiple of `to`. `to` must be a power
/// of two.
#[inline]
pub(crate) fn round_down_to(size: usize, to: usize) -> usize {
    size & !(to - 1)
}

/// Rounds `size` up to the nearest multiple of `to`. `to` must be a power
/// of two.
#[inline]
pub(crate) fn round_up_to(size: usize, to: usize) -> usize {
    (size + to - 1) & !(to - 1)
}
