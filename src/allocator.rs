use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{
    layer::Layer,
    realloc::{Realloc, Strategy},
    size_class::{self, round_down_to, round_up_to, WORD_SIZE},
    spin::SpinLock,
    vmem, Pointer,
};

/// Default number of layers, one per size class.
pub(crate) const DEFAULT_LAYER_COUNT: usize = 35;

/// log2 of the default minimum block size, 64 bytes.
pub(crate) const DEFAULT_MIN_SHIFT: u32 = 6;

/// Default destination block size at which reallocation switches from
/// copying bytes to remapping pages, 8 MiB. Remapping is constant time but
/// each call is a trip through the kernel, so small blocks are faster to
/// copy. Profile your workload if you want the optimal value; it must stay
/// above the page size.
pub(crate) const DEFAULT_MEMCPY_THRESHOLD: usize = 1 << 23;

// These numbers are calculated, do not change them independently.
const _: () = assert!((1 << DEFAULT_MIN_SHIFT) >= WORD_SIZE);
const _: () = assert!(DEFAULT_MIN_SHIFT + DEFAULT_LAYER_COUNT as u32 <= usize::BITS);
const _: () = assert!(DEFAULT_MEMCPY_THRESHOLD.is_power_of_two());
// No mainstream system has pages this big.
const _: () = assert!(DEFAULT_MEMCPY_THRESHOLD >= 1 << 16);

/// The allocator state proper: one giant reservation cut into `L` layers.
/// Once you've read [`crate::vmem`], [`crate::size_class`],
/// [`crate::freelist`] and [`crate::layer`], this is where the circle gets
/// completed:
///
/// ```text
///            reservation (L * span bytes of address space, no backing)
/// +----------------+----------------+--------------------+----------------+
/// |    layer 0     |    layer 1     |        ...         |   layer L-1    |
/// |  2^s blocks    | 2^(s+1) blocks |                    |  one block of  |
/// |  of 64 B       | of 128 B       |                    |  span bytes    |
/// +----------------+----------------+--------------------+----------------+
/// ^
/// |
/// base
/// ```
///
/// Every layer is `span = 2^(min_shift + L - 1)` bytes wide, so the whole
/// reservation is `L * span` bytes, 35 TiB with the default geometry. None
/// of it is backed by physical memory until a block is handed out and its
/// pages are committed. An allocation's layer (and with it the block size)
/// is recovered from the pointer alone by dividing its offset from `base`
/// by the span.
///
/// This struct is not thread safe and needs mutable borrows to operate, so
/// it is wrapped in a [`SpinLock`]. See [`Valloc`] for the public API.
struct LayeredAllocator<const L: usize> {
    /// log2 of the smallest block size.
    min_shift: u32,
    /// Reallocation strategy switch point, see [`Realloc::strategy`].
    memcpy_threshold: usize,
    /// Whether initialization already ran. It runs at most once, even if it
    /// fails; a failed reservation leaves the allocator permanently dead
    /// rather than hammering the kernel on every call.
    init_attempted: bool,
    /// First address of the reservation, or 0 before initialization.
    base: usize,
    /// Virtual memory page size, cached at initialization.
    page_size: usize,
    /// One descriptor per size class.
    layers: [Layer; L],
}

// Raw block addresses keep this from being auto Send, but every access goes
// through the lock in `Valloc`.
unsafe impl<const L: usize> Send for LayeredAllocator<L> {}

impl<const L: usize> LayeredAllocator<L> {
    const fn new(min_shift: u32, memcpy_threshold: usize) -> Self {
        Self {
            min_shift,
            memcpy_threshold,
            init_attempted: false,
            base: 0,
            page_size: 0,
            layers: [Layer::EMPTY; L],
        }
    }

    /// Span of a single layer in bytes. Also the largest block size this
    /// allocator can hand out.
    #[inline]
    fn layer_span(&self) -> usize {
        1 << (self.min_shift as usize + L - 1)
    }

    #[inline]
    fn reservation_size(&self) -> usize {
        L * self.layer_span()
    }

    #[inline]
    fn is_ready(&self) -> bool {
        self.base != 0
    }

    /// Lazy one-shot initialization: claims the reservation, caches the page
    /// size and derives every layer's geometry. Runs under the caller's lock,
    /// so checking the flag and flipping it is race free.
    unsafe fn init_once(&mut self) -> bool {
        if self.init_attempted {
            return self.is_ready();
        }

        self.init_attempted = true;

        let Some(base) = vmem::reserve(self.reservation_size()) else {
            return false;
        };

        self.base = base.as_ptr() as usize;
        self.page_size = vmem::page_size();

        let span = self.layer_span();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            // Each layer's block size is twice the one below it.
            let block_size = 1usize << (self.min_shift as usize + i);
            layer.init(self.base + i * span, block_size, span / block_size);
        }

        true
    }

    /// Returns an address where `size` bytes can be safely written, or `None`
    /// when the request exceeds the largest class, the layer is exhausted or
    /// the reservation could never be claimed.
    unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        if !self.init_once() || size > self.layer_span() {
            return None;
        }

        let (block_size, layer_index) = size_class::class_of_request(size, self.min_shift);

        let spot = self.layers[layer_index].take_spot(self.page_size)?;
        self.commit_block(spot, block_size);

        Some(spot)
    }

    /// Moves the allocation at `address` into the class that fits `size` and
    /// frees the old block. The old contents are preserved up to the smaller
    /// of the two block sizes.
    unsafe fn reallocate(&mut self, address: NonNull<u8>, size: usize) -> Pointer<u8> {
        if !self.is_ready() || size > self.layer_span() {
            return None;
        }

        let old_layer = self.layer_of(address);
        let (new_block_size, new_layer) = size_class::class_of_request(size, self.min_shift);

        let realloc = Realloc {
            address,
            old_layer,
            old_block_size: self.layers[old_layer].block_size(),
            new_layer,
            new_block_size,
        };

        let destination = self.layers[realloc.new_layer].take_spot(self.page_size)?;

        self.transfer(&realloc, destination);
        self.layers[realloc.old_layer].release_spot(address, self.page_size);

        Some(destination)
    }

    /// Returns the block at `address` to its layer's free list.
    unsafe fn free(&mut self, address: NonNull<u8>) {
        if !self.is_ready() {
            return;
        }

        let layer = self.layer_of(address);
        self.layers[layer].release_spot(address, self.page_size);
    }

    /// Recovers the layer index of an allocated pointer, see
    /// [`size_class::layer_of_address`].
    #[inline]
    unsafe fn layer_of(&self, address: NonNull<u8>) -> usize {
        size_class::layer_of_address(address.as_ptr() as usize, self.base, self.layer_span())
    }

    /// Commits the pages covering `[spot, spot + block_size)` read-write.
    /// Blocks smaller than a page share their page with neighbors, so the
    /// range is widened outward to page boundaries; committing a page twice
    /// is a no-op, which makes the sharing safe.
    unsafe fn commit_block(&self, spot: NonNull<u8>, block_size: usize) {
        let start = round_down_to(spot.as_ptr() as usize, self.page_size);
        let length = round_up_to(block_size, self.page_size);

        vmem::commit(NonNull::new_unchecked(start as *mut u8), length);
    }

    /// Carries the contents of the old block over to `destination` using the
    /// strategy picked for this reallocation.
    unsafe fn transfer(&self, realloc: &Realloc, destination: NonNull<u8>) {
        match realloc.strategy(self.memcpy_threshold, self.page_size) {
            Strategy::Copy => self.transfer_by_copy(realloc, destination),
            Strategy::Remap => {
                if !vmem::remap(realloc.address, realloc.old_block_size, destination) {
                    // The kernel refused the move (too old to know the
                    // don't-unmap flag, or the source spans several
                    // mappings). Nothing has happened yet, so copying still
                    // works.
                    self.transfer_by_copy(realloc, destination);
                    return;
                }

                // The move carried `old_block_size` bytes of mapping to the
                // destination. Whatever the new class adds beyond that has
                // never been committed.
                if realloc.new_block_size > realloc.old_block_size {
                    let rest = NonNull::new_unchecked(
                        destination.as_ptr().add(realloc.old_block_size),
                    );
                    vmem::commit(rest, realloc.new_block_size - realloc.old_block_size);
                }

                // The vacated source must stay writable: the free that
                // follows will store free list metadata in its first page.
                vmem::commit(realloc.address, self.page_size);
            }
        }
    }

    /// Copy strategy. Always copies `old_block_size` bytes: everything past
    /// the old block is garbage to the caller and everything inside it may
    /// be live data, so the old block size is exactly the amount that has to
    /// travel. The commit is widened to cover the copy even when the new
    /// block is smaller than the old one.
    unsafe fn transfer_by_copy(&self, realloc: &Realloc, destination: NonNull<u8>) {
        let extent = realloc.old_block_size.max(realloc.new_block_size);

        let start = round_down_to(destination.as_ptr() as usize, self.page_size);
        let end = round_up_to(destination.as_ptr() as usize + extent, self.page_size);
        vmem::commit(NonNull::new_unchecked(start as *mut u8), end - start);

        ptr::copy_nonoverlapping(
            realloc.address.as_ptr(),
            destination.as_ptr(),
            realloc.old_block_size,
        );
    }

    /// Only used for testing.
    #[cfg(test)]
    fn live_blocks(&self) -> usize {
        self.layers.iter().map(Layer::live).sum()
    }
}

impl<const L: usize> Drop for LayeredAllocator<L> {
    fn drop(&mut self) {
        if self.is_ready() {
            unsafe {
                vmem::release(
                    NonNull::new_unchecked(self.base as *mut u8),
                    self.reservation_size(),
                );
            }
        }
    }
}

/// This struct exposes the public interface. Three operations form the
/// contract, mirroring the classical malloc / realloc / free triad:
/// [`Valloc::allocate`], [`Valloc::reallocate`] and [`Valloc::free`].
///
/// Each instance owns its own reservation, claimed lazily on first use and
/// returned when the instance drops. The number of layers is a compile time
/// parameter; with the default 35 layers and 64 byte minimum blocks the
/// reservation spans 35 TiB of address space (of which only the pages of
/// live blocks ever consume physical memory) and the largest possible
/// allocation is 1 TiB.
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// use valloc::Valloc;
///
/// let valloc = Valloc::default();
///
/// unsafe {
///     let address = valloc.allocate(100).unwrap();
///
///     // Blocks are aligned to their size class, 128 bytes here.
///     assert_eq!(address.as_ptr() as usize % 128, 0);
///     address.as_ptr().write_bytes(0xAB, 100);
///
///     // Growing far enough moves page mappings instead of bytes, but the
///     // contents survive either way.
///     let grown = valloc.reallocate(Some(address), 1024).unwrap();
///     assert_eq!(*grown.as_ptr(), 0xAB);
///
///     valloc.free(grown);
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use valloc::Valloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Valloc = Valloc::with_default_config();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
pub struct Valloc<const L: usize = 35> {
    /// Every public operation serializes on this one lock. Per layer locks
    /// would be the obvious refinement, but a reallocation touches two
    /// layers at once and the free list nodes are much simpler to reason
    /// about under a single total order of operations.
    inner: SpinLock<LayeredAllocator<L>>,
}

impl Valloc {
    /// Default configuration: 35 layers, 64 byte minimum blocks, 8 MiB
    /// remap threshold. Usable in statics, see the type level docs.
    pub const fn with_default_config() -> Self {
        Self {
            inner: SpinLock::new(LayeredAllocator::new(
                DEFAULT_MIN_SHIFT,
                DEFAULT_MEMCPY_THRESHOLD,
            )),
        }
    }
}

impl<const L: usize> Valloc<L> {
    /// Builds an allocator with a custom geometry. `min_shift` is the log2
    /// of the smallest block size and `L` the number of doublings on top of
    /// it, so the layer span becomes `2^(min_shift + L - 1)` bytes and the
    /// reservation `L` times that. `memcpy_threshold` is the destination
    /// block size at which reallocation switches from copying to remapping;
    /// it must be larger than the page size.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use valloc::Valloc;
    ///
    /// // 19 layers of 16 MiB each: a 304 MiB reservation, handy when you
    /// // don't need terabyte blocks.
    /// let valloc = Valloc::<19>::with_config(6, 1 << 23);
    ///
    /// let address = valloc.allocate(1 << 20).unwrap();
    /// assert_eq!(valloc.max_block_size(), 1 << 24);
    /// unsafe { valloc.free(address) };
    /// ```
    pub const fn with_config(min_shift: u32, memcpy_threshold: usize) -> Self {
        Self {
            inner: SpinLock::new(LayeredAllocator::new(min_shift, memcpy_threshold)),
        }
    }

    /// Allocates a block that can hold at least `size` bytes, rounded up to
    /// the nearest power of two class. The returned address is aligned to
    /// its block size or the page size, whichever is smaller (the
    /// reservation base is only page aligned, so classes above the page
    /// size cannot promise more). Returns `None` if `size` exceeds
    /// [`Valloc::max_block_size`], if the class ran out of blocks, or if
    /// the address space reservation failed at first use.
    pub fn allocate(&self, size: usize) -> Pointer<u8> {
        unsafe { self.inner.lock().allocate(size) }
    }

    /// Grows or shrinks an allocation to `size` bytes, preserving contents
    /// up to the smaller of the old and new sizes. With `None` as address
    /// this behaves exactly like [`Valloc::allocate`]. On failure the old
    /// allocation is left untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// `address` must be `None` or a live pointer previously returned by
    /// this instance. The old pointer is invalid after a successful call.
    pub unsafe fn reallocate(&self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        match address {
            None => self.allocate(size),
            Some(address) => self.inner.lock().reallocate(address, size),
        }
    }

    /// Frees an allocation. The block is recycled to later allocations of
    /// the same class, most recently freed first.
    ///
    /// # Safety
    ///
    /// `address` must be a live pointer previously returned by this
    /// instance. Double frees and foreign pointers are undefined.
    pub unsafe fn free(&self, address: NonNull<u8>) {
        self.inner.lock().free(address)
    }

    /// Largest single allocation this geometry can satisfy, which equals
    /// the span of one layer.
    pub fn max_block_size(&self) -> usize {
        self.inner.lock().layer_span()
    }

    /// Only used for testing.
    #[cfg(test)]
    pub(crate) fn live_blocks(&self) -> usize {
        self.inner.lock().live_blocks()
    }

    /// Only used for testing.
    #[cfg(test)]
    pub(crate) fn layer_of(&self, address: NonNull<u8>) -> usize {
        unsafe { self.inner.lock().layer_of(address) }
    }

    /// Only used for testing.
    #[cfg(test)]
    pub(crate) fn reservation_bounds(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.base, inner.reservation_size())
    }
}

impl Default for Valloc {
    fn default() -> Self {
        Valloc::with_default_config()
    }
}

unsafe impl<const L: usize> GlobalAlloc for Valloc<L> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Blocks are aligned to their class size relative to the start of
        // their layer, but the reservation base itself is only page aligned,
        // so the absolute guarantee tops out at the page size. Requesting at
        // least `align` bytes makes the class large enough to provide
        // everything up to that; bigger alignments are refused rather than
        // silently violated.
        if layout.align() > vmem::page_size() {
            return ptr::null_mut();
        }

        match self.allocate(layout.size().max(layout.align())) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(NonNull::new_unchecked(ptr));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > vmem::page_size() {
            return ptr::null_mut();
        }

        match self.reallocate(NonNull::new(ptr), new_size.max(layout.align())) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{slice, thread};

    use super::*;

    /// Small geometry for tests: 19 layers of 16 MiB each, 304 MiB of
    /// address space per instance. Deep enough to reach the remap threshold
    /// while letting many instances coexist in one test process.
    fn compact() -> Valloc<19> {
        Valloc::<19>::with_config(6, DEFAULT_MEMCPY_THRESHOLD)
    }

    #[test]
    fn free_then_allocate_returns_the_same_address() {
        let valloc = compact();

        unsafe {
            let first = valloc.allocate(100).unwrap();
            valloc.free(first);

            let second = valloc.allocate(100).unwrap();
            assert_eq!(first, second);

            valloc.free(second);
        }
    }

    #[test]
    fn same_class_reuse_is_lifo() {
        let valloc = compact();

        unsafe {
            let p1 = valloc.allocate(100).unwrap();
            let p2 = valloc.allocate(100).unwrap();

            valloc.free(p1);

            // p1 was the most recent free, so it comes back first.
            let p3 = valloc.allocate(100).unwrap();
            assert_eq!(p3, p1);

            valloc.free(p2);
            valloc.free(p3);

            // Now the order is reversed: p3 went last.
            assert_eq!(valloc.allocate(100).unwrap(), p3);
            assert_eq!(valloc.allocate(100).unwrap(), p2);
        }
    }

    #[test]
    fn repeated_allocate_free_is_idempotent() {
        let valloc = compact();

        unsafe {
            let expected = valloc.allocate(4096).unwrap();
            valloc.free(expected);

            for _ in 0..10 {
                let address = valloc.allocate(4096).unwrap();
                assert_eq!(address, expected);
                valloc.free(address);
            }
        }
    }

    #[test]
    fn growing_below_the_threshold_copies_contents() {
        let valloc = compact();

        unsafe {
            let small = valloc.allocate(64).unwrap();
            small.as_ptr().write_bytes(0xAB, 64);

            let grown = valloc.reallocate(Some(small), 128).unwrap();

            let contents = slice::from_raw_parts(grown.as_ptr(), 64);
            assert!(contents.iter().all(|byte| *byte == 0xAB));

            // One class up, and the old address is free again.
            assert_eq!(valloc.layer_of(grown), valloc.layer_of(small) + 1);
            assert_eq!(valloc.allocate(64).unwrap(), small);

            valloc.free(grown);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)] // writes megabytes of pattern, too slow interpreted
    fn growing_past_the_threshold_preserves_contents() {
        let valloc = compact();
        let old_size = 1 << 23;

        unsafe {
            let address = valloc.allocate(old_size).unwrap();

            // Checkerboard over the whole block, word by word.
            let words = address.cast::<usize>().as_ptr();
            for i in 0..old_size / WORD_SIZE {
                *words.add(i) = if i % 2 == 0 { 0xAA55AA55AA55AA55 } else { 0x55AA55AA55AA55AA };
            }

            let grown = valloc.reallocate(Some(address), 1 << 24).unwrap();
            assert!(valloc.layer_of(grown) > valloc.layer_of(address));

            let words = grown.cast::<usize>().as_ptr();
            for i in 0..old_size / WORD_SIZE {
                let expected = if i % 2 == 0 { 0xAA55AA55AA55AA55 } else { 0x55AA55AA55AA55AA };
                assert_eq!(*words.add(i), expected);
            }

            // The grown block must be writable end to end.
            grown.as_ptr().write_bytes(0x42, 1 << 24);

            valloc.free(grown);
        }
    }

    #[test]
    fn shrinking_within_a_class_moves_the_block_and_keeps_contents() {
        let valloc = compact();

        unsafe {
            let address = valloc.allocate(120).unwrap();
            address.as_ptr().write_bytes(0xC3, 120);

            // 70 rounds up to the same 128 byte class, but the block still
            // moves and the old one is freed.
            let shrunk = valloc.reallocate(Some(address), 70).unwrap();

            assert_ne!(shrunk, address);
            assert_eq!(valloc.layer_of(shrunk), valloc.layer_of(address));

            let contents = slice::from_raw_parts(shrunk.as_ptr(), 70);
            assert!(contents.iter().all(|byte| *byte == 0xC3));

            let reclaimed = valloc.allocate(120).unwrap();
            assert_eq!(reclaimed, address);

            valloc.free(reclaimed);
            valloc.free(shrunk);
            assert_eq!(valloc.live_blocks(), 0);
        }
    }

    #[test]
    fn shrinking_to_a_smaller_class_preserves_the_prefix() {
        let valloc = compact();

        unsafe {
            let big = valloc.allocate(8192).unwrap();
            big.as_ptr().write_bytes(0xCD, 8192);

            // Down from the 8 KiB class to the 128 byte class. The copy
            // carries the whole old block, spilling past the destination
            // into never used slots of the smaller class, and the widened
            // commit keeps the spill inside committed pages.
            let shrunk = valloc.reallocate(Some(big), 100).unwrap();

            assert!(valloc.layer_of(shrunk) < valloc.layer_of(big));

            let contents = slice::from_raw_parts(shrunk.as_ptr(), 100);
            assert!(contents.iter().all(|byte| *byte == 0xCD));

            // The big block went back to its layer's free list.
            assert_eq!(valloc.allocate(8192), Some(big));

            valloc.free(big);
            valloc.free(shrunk);
            assert_eq!(valloc.live_blocks(), 0);
        }
    }

    #[test]
    fn reallocate_without_address_allocates() {
        let valloc = compact();

        unsafe {
            let address = valloc.reallocate(None, 100).unwrap();
            let (base, size) = valloc.reservation_bounds();

            let addr = address.as_ptr() as usize;
            assert!(base <= addr && addr < base + size);

            valloc.free(address);
        }
    }

    #[test]
    fn zero_sized_requests_use_the_smallest_class() {
        let valloc = compact();

        unsafe {
            let address = valloc.allocate(0).unwrap();

            assert_eq!(valloc.layer_of(address), 0);
            assert_eq!(address.as_ptr() as usize % 64, 0);

            // Freeing it must leave the allocator consistent.
            valloc.free(address);
            assert_eq!(valloc.allocate(0).unwrap(), address);
            valloc.free(address);
        }
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let valloc = compact();
        let max = valloc.max_block_size();

        unsafe {
            assert_eq!(valloc.allocate(max + 1), None);

            // The top layer holds exactly one block of the maximum size.
            let whole = valloc.allocate(max).unwrap();
            assert_eq!(valloc.allocate(max), None);

            // Reallocating out of range fails and leaves the block alone.
            assert_eq!(valloc.reallocate(Some(whole), max + 1), None);

            // Failure must not have corrupted anything.
            valloc.free(whole);
            assert_eq!(valloc.allocate(max), Some(whole));
            valloc.free(whole);
        }
    }

    #[test]
    fn packed_free_list_rolls_over_into_a_new_node() {
        let valloc = compact();
        let page = unsafe { vmem::page_size() };

        // One more free than a single node can record, so the last free has
        // to promote a fresh node.
        let count = page / WORD_SIZE - 1;

        unsafe {
            let blocks: Vec<_> = (0..count)
                .map(|_| valloc.allocate(page).unwrap())
                .collect();

            for block in &blocks {
                valloc.free(*block);
            }

            // Popping everything back must replay the frees in reverse,
            // across the node boundary, and end with both node pages
            // decommitted and reusable.
            for block in blocks.iter().rev() {
                assert_eq!(valloc.allocate(page), Some(*block));
            }

            assert_eq!(valloc.live_blocks(), count);

            for block in &blocks {
                valloc.free(*block);
            }
            assert_eq!(valloc.live_blocks(), 0);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)] // the mock backs the reservation with real memory
    fn default_geometry_smoke() {
        let valloc = Valloc::with_default_config();
        assert_eq!(valloc.max_block_size(), 1 << 40);

        unsafe {
            let address = valloc.allocate(100).unwrap();
            address.as_ptr().write_bytes(0x77, 100);

            let grown = valloc.reallocate(Some(address), 1 << 13).unwrap();
            assert_eq!(*grown.as_ptr().add(99), 0x77);

            valloc.free(grown);
            assert_eq!(valloc.live_blocks(), 0);
        }
    }

    #[test]
    fn global_alloc_respects_alignment() {
        let valloc = compact();

        unsafe {
            let layout = Layout::from_size_align(10, 4096).unwrap();
            let address = GlobalAlloc::alloc(&valloc, layout);

            assert!(!address.is_null());
            assert_eq!(address as usize % 4096, 0);

            GlobalAlloc::dealloc(&valloc, address, layout);

            // The reservation base is only page aligned, so alignments
            // above the page size cannot be honored and must be refused,
            // not silently violated.
            let page = vmem::page_size();
            let over_aligned = Layout::from_size_align(10, 2 * page).unwrap();
            assert!(GlobalAlloc::alloc(&valloc, over_aligned).is_null());
        }
    }

    /// Every thread hammers a shared instance with a mix of operations and
    /// cleans up after itself; the live block count must come back to zero.
    #[test]
    fn multiple_threads_mixed_operations() {
        let valloc = compact();

        let num_threads: usize = 8;
        let iterations: usize = if cfg!(miri) { 10 } else { 250 };

        thread::scope(|scope| {
            for t in 0..num_threads {
                let valloc = &valloc;
                scope.spawn(move || unsafe {
                    let sizes = [16, 100, 1024, 4096, 16384];

                    for i in 0..iterations {
                        let size = sizes[(t + i) % sizes.len()];

                        let address = valloc.allocate(size).unwrap();
                        address.as_ptr().write_bytes(t as u8, size);

                        let grown = valloc.reallocate(Some(address), size * 2).unwrap();

                        // Our bytes survived the move and nobody else's
                        // writes leaked into our block.
                        let contents = slice::from_raw_parts(grown.as_ptr(), size);
                        assert!(contents.iter().all(|byte| *byte == t as u8));

                        valloc.free(grown);
                    }
                });
            }
        });

        assert_eq!(valloc.live_blocks(), 0);
    }
}
