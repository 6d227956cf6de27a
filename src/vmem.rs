use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::Pointer;

/// Abstraction for platform specific virtual memory handling. The allocator
/// never maps backed memory directly. It reserves a huge range of addresses
/// once, then commits, decommits and remaps page runs inside that range, and
/// it doesn't care about the APIs offered by the underlying kernel or
/// libraries.
trait VirtualMemory {
    /// Reserves `length` bytes of contiguous address space with no backing
    /// storage and no access permissions. Touching the range before
    /// committing it faults.
    unsafe fn reserve(length: usize) -> Pointer<u8>;

    /// Returns a reserved range to the kernel. `address` must be a value
    /// previously returned by [`VirtualMemory::reserve`] and `length` the
    /// exact length it was reserved with.
    unsafe fn release(address: NonNull<u8>, length: usize);

    /// Grants read/write access to `length` bytes at `address`, assigning
    /// backing storage on first touch. `address` must be page aligned and
    /// inside a reserved range. Committing an already committed range is a
    /// no-op, committing a decommitted range revives it.
    unsafe fn commit(address: NonNull<u8>, length: usize);

    /// Releases the backing storage of `length` bytes at `address` and
    /// revokes all access, keeping the reservation itself intact. The
    /// addresses stay ours, the physical pages go back to the kernel.
    unsafe fn decommit(address: NonNull<u8>, length: usize);

    /// Moves the committed mapping `[src, src + length)` so that it becomes
    /// visible at `dst` instead, without unmapping `src`. The source range
    /// stays reserved (and on Linux stays accessible as fresh zero pages),
    /// which matters because the caller is about to recycle that address.
    /// Returns `false` if the kernel refuses, in which case nothing moved.
    unsafe fn remap(src: NonNull<u8>, length: usize, dst: NonNull<u8>) -> bool;

    /// Whether [`VirtualMemory::remap`] can succeed at all on this platform.
    fn remap_supported() -> bool;

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;

    /// Total physical memory installed on the machine, in bytes.
    unsafe fn total_memory() -> usize;
}

/// Zero sized type that implements [`VirtualMemory`] for each OS.
pub(crate) struct Platform;

/// Convinience wrapper for [`VirtualMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    Platform::reserve(length)
}

/// Convinience wrapper for [`VirtualMemory::release`].
#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    Platform::release(address, length)
}

/// Convinience wrapper for [`VirtualMemory::commit`].
#[inline]
pub(crate) unsafe fn commit(address: NonNull<u8>, length: usize) {
    Platform::commit(address, length)
}

/// Convinience wrapper for [`VirtualMemory::decommit`].
#[inline]
pub(crate) unsafe fn decommit(address: NonNull<u8>, length: usize) {
    Platform::decommit(address, length)
}

/// Convinience wrapper for [`VirtualMemory::remap`].
#[inline]
pub(crate) unsafe fn remap(src: NonNull<u8>, length: usize, dst: NonNull<u8>) -> bool {
    Platform::remap(src, length, dst)
}

/// Convinience wrapper for [`VirtualMemory::remap_supported`].
#[inline]
pub(crate) fn remap_supported() -> bool {
    Platform::remap_supported()
}

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Cached [`VirtualMemory::page_size`]. The first call asks the OS, every
/// later call reuses the answer; callers outside the allocator lock may race
/// here, which is fine because they all store the same value.
#[inline]
pub(crate) unsafe fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page = Platform::page_size();
            PAGE_SIZE.store(page, Ordering::Relaxed);
            page
        }
        page => page,
    }
}

/// Convinience wrapper for [`VirtualMemory::total_memory`].
#[inline]
pub(crate) unsafe fn total_memory() -> usize {
    Platform::total_memory()
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use super::{Platform, VirtualMemory};
    use crate::Pointer;

    impl VirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // No protection at all: the reservation only claims addresses,
            // backing storage arrives later through `commit`. A PROT_NONE
            // mapping doesn't count against overcommit limits, which is what
            // makes a 35 TiB reservation reasonable.
            let protection = libc::PROT_NONE;

            // Memory should be private to our process and not mapped to any
            // file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // TODO: What should we do here? Panic? The reservation is
                // still valid at this point, it wasn't unmapped.
            }
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) {
            // Flipping the protection to read-write is all it takes, the
            // kernel faults zero pages in on first touch.
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            libc::mprotect(address.cast().as_ptr(), length, protection);
        }

        unsafe fn decommit(address: NonNull<u8>, length: usize) {
            // MADV_DONTNEED drops the physical pages, PROT_NONE makes sure
            // nobody keeps poking at the now empty range through a stale
            // pointer without faulting.
            libc::madvise(address.cast().as_ptr(), length, libc::MADV_DONTNEED);
            libc::mprotect(address.cast().as_ptr(), length, libc::PROT_NONE);
        }

        #[cfg(target_os = "linux")]
        unsafe fn remap(src: NonNull<u8>, length: usize, dst: NonNull<u8>) -> bool {
            // MREMAP_DONTUNMAP (Linux 5.7 and later) keeps the source range
            // mapped after the move. The kernel rejects the call for ranges
            // that aren't page aligned or span several mappings, so a failed
            // return here simply means the caller has to copy instead.
            let flags = libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED | libc::MREMAP_DONTUNMAP;

            let moved = libc::mremap(
                src.cast().as_ptr(),
                length,
                length,
                flags,
                dst.cast::<libc::c_void>().as_ptr(),
            );

            moved == dst.cast().as_ptr()
        }

        #[cfg(not(target_os = "linux"))]
        unsafe fn remap(_src: NonNull<u8>, _length: usize, _dst: NonNull<u8>) -> bool {
            false
        }

        fn remap_supported() -> bool {
            cfg!(target_os = "linux")
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }

        unsafe fn total_memory() -> usize {
            let pages = libc::sysconf(libc::_SC_PHYS_PAGES) as usize;
            pages * Self::page_size()
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, VirtualMemory};
    use crate::Pointer;

    impl VirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Reservation and commit are distinct steps on Windows already,
            // so this maps onto VirtualAlloc almost word for word.
            let address =
                Memory::VirtualAlloc(None, length, Memory::MEM_RESERVE, Memory::PAGE_NOACCESS);

            NonNull::new(address.cast())
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // MEM_RELEASE requires a length of zero and frees the whole
            // reservation made at this base address.
            let address = address.cast().as_ptr();

            if !Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).as_bool() {
                // TODO: Release failed, don't know what to do here yet. Same
                // problem as munmap on Unix.
            }
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) {
            Memory::VirtualAlloc(
                Some(address.as_ptr() as *const _),
                length,
                Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );
        }

        unsafe fn decommit(address: NonNull<u8>, length: usize) {
            // Decommitted pages keep their reservation and fault on access,
            // no separate protection step needed.
            Memory::VirtualFree(address.cast().as_ptr(), length, Memory::MEM_DECOMMIT);
        }

        unsafe fn remap(_src: NonNull<u8>, _length: usize, _dst: NonNull<u8>) -> bool {
            // There is no documented way to move a private committed region
            // to a chosen address without unmapping the source.
            false
        }

        fn remap_supported() -> bool {
            false
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }

        unsafe fn total_memory() -> usize {
            let mut status = SystemInformation::MEMORYSTATUSEX {
                dwLength: std::mem::size_of::<SystemInformation::MEMORYSTATUSEX>() as u32,
                ..Default::default()
            };

            SystemInformation::GlobalMemoryStatusEx(&mut status);

            status.ullTotalPhys as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we use the global allocator to mock
    //! low level memory management. Protection isn't modeled, but decommit
    //! zeroes the range so that reuse after a decommit behaves like a fresh
    //! fault on Linux. Only sensible with small reservation geometries.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, VirtualMemory};
    use crate::Pointer;

    const MOCK_PAGE_SIZE: usize = 4096;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, MOCK_PAGE_SIZE).unwrap()
    }

    impl VirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) {}

        unsafe fn decommit(address: NonNull<u8>, length: usize) {
            address.as_ptr().write_bytes(0, length);
        }

        unsafe fn remap(_src: NonNull<u8>, _length: usize, _dst: NonNull<u8>) -> bool {
            false
        }

        fn remap_supported() -> bool {
            false
        }

        unsafe fn page_size() -> usize {
            MOCK_PAGE_SIZE
        }

        unsafe fn total_memory() -> usize {
            1 << 30
        }
    }
}
