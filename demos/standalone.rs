use std::ptr::NonNull;

use valloc::Valloc;

fn print_alloc(size: usize, address: NonNull<u8>) {
    println!("Requested {size} bytes of memory");
    println!("Received this address: {address:?}");
}

fn main() {
    let valloc = Valloc::default();

    println!(
        "This machine has {} MiB of physical memory; the allocator reserves \
         35 TiB of address space and commits pages as blocks go live.",
        valloc::total_physical_memory() / (1024 * 1024)
    );

    unsafe {
        let addr1 = valloc.allocate(1).unwrap();
        print_alloc(1, addr1);

        let addr2 = valloc.allocate(1024).unwrap();
        print_alloc(1024, addr2);

        let addr3 = valloc.allocate(4096).unwrap();
        print_alloc(4096, addr3);

        // Same class as the first allocation, so the addresses sit in the
        // same layer of the reservation.
        let addr4 = valloc.allocate(64).unwrap();
        print_alloc(64, addr4);
        println!(
            "Distance between the two smallest allocations: {} bytes",
            addr4.as_ptr() as usize - addr1.as_ptr() as usize
        );

        println!("Growing the 1024 byte allocation to 32 MiB...");
        addr2.as_ptr().write_bytes(0xAB, 1024);
        let grown = valloc.reallocate(Some(addr2), 32 * 1024 * 1024).unwrap();
        println!(
            "Moved to {grown:?}, first byte still {:#x}",
            *grown.as_ptr()
        );

        println!("Deallocating everything...");
        valloc.free(addr1);
        valloc.free(grown);
        valloc.free(addr3);
        valloc.free(addr4);
    }
}
