use valloc::Valloc;

// NOTE: This demo doesn't work with Miri because the virtual memory layer is
// mocked with `std::alloc::alloc` under Miri. If we are the global allocator
// there are two problems:
//
// 1. We cannot do FFI calls when using Miri, so no `mmap`. That's why the
// mock exists at all.
//
// 2. The allocator acquires its spin lock on every operation. Whenever
// somebody calls `alloc` on us (for example `Box`), the calling thread takes
// the lock, and if claiming the reservation then goes through
// `std::alloc::alloc`, WE are the allocator, so we'd try to take the lock
// again. It turns out that we cannot simulate ourselves within ourselves :(

#[global_allocator]
static ALLOCATOR: Valloc = Valloc::with_default_config();

fn main() {
    let num = Box::new(10);
    println!("Boxed num {num} at {:?}", &*num as *const usize);

    let mut vec = Vec::with_capacity(*num);

    for i in 0..*num {
        vec.push(i);
    }

    println!("Vec: {vec:?} at {:?}", vec.as_ptr());

    let handle = std::thread::spawn(|| {
        let mut vec: Vec<u8> = Vec::with_capacity(256);
        vec.push(5);
        vec.push(6);
        println!("Second thread Vec: {vec:?} at {:?}", vec.as_ptr());
    });

    handle.join().unwrap();

    // Growing a Vec far enough makes the reallocations move page mappings
    // instead of copying, completely transparently.
    let cap = 64 * 1024 * 1024;
    let mut vec: Vec<u8> = Vec::with_capacity(1);
    for i in 0..cap {
        vec.push(i as u8);
    }

    println!("Large allocation of {cap} bytes ended up at {:?}", vec.as_ptr());
}
