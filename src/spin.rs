use std::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-set mutual exclusion around the allocator state. Every public
/// operation runs under this lock, so the state behind it is only ever
/// touched by one thread at a time. The allocator must not call anything
/// that could allocate while holding its own lock, which rules out the
/// standard library mutexes and leaves us with a bare atomic flag: no
/// poisoning, no OS handles, nothing to initialize.
pub(crate) struct SpinLock<T> {
    /// `true` while some thread holds the lock.
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// The guard hands out exclusive access, so sharing the lock across threads is
// fine as long as the protected value can move between them.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Spins until the flag is acquired and returns a guard that releases it
    /// on drop. Contended waiters spin on a plain load so the flag's cache
    /// line isn't bounced around by failed exchanges.
    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }

        SpinGuard { lock: self }
    }
}

/// Scoped ownership of a [`SpinLock`]. Derefs to the protected value.
pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
