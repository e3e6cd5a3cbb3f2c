//! Lightweight synchronization primitives for use in the allocator.
//!
//! We cannot use `std::sync::Mutex` because it allocates. Instead we provide
//! a test-and-set spinlock, a `SpinMutex<T>` wrapper, and the `WriterLock`
//! trait that monomorphizes the arena's owner-access discipline into the two
//! handler modes: thread-bound (ownership check, no atomics on release) and
//! shared (test-and-set).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "std")]
use core::sync::atomic::AtomicUsize;

/// A simple test-and-set spinlock.
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            // Spin while locked (read-only, doesn't invalidate cache line)
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// A mutex that uses a spinlock for synchronization.
/// Does not allocate and can be used in a `static`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(val),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

/// Owner-access discipline for an arena.
///
/// An arena's mutable state (partial lists, bump pointers, MPSC consumer
/// ends) may only be touched while the writer lock is held. The two
/// implementations monomorphize the arena into the two handler modes:
///
/// - [`ThreadBoundLock`]: the arena belongs to exactly one thread;
///   "acquiring" is an ownership check and releasing is a no-op.
/// - [`SharedLock`]: arenas are pooled; acquiring is a test-and-set.
pub trait WriterLock {
    /// Bind the lock to the calling context. Called once, when the arena is
    /// handed to its first user, before the arena is published.
    fn bind(&self);

    /// Non-blocking acquire. Returns true iff the caller now holds
    /// exclusive write access.
    fn try_acquire(&self) -> bool;

    /// Release write access. Must only be called after a successful
    /// `try_acquire`.
    fn release(&self);
}

/// Writer lock for shared-pool arenas: a plain test-and-set.
pub struct SharedLock {
    lock: SpinLock,
}

impl SharedLock {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
        }
    }
}

impl Default for SharedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterLock for SharedLock {
    #[inline]
    fn bind(&self) {}

    #[inline]
    fn try_acquire(&self) -> bool {
        self.lock.try_lock()
    }

    #[inline]
    fn release(&self) {
        self.lock.unlock();
    }
}

/// A stable identifier for the calling thread.
///
/// The address of a thread-local is unique among live threads, which is all
/// the ownership check needs: at most one live thread can match an arena's
/// bound id at a time. (An id may be reused after its thread exits; the new
/// thread then simply inherits uncontended owner access to a dead thread's
/// arena, which is sound for the same reason.)
#[cfg(feature = "std")]
#[inline]
pub fn current_thread_id() -> usize {
    std::thread_local! {
        static THREAD_MARKER: u8 = const { 0 };
    }
    THREAD_MARKER
        .try_with(|m| m as *const u8 as usize)
        .unwrap_or(usize::MAX)
}

/// Writer lock for thread-bound arenas: access is granted to the owning
/// thread only, with no atomic RMW on either path.
#[cfg(feature = "std")]
pub struct ThreadBoundLock {
    owner: AtomicUsize,
}

#[cfg(feature = "std")]
impl ThreadBoundLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
        }
    }
}

#[cfg(feature = "std")]
impl Default for ThreadBoundLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl WriterLock for ThreadBoundLock {
    #[inline]
    fn bind(&self) {
        self.owner.store(current_thread_id(), Ordering::Release);
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_id()
    }

    #[inline]
    fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use std::sync::Arc;

    #[test]
    fn spinlock_basic() {
        let lock = SpinLock::new();
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn spinlock_try() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn spinmutex_concurrent() {
        let mutex = Arc::new(SpinMutex::new(0u64));
        let num_threads = 8;
        let iterations = 10_000;

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let m = Arc::clone(&mutex);
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        let mut guard = m.lock();
                        *guard += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let guard = mutex.lock();
        assert_eq!(*guard, num_threads * iterations);
    }

    #[test]
    fn shared_lock_is_exclusive() {
        let lock = SharedLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn thread_bound_lock_rejects_foreign_threads() {
        let lock = Arc::new(ThreadBoundLock::new());
        lock.bind();
        assert!(lock.try_acquire());

        let foreign = Arc::clone(&lock);
        let held_elsewhere = std::thread::spawn(move || foreign.try_acquire())
            .join()
            .unwrap();
        assert!(!held_elsewhere);
    }

    #[test]
    fn thread_ids_are_distinct_across_live_threads() {
        let mine = current_thread_id();
        let theirs = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(mine, 0);
        assert_ne!(mine, theirs);
    }
}
