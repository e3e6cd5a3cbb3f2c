//! Thread→arena binding.
//!
//! Two strategies, selected by type:
//! - [`ThreadLocalHandler`]: one uncontended arena per calling thread,
//!   created on first use. Writer locks are ownership checks; cross-thread
//!   frees ride the deferred paths. Needs `std` for TLS.
//! - [`SharedHandler`]: a chain of fixed-size arena sets shared by all
//!   threads. A packed 64-bit dispatcher round-robins lookups; arenas are
//!   taken with a non-blocking test-and-set, and misses grow the chain
//!   under a mutex that is never on the hot path.
//!
//! Every handler claims one slot in a process-wide table so each thread can
//! cache its last-used arena per handler. Slots are handed out monotonically
//! and never reclaimed: a process that creates more than
//! [`MAX_HANDLER_SLOTS`] handlers over its lifetime panics. This is a
//! documented limit, not a recycling scheme.

use crate::arena::Arena;
use crate::backing::{OS_PAGE_ALLOCATOR, PageAllocator};
use crate::config::{PAGE_SIZE, REPORT_LEAKS, SHARED_ARENA_BATCH_SIZE};
#[cfg(feature = "std")]
use crate::global_cache;
use crate::sync::{SharedLock, SpinMutex, WriterLock};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "std")]
use crate::sync::ThreadBoundLock;

/// Upper bound on handlers ever created in one process.
pub const MAX_HANDLER_SLOTS: usize = 256;

static HANDLER_SLOT_COUNTER: AtomicUsize = AtomicUsize::new(0);

const SLOT_UNCLAIMED: usize = usize::MAX;

/// A lazily claimed slot in the process-wide handler table.
#[cfg_attr(not(feature = "std"), allow(dead_code))]
struct HandlerSlot(AtomicUsize);

#[cfg_attr(not(feature = "std"), allow(dead_code))]
impl HandlerSlot {
    const fn new() -> Self {
        Self(AtomicUsize::new(SLOT_UNCLAIMED))
    }

    fn get_or_claim(&self) -> usize {
        let slot = self.0.load(Ordering::Acquire);
        if slot != SLOT_UNCLAIMED {
            return slot;
        }
        self.claim()
    }

    #[cold]
    fn claim(&self) -> usize {
        let id = HANDLER_SLOT_COUNTER.fetch_add(1, Ordering::Relaxed);
        assert!(
            id < MAX_HANDLER_SLOTS,
            "spanalloc: handler slot table exhausted ({MAX_HANDLER_SLOTS} handlers)"
        );
        match self
            .0
            .compare_exchange(SLOT_UNCLAIMED, id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => id,
            // Another thread claimed concurrently; our id stays burned
            // (the table is monotonic).
            Err(current) => current,
        }
    }
}

/// Per-thread cache: the arena last acquired from each handler slot.
#[cfg(feature = "std")]
mod tls {
    use super::MAX_HANDLER_SLOTS;
    use core::cell::UnsafeCell;
    use core::ptr;

    std::thread_local! {
        static ARENA_SLOTS: UnsafeCell<[*mut (); MAX_HANDLER_SLOTS]> =
            const { UnsafeCell::new([ptr::null_mut(); MAX_HANDLER_SLOTS]) };
    }

    pub fn get(slot: usize) -> *mut () {
        ARENA_SLOTS
            .try_with(|t| unsafe { (*t.get())[slot] })
            .unwrap_or(ptr::null_mut())
    }

    pub fn set(slot: usize, arena: *mut ()) {
        let _ = ARENA_SLOTS.try_with(|t| unsafe { (*t.get())[slot] = arena });
    }
}

/// Binds calling threads to arenas.
///
/// `acquire_arena` returns an arena whose writer lock the caller now holds
/// (for [`SharedHandler`]) or inherently owns (for [`ThreadLocalHandler`]);
/// null only when the backing allocator fails. The caller must
/// `release_arena` before acquiring again.
pub trait Handler {
    type Lock: WriterLock;

    fn acquire_arena(&self) -> *mut Arena<Self::Lock>;
    fn release_arena(&self, arena: *mut Arena<Self::Lock>);

    /// Drain every cache tier back to the backing allocator and count the
    /// spans still mapped — those hold live user blocks. Exclusive access
    /// makes the drain safe; `Drop` reuses this for the leak report.
    fn leaked_spans(&mut self) -> usize;
}

// ---- Thread-local strategy ---------------------------------------------

/// One arena per thread, created on first use by that thread.
#[cfg(feature = "std")]
pub struct ThreadLocalHandler {
    slot: HandlerSlot,
    /// Registry of all arenas created by this handler (for teardown).
    arenas: AtomicPtr<Arena<ThreadBoundLock>>,
    backing: &'static dyn PageAllocator,
}

#[cfg(feature = "std")]
impl ThreadLocalHandler {
    pub const fn new() -> Self {
        Self::with_backing(&OS_PAGE_ALLOCATOR)
    }

    pub const fn with_backing(backing: &'static dyn PageAllocator) -> Self {
        Self {
            slot: HandlerSlot::new(),
            arenas: AtomicPtr::new(ptr::null_mut()),
            backing,
        }
    }

    #[cold]
    fn create_thread_arena(&self, slot: usize) -> *mut Arena<ThreadBoundLock> {
        // Thread-local arenas overflow into / pull from the global caches.
        let arena = Arena::<ThreadBoundLock>::create(self.backing, true);
        if arena.is_null() {
            return ptr::null_mut();
        }
        // Register for teardown.
        let mut head = self.arenas.load(Ordering::Acquire);
        loop {
            unsafe { (*arena).next_arena.store(head, Ordering::Relaxed) };
            match self.arenas.compare_exchange_weak(
                head,
                arena,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
        tls::set(slot, arena as *mut ());
        arena
    }
}

#[cfg(feature = "std")]
impl Default for ThreadLocalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Handler for ThreadLocalHandler {
    type Lock = ThreadBoundLock;

    #[inline]
    fn acquire_arena(&self) -> *mut Arena<ThreadBoundLock> {
        let slot = self.slot.get_or_claim();
        let cached = tls::get(slot) as *mut Arena<ThreadBoundLock>;
        if !cached.is_null() {
            return cached;
        }
        self.create_thread_arena(slot)
    }

    #[inline]
    fn release_arena(&self, _arena: *mut Arena<ThreadBoundLock>) {}

    fn leaked_spans(&mut self) -> usize {
        let mut leaked = 0usize;
        let mut arena = self.arenas.load(Ordering::Acquire);
        unsafe {
            while !arena.is_null() {
                leaked += (*arena).release_spans();
                arena = (*arena).next_arena.load(Ordering::Acquire);
            }
            // Orphans parked in the global caches are freed by reservation
            // fields alone (their arena back-pointers may already be
            // stale).
            global_cache::drain(|span| unsafe {
                let ptr = (*span).initial_ptr;
                let size = (*span).alloc_size;
                self.backing.raw_free(ptr, size);
            });
        }
        leaked
    }
}

#[cfg(feature = "std")]
impl Drop for ThreadLocalHandler {
    fn drop(&mut self) {
        let leaked = self.leaked_spans();
        unsafe {
            let mut arena = self.arenas.load(Ordering::Acquire);
            while !arena.is_null() {
                let next = (*arena).next_arena.load(Ordering::Acquire);
                Arena::destroy(arena);
                arena = next;
            }
        }
        if REPORT_LEAKS && leaked > 0 {
            log::warn!("spanalloc: {leaked} span(s) still allocated at handler teardown");
        }
    }
}

// ---- Shared strategy ----------------------------------------------------

/// A fixed-size batch of arenas, chained to further sets on demand.
#[repr(C)]
pub struct ArenasSet {
    next: AtomicPtr<ArenasSet>,
    arenas: [Arena<SharedLock>; SHARED_ARENA_BATCH_SIZE],
}

impl ArenasSet {
    fn footprint() -> usize {
        core::mem::size_of::<Self>().next_multiple_of(PAGE_SIZE)
    }

    /// Map and initialize a set inside zeroed backing memory.
    fn create(backing: &'static dyn PageAllocator) -> *mut ArenasSet {
        let raw = backing.raw_alloc(Self::footprint());
        if raw.is_null() {
            return ptr::null_mut();
        }
        let set = raw as *mut ArenasSet;
        unsafe {
            for i in 0..SHARED_ARENA_BATCH_SIZE {
                let arena = ptr::addr_of_mut!((*set).arenas[i]);
                Arena::init(arena, backing, false);
            }
        }
        set
    }
}

/// Growth ceiling for the shared pool. Past this, acquire keeps cycling
/// the dispatcher instead of mapping ever more arenas; holders release
/// quickly, so progress is a matter of a few probes.
const MAX_SHARED_ARENAS: u64 = 256;

const DISPATCH_INDEX_BITS: u32 = 48;
const DISPATCH_INDEX_MASK: u64 = (1 << DISPATCH_INDEX_BITS) - 1;

#[inline]
const fn dispatch_pack(index: u64, capacity: u64) -> u64 {
    (capacity << DISPATCH_INDEX_BITS) | (index & DISPATCH_INDEX_MASK)
}

#[inline]
const fn dispatch_unpack(word: u64) -> (u64, u64) {
    (word & DISPATCH_INDEX_MASK, word >> DISPATCH_INDEX_BITS)
}

/// A pool of arenas shared by all threads of the process.
pub struct SharedHandler {
    slot: HandlerSlot,
    /// Packed `(index, capacity)`: index in the low 48 bits, total arena
    /// count in the high 16. Incremented on every lookup; capacity is
    /// re-published whole when the chain grows.
    dispatcher: AtomicU64,
    first_set: AtomicPtr<ArenasSet>,
    /// Guards set-chain growth only; never taken on the allocation path.
    grow_lock: SpinMutex<()>,
    backing: &'static dyn PageAllocator,
}

impl SharedHandler {
    pub const fn new() -> Self {
        Self::with_backing(&OS_PAGE_ALLOCATOR)
    }

    pub const fn with_backing(backing: &'static dyn PageAllocator) -> Self {
        Self {
            slot: HandlerSlot::new(),
            dispatcher: AtomicU64::new(0),
            first_set: AtomicPtr::new(ptr::null_mut()),
            grow_lock: SpinMutex::new(()),
            backing,
        }
    }

    /// Walk the chain to set `idx`. Capacity published through the
    /// dispatcher guarantees the chain is long enough.
    unsafe fn set_at(&self, idx: usize) -> *mut ArenasSet {
        let mut set = self.first_set.load(Ordering::Acquire);
        for _ in 0..idx {
            set = unsafe { (*set).next.load(Ordering::Acquire) };
        }
        set
    }

    /// Grow the pool under the mutex and return a freshly acquired arena.
    /// Null means either the backing allocator failed or another thread
    /// grew the pool first (`capacity` moved past `seen_capacity`) — the
    /// caller re-dispatches in the latter case.
    #[cold]
    fn create_arena(&self, seen_capacity: u64) -> *mut Arena<SharedLock> {
        let _guard = self.grow_lock.lock();

        let (index, capacity) = dispatch_unpack(self.dispatcher.load(Ordering::Acquire));
        if capacity != seen_capacity {
            return ptr::null_mut();
        }

        let batch = SHARED_ARENA_BATCH_SIZE as u64;
        let new_capacity = if capacity == 0 { batch } else { capacity * 2 };
        if new_capacity > MAX_SHARED_ARENAS.max(batch) {
            return ptr::null_mut();
        }

        // Build the new tail: capacity doubles, so capacity/batch new sets
        // (one for the initial grow).
        let new_sets = ((new_capacity - capacity) / batch) as usize;
        let first_new = ArenasSet::create(self.backing);
        if first_new.is_null() {
            return ptr::null_mut();
        }
        let mut tail = first_new;
        for _ in 1..new_sets {
            let set = ArenasSet::create(self.backing);
            if set.is_null() {
                // Backing failed mid-grow: publish what was built. The
                // dispatcher mask only bounds the index below capacity, so
                // a non-power-of-two capacity skews distribution but never
                // selects past the chain.
                break;
            }
            unsafe { (*tail).next.store(set, Ordering::Release) };
            tail = set;
        }

        // Count what was actually built.
        let mut built = 0u64;
        let mut cursor = first_new;
        while !cursor.is_null() {
            built += 1;
            cursor = unsafe { (*cursor).next.load(Ordering::Acquire) };
        }
        let published_capacity = capacity + built * batch;

        // Take the first new arena before anyone can race us to it.
        let arena = unsafe { ptr::addr_of_mut!((*first_new).arenas[0]) };
        let acquired = unsafe { (*arena).lock.try_acquire() };
        debug_assert!(acquired);

        // Splice the new tail into the chain, then publish the capacity.
        let head = self.first_set.load(Ordering::Acquire);
        if head.is_null() {
            self.first_set.store(first_new, Ordering::Release);
        } else {
            let mut last = head;
            unsafe {
                loop {
                    let next = (*last).next.load(Ordering::Acquire);
                    if next.is_null() {
                        break;
                    }
                    last = next;
                }
                (*last).next.store(first_new, Ordering::Release);
            }
        }
        // Capacity only ever moves under the grow lock, so a plain store
        // of the repacked word is fine; racing index increments are a
        // round-robin hint and may be dropped.
        self.dispatcher
            .store(dispatch_pack(index, published_capacity), Ordering::Release);

        arena
    }
}

impl Default for SharedHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for SharedHandler {
    type Lock = SharedLock;

    fn acquire_arena(&self) -> *mut Arena<SharedLock> {
        #[cfg(feature = "std")]
        let slot = self.slot.get_or_claim();
        #[cfg(not(feature = "std"))]
        let _ = &self.slot;

        // Fast path: the arena this thread last used, if free right now.
        #[cfg(feature = "std")]
        {
            let cached = tls::get(slot) as *mut Arena<SharedLock>;
            if !cached.is_null() && unsafe { (*cached).lock.try_acquire() } {
                return cached;
            }
        }

        loop {
            // AcqRel: reading a published capacity must also make the
            // spliced set chain visible before set_at walks it.
            let word = self.dispatcher.fetch_add(1, Ordering::AcqRel);
            let (index, capacity) = dispatch_unpack(word);

            if capacity != 0 {
                let arena_slot = (index as usize) & (capacity as usize - 1);
                let set_idx = arena_slot / SHARED_ARENA_BATCH_SIZE;
                let arena_idx = arena_slot % SHARED_ARENA_BATCH_SIZE;
                let arena = unsafe {
                    let set = self.set_at(set_idx);
                    ptr::addr_of_mut!((*set).arenas[arena_idx])
                };
                if unsafe { (*arena).lock.try_acquire() } {
                    #[cfg(feature = "std")]
                    tls::set(slot, arena as *mut ());
                    return arena;
                }
            }

            // Contended (or empty pool): grow.
            let arena = self.create_arena(capacity);
            if !arena.is_null() {
                #[cfg(feature = "std")]
                tls::set(slot, arena as *mut ());
                return arena;
            }
            // Null from create_arena means one of: another thread grew
            // first (capacity moved), the pool is at its size ceiling, or
            // the backing allocator failed. Only the last with an empty
            // pool is fatal; otherwise arenas exist and the dispatcher
            // will land on a free one.
            let (_, now) = dispatch_unpack(self.dispatcher.load(Ordering::Acquire));
            if now == 0 && capacity == 0 {
                return ptr::null_mut();
            }
        }
    }

    #[inline]
    fn release_arena(&self, arena: *mut Arena<SharedLock>) {
        unsafe { (*arena).lock.release() };
    }

    fn leaked_spans(&mut self) -> usize {
        let mut leaked = 0usize;
        unsafe {
            let mut set = self.first_set.load(Ordering::Acquire);
            while !set.is_null() {
                for i in 0..SHARED_ARENA_BATCH_SIZE {
                    let arena = ptr::addr_of_mut!((*set).arenas[i]);
                    leaked += (*arena).release_spans();
                }
                set = (*set).next.load(Ordering::Acquire);
            }
        }
        leaked
    }
}

impl Drop for SharedHandler {
    fn drop(&mut self) {
        let leaked = self.leaked_spans();
        unsafe {
            let mut set = self.first_set.load(Ordering::Acquire);
            while !set.is_null() {
                let next = (*set).next.load(Ordering::Acquire);
                self.backing.raw_free(set as *mut u8, ArenasSet::footprint());
                set = next;
            }
        }
        if REPORT_LEAKS && leaked > 0 {
            log::warn!("spanalloc: {leaked} span(s) still allocated at handler teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn dispatcher_packing_round_trips() {
        for (index, capacity) in [(0u64, 0u64), (1, 8), (12345, 16), (DISPATCH_INDEX_MASK, 64)] {
            let (i, c) = dispatch_unpack(dispatch_pack(index, capacity));
            assert_eq!(i, index & DISPATCH_INDEX_MASK);
            assert_eq!(c, capacity);
        }
    }

    #[test]
    fn shared_handler_hands_out_distinct_arenas_under_contention() {
        let handler = SharedHandler::new();
        let a = handler.acquire_arena();
        assert!(!a.is_null());
        // Same thread, arena still held: the pool must grow rather than
        // hand the held arena out again.
        let b = handler.acquire_arena();
        assert!(!b.is_null());
        assert_ne!(a, b);
        handler.release_arena(a);
        handler.release_arena(b);

        // Released arenas are reacquirable.
        let c = handler.acquire_arena();
        assert!(!c.is_null());
        handler.release_arena(c);
    }

    #[test]
    fn shared_handler_parallel_acquire_is_exclusive() {
        use std::sync::Arc;

        let handler = Arc::new(SharedHandler::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let handler = Arc::clone(&handler);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let arena = handler.acquire_arena();
                    assert!(!arena.is_null());
                    // Exclusivity: a second acquire on the held arena must
                    // fail.
                    assert!(!unsafe { (*arena).lock.try_acquire() });
                    handler.release_arena(arena);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[cfg(feature = "std")]
    #[test]
    fn thread_local_handler_binds_one_arena_per_thread() {
        use std::sync::Arc;

        let handler = Arc::new(ThreadLocalHandler::new());
        let mine = handler.acquire_arena();
        assert!(!mine.is_null());
        assert_eq!(handler.acquire_arena(), mine, "same thread, same arena");

        let remote = {
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || handler.acquire_arena() as usize)
                .join()
                .unwrap()
        };
        assert_ne!(remote, mine as usize, "each thread gets its own arena");
    }
}
