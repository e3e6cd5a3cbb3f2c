//! Span management: the span header, block carving, local and deferred free
//! lists, and span splitting.
//!
//! A span is a run of `span_count` consecutive SPAN_SIZE-aligned slots. Its
//! header lives at the base address of the first slot, so the owning span of
//! any block is recovered by masking the low address bits — no lookup
//! structure exists or is needed.
//!
//! Concurrency contract: the plain fields (`alloc_ptr`, `free_list`,
//! `block_count`, list links) are owner-only — touched by the thread/arena
//! holding the writer lock. Foreign threads are restricted to the atomic
//! fields (`deferred_free_list`, `deferred_frees`, `full`, `aligned_blocks`)
//! and never follow the plain ones. All access goes through raw pointers; no
//! `&mut Span` is ever formed.

use crate::config::{MOD_SPAN_SIZE, PAGE_SIZE, SPAN_HEADER_SIZE, SPAN_SIZE};
use crate::size_class::SizeClass;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// An intrusive free list node stored inside freed memory.
/// The `next` pointer occupies the first 8 bytes of the freed block.
#[repr(C)]
pub struct FreeBlock {
    pub next: *mut FreeBlock,
}

/// Sentinel swapped into `deferred_free_list` while a producer links a new
/// head. Distinct from null (empty) and from any block address.
const DEFERRED_LOCK: usize = usize::MAX;

/// Header of a span, placed at its (SPAN_SIZE-aligned) base address.
#[repr(C)]
pub struct Span {
    /// Base of the backing reservation fragment this span owns. Equal to
    /// the OS-returned pointer for exactly one span per reservation; equal
    /// to the span's own base for fragments produced by splitting.
    pub initial_ptr: *mut u8,
    /// Byte size of the owned reservation fragment. Fragment
    /// `(initial_ptr, alloc_size)` pairs of a split chain are disjoint and
    /// exactly cover the original reservation.
    pub alloc_size: usize,
    /// Owning arena, type-erased; the facade knows the concrete type.
    pub arena: *mut (),
    /// Number of consecutive span slots (1 for small/medium/span classes).
    pub span_count: u32,
    /// Block layout of this span.
    pub class: SizeClass,
    /// Bump pointer into the never-yet-carved tail of the block region.
    pub alloc_ptr: *mut u8,
    /// LIFO stack of locally freed (and pre-carved) blocks.
    pub free_list: *mut FreeBlock,
    /// LIFO stack of blocks freed by foreign threads. Null = empty;
    /// `DEFERRED_LOCK` while a producer is mid-link.
    pub deferred_free_list: AtomicUsize,
    /// Number of blocks currently on the deferred list.
    pub deferred_frees: AtomicU32,
    /// Blocks handed out, including deferred-freed ones not yet reclaimed.
    /// `block_count - deferred_frees` is the live block count.
    pub block_count: u32,
    /// Set when `block_count == block_max` with nothing deferred; cleared
    /// by whichever free observes it first.
    pub full: AtomicBool,
    /// Set when an over-aligned allocation produced a block pointer offset
    /// from the class stride; free must recover the true block start.
    pub aligned_blocks: AtomicBool,
    /// Intrusive links for span lists (owner-only).
    pub next: *mut Span,
    pub prev: *mut Span,
}

const _: () = assert!(core::mem::size_of::<Span>() <= SPAN_HEADER_SIZE);
const _: () = assert!(SPAN_HEADER_SIZE % core::mem::align_of::<Span>() == 0);

/// Recover the span owning `ptr`. Valid for any pointer into a span's
/// first slot (every block handed out lives there).
#[inline]
pub fn span_of(ptr: *mut u8) -> *mut Span {
    (ptr as usize & !MOD_SPAN_SIZE) as *mut Span
}

/// A span pointer riding through a cache queue. Ownership of the span
/// transfers with the queue entry, which is what makes the `Send` sound.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct SpanPtr(pub *mut Span);

unsafe impl Send for SpanPtr {}

impl Span {
    /// The base address of this span (== the header address).
    #[inline]
    pub fn base(&self) -> usize {
        self as *const Span as usize
    }

    /// First byte of the block region.
    #[inline]
    pub fn data_start(&self) -> usize {
        self.base() + SPAN_HEADER_SIZE
    }

    /// Live blocks: handed out and not yet freed by anyone.
    ///
    /// Owner-only (reads `block_count`). The Acquire load pairs with the
    /// Release increment in `free_block_deferred`: once live hits zero,
    /// every deferred producer's list link is visible too.
    #[inline]
    pub fn live_blocks(&self) -> u32 {
        self.block_count - self.deferred_frees.load(Ordering::Acquire)
    }

    /// Owner-only: no live blocks remain anywhere.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live_blocks() == 0
    }

    /// Write a fresh header at `at`, which must be a SPAN_SIZE-aligned
    /// address inside a mapped reservation.
    ///
    /// # Safety
    ///
    /// `at` must be valid for writes of `SPAN_HEADER_SIZE` bytes and not
    /// concurrently accessed.
    pub unsafe fn write_fresh(
        at: *mut Span,
        initial_ptr: *mut u8,
        alloc_size: usize,
        span_count: u32,
        arena: *mut (),
    ) {
        debug_assert_eq!(at as usize & MOD_SPAN_SIZE, 0);
        unsafe {
            at.write(Span {
                initial_ptr,
                alloc_size,
                arena,
                span_count,
                class: crate::size_class::span_class(),
                alloc_ptr: (at as usize + SPAN_HEADER_SIZE) as *mut u8,
                free_list: ptr::null_mut(),
                deferred_free_list: AtomicUsize::new(0),
                deferred_frees: AtomicU32::new(0),
                block_count: 0,
                full: AtomicBool::new(false),
                aligned_blocks: AtomicBool::new(false),
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
            });
        }
    }

    /// Reinitialize a span for carving blocks of `class`.
    ///
    /// # Safety
    ///
    /// The span must be quiescent: no live blocks and no in-flight deferred
    /// producers (guaranteed once `live_blocks() == 0`, because a producer
    /// increments `deferred_frees` only after its list link is complete, and
    /// no new producer can appear without a live block).
    pub unsafe fn init_for_class(this: *mut Span, class: SizeClass) {
        unsafe {
            (*this).class = class;
            (*this).alloc_ptr = ((*this).base() + SPAN_HEADER_SIZE) as *mut u8;
            (*this).free_list = ptr::null_mut();
            (*this).block_count = 0;
            (*this).deferred_free_list.store(0, Ordering::Relaxed);
            (*this).deferred_frees.store(0, Ordering::Relaxed);
            (*this).full.store(false, Ordering::Relaxed);
            (*this).aligned_blocks.store(false, Ordering::Relaxed);
            (*this).next = ptr::null_mut();
            (*this).prev = ptr::null_mut();
        }
    }

    /// Carve one block out of the span.
    ///
    /// On a free-list hit this is a pop. Otherwise the bump pointer
    /// advances by a whole batch: every block that fits in the remainder of
    /// the current OS page (bounded by the span's block region) is carved
    /// at once — the first is returned, the rest pre-linked onto
    /// `free_list`. First-touch therefore dirties one page at a time.
    ///
    /// # Safety
    ///
    /// Owner-only, and the span must have capacity: free list non-empty,
    /// bump space remaining, or blocks awaiting reclaim on the deferred
    /// list.
    pub unsafe fn allocate_block(this: *mut Span) -> *mut u8 {
        unsafe {
            (*this).block_count += 1;

            let head = (*this).free_list;
            if !head.is_null() {
                (*this).free_list = (*head).next;
                return head as *mut u8;
            }

            let bs = (*this).class.block_size as usize;
            let bump_limit = (*this).data_start() + (*this).class.block_max as usize * bs;
            let cursor = (*this).alloc_ptr as usize;
            if cursor + bs <= bump_limit {
                return Span::bump_batch(this, cursor, bs, bump_limit);
            }

            // Bump region exhausted and the free list was empty: the
            // remaining capacity sits on the deferred list.
            let reclaimed = Span::reclaim_deferred(this);
            debug_assert!(reclaimed > 0, "allocate_block on a span with no capacity");
            let head = (*this).free_list;
            (*this).free_list = (*head).next;
            head as *mut u8
        }
    }

    unsafe fn bump_batch(this: *mut Span, cursor: usize, bs: usize, bump_limit: usize) -> *mut u8 {
        let page_end = (cursor & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        let limit = if page_end < bump_limit { page_end } else { bump_limit };
        let mut count = (limit - cursor) / bs;
        if count == 0 {
            // The next block straddles the page boundary; carve just it.
            count = 1;
        }
        unsafe {
            (*this).alloc_ptr = (cursor + count * bs) as *mut u8;
            // Pre-link the tail of the batch, lowest address at the head.
            let mut i = count - 1;
            while i >= 1 {
                let block = (cursor + i * bs) as *mut FreeBlock;
                (*block).next = (*this).free_list;
                (*this).free_list = block;
                i -= 1;
            }
        }
        cursor as *mut u8
    }

    /// Free a block from the owning context (writer lock held).
    ///
    /// Returns true when this free took the span out of the full state; the
    /// caller must relink the span into its class's partial list.
    ///
    /// # Safety
    ///
    /// Owner-only. `block` must be a live block of this span.
    pub unsafe fn free_block_local(this: *mut Span, block: *mut u8) -> bool {
        unsafe {
            let b = block as *mut FreeBlock;
            (*b).next = (*this).free_list;
            (*this).free_list = b;
            (*this).block_count -= 1;
            (*this).full.swap(false, Ordering::Relaxed)
        }
    }

    /// Free a block from a foreign thread.
    ///
    /// Pushes onto the deferred list with the two-phase swap protocol, then
    /// publishes the count. Returns true iff this call flipped the span out
    /// of the full state — at most one concurrent caller gets true per full
    /// episode, and that caller must enqueue the span onto the owning
    /// arena's deferred-partial stack.
    ///
    /// # Safety
    ///
    /// `block` must be a live block of this span, owned by the caller.
    pub unsafe fn free_block_deferred(this: *mut Span, block: *mut u8) -> bool {
        let b = block as *mut FreeBlock;
        unsafe {
            // Phase 1: swap in the lock sentinel; whoever gets a real head
            // owns the link. A concurrent producer (or the draining owner)
            // observing the sentinel retries.
            let head = loop {
                let head = (*this)
                    .deferred_free_list
                    .swap(DEFERRED_LOCK, Ordering::Acquire);
                if head != DEFERRED_LOCK {
                    break head;
                }
                core::hint::spin_loop();
            };
            (*b).next = head as *mut FreeBlock;
            // Phase 2: publish the new head, releasing the sentinel.
            (*this)
                .deferred_free_list
                .store(b as usize, Ordering::Release);

            // SeqCst pairs with the owner's full-store / counter-recheck:
            // without a single total order, both sides can read stale and a
            // full-marked span would strand with blocks on its deferred
            // list.
            (*this).deferred_frees.fetch_add(1, Ordering::SeqCst);

            (*this).full.load(Ordering::SeqCst) && (*this).full.swap(false, Ordering::Relaxed)
        }
    }

    /// Move the whole deferred chain onto the local free list. Returns the
    /// number of blocks reclaimed.
    ///
    /// # Safety
    ///
    /// Owner-only.
    pub unsafe fn reclaim_deferred(this: *mut Span) -> u32 {
        unsafe {
            // The owner must not blindly swap: installing a value while a
            // producer holds the sentinel would let a second producer slip
            // in and have its link overwritten. CAS from a real head only.
            let head = loop {
                let cur = (*this).deferred_free_list.load(Ordering::Acquire);
                if cur == 0 {
                    return 0;
                }
                if cur == DEFERRED_LOCK {
                    core::hint::spin_loop();
                    continue;
                }
                if (*this)
                    .deferred_free_list
                    .compare_exchange_weak(cur, 0, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    break cur;
                }
            };

            let mut count = 1u32;
            let mut tail = head as *mut FreeBlock;
            while !(*tail).next.is_null() {
                tail = (*tail).next;
                count += 1;
            }
            (*tail).next = (*this).free_list;
            (*this).free_list = head as *mut FreeBlock;
            (*this).block_count -= count;
            (*this).deferred_frees.fetch_sub(count, Ordering::Relaxed);
            count
        }
    }

    /// Recover the canonical block start for a pointer into this span.
    /// Identity unless over-aligned blocks were carved.
    ///
    /// # Safety
    ///
    /// `ptr` must point into a block of this span.
    pub unsafe fn block_start(this: *mut Span, ptr: *mut u8) -> *mut u8 {
        unsafe {
            if !(*this).aligned_blocks.load(Ordering::Relaxed) {
                return ptr;
            }
            // Field projections only: foreign threads call this while the
            // owner mutates its side of the header.
            let data = this as usize + SPAN_HEADER_SIZE;
            if (*this).class.block_max == 1 {
                return data as *mut u8;
            }
            let offset = (ptr as usize - data) % (*this).class.block_size as usize;
            (ptr as usize - offset) as *mut u8
        }
    }

    /// Split off the first `count` slots; returns the remainder span.
    ///
    /// The head keeps the reservation prefix (including any front padding
    /// ahead of the first slot); the remainder records its own base as
    /// `initial_ptr` and owns the tail share. Blocks in either half's
    /// disjoint range are unaffected.
    ///
    /// # Safety
    ///
    /// Owner-only; `1 <= count < span_count`; the remainder slots must hold
    /// no live blocks.
    pub unsafe fn split_first_spans(this: *mut Span, count: u32) -> *mut Span {
        unsafe {
            debug_assert!(count >= 1 && count < (*this).span_count);
            let rem_base = (*this).base() + count as usize * SPAN_SIZE;
            let rem_count = (*this).span_count - count;
            let head_share = rem_base - (*this).initial_ptr as usize;
            let rem_share = (*this).alloc_size - head_share;

            (*this).span_count = count;
            (*this).alloc_size = head_share;

            let rem = rem_base as *mut Span;
            Span::write_fresh(rem, rem_base as *mut u8, rem_share, rem_count, (*this).arena);
            rem
        }
    }
}

/// A doubly-linked intrusive list of spans (owner-only).
pub struct SpanList {
    pub head: *mut Span,
    pub count: usize,
}

impl Default for SpanList {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    /// Prepend a span to the front of the list.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, non-null pointer to a `Span` not already in
    /// a list.
    pub unsafe fn push(&mut self, span: *mut Span) {
        unsafe {
            (*span).next = self.head;
            (*span).prev = ptr::null_mut();
            if !self.head.is_null() {
                (*self.head).prev = span;
            }
            self.head = span;
            self.count += 1;
        }
    }

    /// Remove a specific span from the list.
    ///
    /// # Safety
    ///
    /// `span` must be a valid pointer to a `Span` currently in this list.
    pub unsafe fn remove(&mut self, span: *mut Span) {
        unsafe {
            let prev = (*span).prev;
            let next = (*span).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*span).prev = ptr::null_mut();
            (*span).next = ptr::null_mut();
            self.count -= 1;
        }
    }

    /// Pop the first span from the list.
    ///
    /// # Safety
    ///
    /// The list's internal pointers must be valid (maintained by
    /// `push`/`remove`).
    pub unsafe fn pop(&mut self) -> *mut Span {
        let span = self.head;
        if !span.is_null() {
            unsafe { self.remove(span) };
        }
        span
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SPAN_EFFECTIVE_SIZE;
    use crate::size_class::{class_of, span_class};
    use alloc::vec::Vec;
    use core::alloc::Layout;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::Arc;

    /// A span-aligned slab of raw memory for exercising the header logic.
    struct TestSpan {
        ptr: *mut u8,
        slots: usize,
    }

    impl TestSpan {
        fn new(slots: usize) -> Self {
            let layout = Layout::from_size_align(slots * SPAN_SIZE, SPAN_SIZE).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            unsafe {
                Span::write_fresh(
                    ptr as *mut Span,
                    ptr,
                    slots * SPAN_SIZE,
                    slots as u32,
                    ptr::null_mut(),
                );
            }
            Self { ptr, slots }
        }

        fn span(&self) -> *mut Span {
            self.ptr as *mut Span
        }
    }

    impl Drop for TestSpan {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.slots * SPAN_SIZE, SPAN_SIZE).unwrap();
            unsafe { std::alloc::dealloc(self.ptr, layout) };
        }
    }

    unsafe impl Send for TestSpan {}
    unsafe impl Sync for TestSpan {}

    #[test]
    fn span_of_masks_to_base() {
        let t = TestSpan::new(1);
        let s = t.span();
        unsafe {
            Span::init_for_class(s, class_of(64));
            let p = Span::allocate_block(s);
            assert_eq!(span_of(p), s);
            let p2 = Span::allocate_block(s);
            assert_eq!(span_of(p2), s);
        }
    }

    #[test]
    fn carve_free_carve_reuses_blocks() {
        let t = TestSpan::new(1);
        let s = t.span();
        unsafe {
            Span::init_for_class(s, class_of(128));
            let a = Span::allocate_block(s);
            let b = Span::allocate_block(s);
            assert_ne!(a, b);
            assert_eq!((*s).block_count, 2);

            assert!(!Span::free_block_local(s, b));
            assert_eq!((*s).block_count, 1);

            // LIFO: the freed block comes right back.
            let c = Span::allocate_block(s);
            assert_eq!(c, b);
        }
    }

    #[test]
    fn bump_batches_stop_at_page_boundaries() {
        let t = TestSpan::new(1);
        let s = t.span();
        unsafe {
            Span::init_for_class(s, class_of(64));
            let first = Span::allocate_block(s) as usize;
            // The batch pre-linked the rest of the first page; the bump
            // cursor must sit exactly on the next page boundary.
            let cursor = (*s).alloc_ptr as usize;
            assert_eq!(cursor % PAGE_SIZE, 0);
            assert!(cursor > first);
        }
    }

    #[test]
    fn exhausting_a_span_hits_block_max() {
        let t = TestSpan::new(1);
        let s = t.span();
        unsafe {
            let class = class_of(SPAN_EFFECTIVE_SIZE / 4);
            Span::init_for_class(s, class);
            let mut blocks = Vec::new();
            for _ in 0..class.block_max {
                blocks.push(Span::allocate_block(s) as usize);
            }
            assert_eq!((*s).block_count, class.block_max as u32);
            blocks.sort_unstable();
            blocks.dedup();
            assert_eq!(blocks.len(), class.block_max as usize, "blocks overlap");
            let end = (*s).base() + SPAN_SIZE;
            for &b in &blocks {
                assert!(b + class.block_size as usize <= end);
                assert!(b >= (*s).data_start());
            }
        }
    }

    #[test]
    fn deferred_frees_reclaim_in_one_splice() {
        let t = TestSpan::new(1);
        let s = t.span();
        unsafe {
            Span::init_for_class(s, class_of(64));
            let a = Span::allocate_block(s);
            let b = Span::allocate_block(s);
            let c = Span::allocate_block(s);

            assert!(!Span::free_block_deferred(s, a));
            assert!(!Span::free_block_deferred(s, b));
            assert_eq!((*s).deferred_frees.load(Ordering::Relaxed), 2);
            assert_eq!((*s).live_blocks(), 1);

            assert_eq!(Span::reclaim_deferred(s), 2);
            assert_eq!((*s).deferred_frees.load(Ordering::Relaxed), 0);
            assert_eq!((*s).block_count, 1);

            assert!(!Span::free_block_local(s, c));
            assert!((*s).is_empty());
        }
    }

    #[test]
    fn full_flag_hands_exactly_one_enqueue() {
        // Concurrent foreign frees against a full span: exactly one caller
        // is told to enqueue, per full episode.
        let t = Arc::new(TestSpan::new(1));
        let s = t.span();
        let class = class_of(256);
        unsafe { Span::init_for_class(s, class) };
        let blocks: Vec<usize> = (0..class.block_max)
            .map(|_| unsafe { Span::allocate_block(s) } as usize)
            .collect();
        unsafe { (*s).full.store(true, Ordering::Relaxed) };

        let flips = Arc::new(StdAtomicU32::new(0));
        let mut handles = Vec::new();
        for chunk in blocks.chunks(blocks.len() / 4) {
            let chunk: Vec<usize> = chunk.to_vec();
            let flips = Arc::clone(&flips);
            let t = Arc::clone(&t);
            handles.push(std::thread::spawn(move || {
                let s = t.span();
                for b in chunk {
                    if unsafe { Span::free_block_deferred(s, b as *mut u8) } {
                        flips.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(flips.load(Ordering::Relaxed), 1);
        unsafe {
            assert_eq!(Span::reclaim_deferred(s), class.block_max as u32);
            assert!((*s).is_empty());
        }
    }

    #[test]
    fn split_shares_cover_the_reservation() {
        let t = TestSpan::new(8);
        let s = t.span();
        unsafe {
            let rem = Span::split_first_spans(s, 3);
            assert_eq!((*s).span_count, 3);
            assert_eq!((*rem).span_count, 5);
            assert_eq!(rem as usize, (*s).base() + 3 * SPAN_SIZE);
            assert_eq!((*rem).initial_ptr, rem as *mut u8);

            // Disjoint cover: shares sum to the reservation, head keeps
            // the OS base.
            assert_eq!((*s).alloc_size + (*rem).alloc_size, 8 * SPAN_SIZE);
            assert_eq!((*s).initial_ptr, (*s).base() as *mut u8);

            let rem2 = Span::split_first_spans(rem, 4);
            assert_eq!((*rem).span_count, 4);
            assert_eq!((*rem2).span_count, 1);
            assert_eq!((*rem).alloc_size, 4 * SPAN_SIZE);
            assert_eq!((*rem2).alloc_size, SPAN_SIZE);
        }
    }

    #[test]
    fn block_start_recovers_aligned_blocks() {
        let t = TestSpan::new(1);
        let s = t.span();
        unsafe {
            let class = class_of(192 + 64);
            Span::init_for_class(s, class);
            (*s).aligned_blocks.store(true, Ordering::Relaxed);
            let block = Span::allocate_block(s);
            let aligned = ((block as usize + 63) & !63) as *mut u8;
            assert_eq!(Span::block_start(s, aligned), block);
            assert_eq!(Span::block_start(s, block), block);
        }
    }

    #[test]
    fn span_class_single_block() {
        let t = TestSpan::new(1);
        let s = t.span();
        unsafe {
            Span::init_for_class(s, span_class());
            let p = Span::allocate_block(s);
            assert_eq!(p as usize, (*s).data_start());
            assert_eq!((*s).block_count, 1);
            assert!(!(*s).is_empty());
            Span::free_block_local(s, p);
            assert!((*s).is_empty());
        }
    }

    #[test]
    fn list_surgery() {
        let t1 = TestSpan::new(1);
        let t2 = TestSpan::new(1);
        let t3 = TestSpan::new(1);
        let (s1, s2, s3) = (t1.span(), t2.span(), t3.span());

        let mut list = SpanList::new();
        assert!(list.is_empty());
        unsafe {
            list.push(s1);
            list.push(s2);
            list.push(s3);
            assert_eq!(list.count, 3);
            assert_eq!(list.head, s3);

            list.remove(s2);
            assert_eq!(list.count, 2);
            assert_eq!((*s3).next, s1);
            assert_eq!((*s1).prev, s3);

            assert_eq!(list.pop(), s3);
            assert_eq!(list.pop(), s1);
            assert!(list.pop().is_null());
            assert!(list.is_empty());
        }
    }
}
