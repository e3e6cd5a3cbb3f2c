//! Arena: the per-owner allocation engine.
//!
//! An arena owns, per size class, a partial-span list and a deferred-partial
//! stack, plus the span sourcing tiers: a 1-span MPMC cache, one MPSC cache
//! per large class, and a map cache of freshly mapped, not-yet-carved runs.
//!
//! Locking discipline: everything inside [`ArenaOwned`] (and the consumer
//! end of the large caches) is touched only while the arena's
//! [`WriterLock`] is held. The cache queues' producer ends, the
//! deferred-partial stacks, and the per-span deferred machinery are safe
//! from any thread — that is the whole cross-thread free story: foreign
//! threads never take the lock.

use crate::backing::PageAllocator;
use crate::config::{
    CACHE_LIMIT, LARGE_CACHE_LIMIT, LARGE_CLASS_COUNT, MAP_ALLOC_COUNT, MOD_SPAN_SIZE, PAGE_SIZE,
    RECYCLE_LARGE_SPANS, REPORT_LEAKS, SIZE_CLASS_COUNT, SPAN_ALLOC_COUNT, SPAN_HEADER_SIZE,
    SPAN_SIZE, SPLIT_LARGE_SPANS_TO_LARGE, SPLIT_LARGE_SPANS_TO_ONE,
};
use crate::global_cache;
use crate::queue::{BoundedMpmcQueue, BoundedMpscQueue};
use crate::size_class::{self, SizeClass};
use crate::span::{Span, SpanList, SpanPtr};
use crate::sync::WriterLock;
use crate::{stat_add, stat_inc};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Lock-free LIFO stack of spans flipped out of the full state by foreign
/// threads. Producers are those foreign threads; the single consumer is the
/// arena owner, who takes the whole chain in one swap.
pub struct DeferredSpanStack {
    head: AtomicPtr<Span>,
}

impl DeferredSpanStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push a span. The span must be unlinked from every list; its `next`
    /// field carries the chain (exclusively owned by the pusher until the
    /// owner drains — the full-flag protocol hands out that exclusivity).
    pub fn push(&self, span: *mut Span) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*span).next = head };
            match self
                .head
                .compare_exchange_weak(head, span, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(cur) => head = cur,
            }
        }
    }

    /// Take the whole chain (linked through `next`), leaving the stack
    /// empty.
    pub fn take_all(&self) -> *mut Span {
        self.head.swap(ptr::null_mut(), Ordering::Acquire)
    }
}

impl Default for DeferredSpanStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner-only arena state, guarded by the writer lock.
struct ArenaOwned {
    /// Per-class lists of spans with free capacity. Head is the active
    /// allocation target.
    partial_spans: [SpanList; SIZE_CLASS_COUNT],
    /// Freshly mapped, not-yet-carved runs, keyed by slot count (index
    /// `min(span_count, LARGE_CLASS_COUNT)`; entries below index 2 never
    /// occur).
    map_caches: [SpanList; LARGE_CLASS_COUNT + 1],
}

/// The allocation engine bound to one owner at a time.
///
/// Arenas are created inside zero-initialized backing memory
/// ([`Arena::create`]); the all-zero state of every field is its valid
/// empty state, so `init` only writes the non-zero ones.
#[repr(C)]
pub struct Arena<L: WriterLock> {
    pub lock: L,
    owned: UnsafeCell<ArenaOwned>,
    /// Per-class stacks of spans foreign frees took out of the full state.
    deferred_partials: [DeferredSpanStack; SIZE_CLASS_COUNT],
    /// Single spans ready for reuse; any thread may push, any may pop.
    /// Entries may carry `span_count > 1` when large-span recycling is on;
    /// consumers split them.
    span_cache: BoundedMpmcQueue<SpanPtr, CACHE_LIMIT>,
    /// One ring per large class (index = span_count - 2). Foreign producers,
    /// owner consumer.
    large_caches: [BoundedMpscQueue<SpanPtr, LARGE_CACHE_LIMIT>; LARGE_CLASS_COUNT - 1],
    backing: &'static dyn PageAllocator,
    use_global_caches: bool,
    /// Spans currently mapped on behalf of this arena (leak bookkeeping).
    mapped_spans: AtomicUsize,
    /// Chain link for the handler's arena registry.
    pub next_arena: AtomicPtr<Arena<L>>,
}

unsafe impl<L: WriterLock> Send for Arena<L> {}
unsafe impl<L: WriterLock> Sync for Arena<L> {}

impl<L: WriterLock> Arena<L> {
    /// Bytes of backing memory an arena occupies.
    pub fn footprint() -> usize {
        core::mem::size_of::<Self>().next_multiple_of(PAGE_SIZE)
    }

    /// Map and initialize a new arena, bound to the calling context.
    /// Returns null when the backing allocator fails.
    pub fn create(backing: &'static dyn PageAllocator, use_global_caches: bool) -> *mut Self {
        let raw = backing.raw_alloc(Self::footprint());
        if raw.is_null() {
            return ptr::null_mut();
        }
        let this = raw as *mut Self;
        unsafe { Self::init(this, backing, use_global_caches) };
        this
    }

    /// Initialize an arena inside zero-filled memory (a fresh backing
    /// reservation). Binds the writer lock to the calling context.
    ///
    /// # Safety
    ///
    /// `this` must point to `size_of::<Self>()` zero-initialized bytes not
    /// yet shared with other threads.
    pub unsafe fn init(this: *mut Self, backing: &'static dyn PageAllocator, use_global_caches: bool) {
        unsafe {
            ptr::addr_of_mut!((*this).backing).write(backing);
            ptr::addr_of_mut!((*this).use_global_caches).write(use_global_caches);
            (*this).lock.bind();
        }
    }

    /// Release the arena's own mapping. The arena must already be drained
    /// (`release_spans`).
    ///
    /// # Safety
    ///
    /// No live references to the arena, its spans, or its caches remain.
    pub unsafe fn destroy(this: *mut Self) {
        unsafe {
            let backing = (*this).backing;
            backing.raw_free(this as *mut u8, Self::footprint());
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn owned(&self) -> &mut ArenaOwned {
        // Exclusive by the writer-lock discipline; see module docs.
        unsafe { &mut *self.owned.get() }
    }

    fn adopt(&self, span: *mut Span) {
        unsafe { (*span).arena = self as *const Self as *mut () };
        self.bump_mapped(unsafe { (*span).span_count } as usize);
    }

    fn bump_mapped(&self, spans: usize) {
        if REPORT_LEAKS {
            self.mapped_spans.fetch_add(spans, Ordering::Relaxed);
        }
    }

    fn drop_mapped(&self, spans: usize) {
        if REPORT_LEAKS {
            self.mapped_spans.fetch_sub(spans, Ordering::Relaxed);
        }
    }

    /// Spans currently mapped on behalf of this arena.
    pub fn mapped_spans(&self) -> usize {
        self.mapped_spans.load(Ordering::Relaxed)
    }

    // ---- Allocation routing --------------------------------------------

    /// Allocate one block of a small/medium class.
    ///
    /// # Safety
    ///
    /// Writer lock held.
    pub unsafe fn allocate_to_span(&self, class: SizeClass) -> *mut u8 {
        unsafe {
            loop {
                // Re-derived each round: allocate_generic below takes its
                // own exclusive view of the owned state.
                let list = &mut self.owned().partial_spans[class.class_idx as usize];
                let head = list.head;
                if head.is_null() {
                    if !self.allocate_generic(class) {
                        return ptr::null_mut();
                    }
                    continue;
                }

                if (*head).block_count == (*head).class.block_max as u32 {
                    if (*head).deferred_frees.load(Ordering::Acquire) != 0 {
                        Span::reclaim_deferred(head);
                    } else {
                        // Unlink before raising the flag, so a span on the
                        // deferred-partial stack is never also in a list.
                        list.remove(head);
                        // SeqCst store + recheck pair with the SeqCst
                        // counter bump in free_block_deferred: either the
                        // foreign free sees the flag, or we see its count.
                        (*head).full.store(true, Ordering::SeqCst);
                        // A foreign free may have landed between the check
                        // and the store; it saw full == false and did not
                        // enqueue. Win the flag back and keep the span.
                        if (*head).deferred_frees.load(Ordering::SeqCst) != 0
                            && (*head).full.swap(false, Ordering::Relaxed)
                        {
                            Span::reclaim_deferred(head);
                            list.push(head);
                        }
                        continue;
                    }
                }

                return Span::allocate_block(head);
            }
        }
    }

    /// Slow path for a class miss: drain the deferred-partial stack into
    /// the partial list, or source a fresh span. Returns false on OOM.
    ///
    /// # Safety
    ///
    /// Writer lock held.
    unsafe fn allocate_generic(&self, class: SizeClass) -> bool {
        unsafe {
            let idx = class.class_idx as usize;
            let chain = self.deferred_partials[idx].take_all();
            if !chain.is_null() {
                stat_inc!(deferred_drains);
                let list = &mut self.owned().partial_spans[idx];
                let mut span = chain;
                while !span.is_null() {
                    let next = (*span).next;
                    Span::reclaim_deferred(span);
                    list.push(span);
                    span = next;
                }
                return true;
            }

            let span = self.get_span_from_cache_or_new();
            if span.is_null() {
                return false;
            }
            Span::init_for_class(span, class);
            self.owned().partial_spans[idx].push(span);
            true
        }
    }

    /// Allocate a block filling a whole single span.
    ///
    /// # Safety
    ///
    /// Writer lock held.
    pub unsafe fn allocate_one_span(&self) -> *mut u8 {
        unsafe {
            let span = self.get_span_from_cache_or_new();
            if span.is_null() {
                return ptr::null_mut();
            }
            Span::init_for_class(span, size_class::span_class());
            Span::allocate_block(span)
        }
    }

    /// Allocate a block spanning `count` consecutive slots, tolerating a
    /// cached span of up to `max_count` slots.
    ///
    /// # Safety
    ///
    /// Writer lock held; `2 <= count <= max_count`.
    pub unsafe fn allocate_to_large_span(&self, count: usize, max_count: usize) -> *mut u8 {
        unsafe {
            let span = match self.get_large_span_from_caches(count, max_count) {
                Some(span) => span,
                None => {
                    let span = self.map_fresh_spans(count);
                    if span.is_null() {
                        return ptr::null_mut();
                    }
                    span
                }
            };
            Span::init_for_class(span, size_class::large_class((*span).span_count));
            Span::allocate_block(span)
        }
    }

    /// Allocate a huge block straight from the backing allocator: one
    /// reservation, one span, no caches.
    ///
    /// # Safety
    ///
    /// Writer lock held.
    pub unsafe fn allocate_huge(&self, size: usize) -> *mut u8 {
        let total = match size
            .checked_add(SPAN_HEADER_SIZE)
            .and_then(|n| n.checked_next_multiple_of(PAGE_SIZE))
            .and_then(|n| n.checked_add(SPAN_SIZE))
        {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        let raw = self.backing.raw_alloc(total);
        if raw.is_null() {
            return ptr::null_mut();
        }
        stat_inc!(span_maps);
        stat_add!(span_map_bytes, total as u64);

        let base = (raw as usize + MOD_SPAN_SIZE) & !MOD_SPAN_SIZE;
        let span = base as *mut Span;
        let count = size_class::large_span_count(size);
        unsafe {
            Span::write_fresh(
                span,
                raw,
                total,
                count as u32,
                self as *const Self as *mut (),
            );
            (*span).class = size_class::huge_class();
            (*span).block_count = 1;
        }
        self.bump_mapped(count);
        (base + SPAN_HEADER_SIZE) as *mut u8
    }

    /// Free a huge span: exactly one backing call, mirroring the alloc.
    ///
    /// # Safety
    ///
    /// `span` must be a huge span of this arena with no live block.
    pub unsafe fn free_huge_span(&self, span: *mut Span) {
        unsafe { self.free_span_to_backing(span) };
    }

    // ---- Span sourcing --------------------------------------------------

    /// Source a single span: own cache, harvested empties, map cache,
    /// large-cache splitting, global cache, fresh mapping — in that order.
    ///
    /// # Safety
    ///
    /// Writer lock held.
    unsafe fn get_span_from_cache_or_new(&self) -> *mut Span {
        unsafe {
            if let Some(p) = self.span_cache.try_read() {
                stat_inc!(span_cache_hits);
                return self.split_to_single(p.0);
            }

            let harvested = self.harvest_empty_span();
            if !harvested.is_null() {
                stat_inc!(empty_harvests);
                return harvested;
            }

            if let Some(span) = self.get_from_map_cache(1) {
                stat_inc!(map_cache_hits);
                return span;
            }

            if SPLIT_LARGE_SPANS_TO_ONE {
                for ring in &self.large_caches {
                    if let Some(p) = ring.try_read() {
                        stat_inc!(large_cache_hits);
                        return self.split_to_single(p.0);
                    }
                }
            }

            if self.use_global_caches {
                if let Some(span) = global_cache::get_span() {
                    stat_inc!(global_cache_hits);
                    self.adopt(span);
                    return self.split_to_single(span);
                }
            }

            self.map_fresh_spans(1)
        }
    }

    /// Reduce a cached span to a single slot, re-caching any remainder.
    unsafe fn split_to_single(&self, span: *mut Span) -> *mut Span {
        unsafe {
            if (*span).span_count > 1 {
                stat_inc!(span_splits);
                let rem = Span::split_first_spans(span, 1);
                self.stash_remainder(rem);
            }
            span
        }
    }

    /// Source a large span of `count..=max_count` slots from the caches.
    ///
    /// # Safety
    ///
    /// Writer lock held.
    unsafe fn get_large_span_from_caches(&self, count: usize, max_count: usize) -> Option<*mut Span> {
        unsafe {
            let max_count = max_count.min(LARGE_CLASS_COUNT);
            for k in count..=max_count {
                if let Some(p) = self.large_caches[k - 2].try_read() {
                    stat_inc!(large_cache_hits);
                    return Some(p.0);
                }
            }

            if let Some(span) = self.get_from_map_cache(count) {
                stat_inc!(map_cache_hits);
                return Some(span);
            }

            if SPLIT_LARGE_SPANS_TO_LARGE {
                for k in (max_count + 1)..=LARGE_CLASS_COUNT {
                    if let Some(p) = self.large_caches[k - 2].try_read() {
                        stat_inc!(large_cache_hits);
                        stat_inc!(span_splits);
                        let span = p.0;
                        let rem = Span::split_first_spans(span, count as u32);
                        self.stash_remainder(rem);
                        return Some(span);
                    }
                }
            }

            if self.use_global_caches {
                if let Some(span) = global_cache::get_large_span(count, max_count) {
                    stat_inc!(global_cache_hits);
                    self.adopt(span);
                    return Some(span);
                }
            }

            None
        }
    }

    /// Sweep the partial lists for spans with no live blocks. All empties
    /// are demoted to the 1-span cache; the first found is returned
    /// directly. Running this twice back-to-back is a no-op the second
    /// time.
    unsafe fn harvest_empty_span(&self) -> *mut Span {
        unsafe {
            let mut found: *mut Span = ptr::null_mut();
            for list in &mut self.owned().partial_spans {
                let mut span = list.head;
                while !span.is_null() {
                    let next = (*span).next;
                    if (*span).is_empty() {
                        list.remove(span);
                        if found.is_null() {
                            found = span;
                        } else {
                            self.cache_span_or_free(span);
                        }
                    }
                    span = next;
                }
            }
            found
        }
    }

    /// Pop a span of at least `count` slots from the map cache, splitting
    /// oversize entries.
    unsafe fn get_from_map_cache(&self, count: usize) -> Option<*mut Span> {
        unsafe {
            let owned = self.owned();
            for key in count.max(2)..=LARGE_CLASS_COUNT {
                let span = owned.map_caches[key].pop();
                if span.is_null() {
                    continue;
                }
                if (*span).span_count as usize > count {
                    stat_inc!(span_splits);
                    let rem = Span::split_first_spans(span, count as u32);
                    self.stash_remainder(rem);
                }
                return Some(span);
            }
            None
        }
    }

    /// Put a split remainder where it belongs: 1-span cache, large cache,
    /// or back into the map cache for oversize runs.
    ///
    /// # Safety
    ///
    /// Writer lock held.
    unsafe fn stash_remainder(&self, span: *mut Span) {
        unsafe {
            let count = (*span).span_count as usize;
            if count == 1 {
                self.cache_span_or_free(span);
            } else if count <= LARGE_CLASS_COUNT {
                self.cache_large_span_or_free(span, false);
            } else {
                self.owned().map_caches[LARGE_CLASS_COUNT].push(span);
            }
        }
    }

    /// Map a fresh run of spans. `map_count = max(MAP_ALLOC_COUNT,
    /// desired)` slots are requested plus one slot of padding; when the OS
    /// pointer comes back already span-aligned the padding slot is usable
    /// too. The head `desired` slots are returned; for single-span requests
    /// up to `SPAN_ALLOC_COUNT` singles are pre-carved into the 1-span
    /// cache; the rest parks in the map cache.
    ///
    /// # Safety
    ///
    /// Writer lock held.
    unsafe fn map_fresh_spans(&self, desired: usize) -> *mut Span {
        let map_count = MAP_ALLOC_COUNT.max(desired);
        let total = (map_count + 1) * SPAN_SIZE;
        let raw = self.backing.raw_alloc(total);
        if raw.is_null() {
            return ptr::null_mut();
        }
        stat_inc!(span_maps);
        stat_add!(span_map_bytes, total as u64);

        let base = (raw as usize + MOD_SPAN_SIZE) & !MOD_SPAN_SIZE;
        let usable = if base == raw as usize {
            map_count + 1
        } else {
            map_count
        };
        self.bump_mapped(usable);

        let head = base as *mut Span;
        unsafe {
            Span::write_fresh(
                head,
                raw,
                total,
                usable as u32,
                self as *const Self as *mut (),
            );

            if usable > desired {
                stat_inc!(span_splits);
                let mut rem = Span::split_first_spans(head, desired as u32);
                if desired == 1 {
                    // Pre-carve singles for the 1-span cache.
                    let mut carved = 1;
                    while carved < SPAN_ALLOC_COUNT && (*rem).span_count > 1 {
                        let tail = Span::split_first_spans(rem, 1);
                        if !self.span_cache.try_write(SpanPtr(rem)) {
                            self.cache_span_or_free(rem);
                            rem = tail;
                            break;
                        }
                        rem = tail;
                        carved += 1;
                    }
                }
                self.stash_remainder(rem);
            }
        }
        head
    }

    // ---- Free paths -----------------------------------------------------

    /// Free a block of a multi-block span from the owning context.
    ///
    /// # Safety
    ///
    /// Writer lock held; `ptr` must be a live block of `span`, which must
    /// belong to this arena.
    pub unsafe fn free_block_owned(&self, span: *mut Span, ptr: *mut u8) {
        unsafe {
            let block = Span::block_start(span, ptr);
            if Span::free_block_local(span, block) {
                // We took the span out of the full state: back on its list.
                self.owned().partial_spans[(*span).class.class_idx as usize].push(span);
            }
        }
    }

    /// Free a block of a multi-block span from a foreign thread: deferred
    /// push, no lock.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of `span`, which must belong to this
    /// arena.
    pub unsafe fn free_block_foreign(&self, span: *mut Span, ptr: *mut u8) {
        stat_inc!(deferred_frees);
        unsafe {
            let block = Span::block_start(span, ptr);
            if Span::free_block_deferred(span, block) {
                // Sole winner of the full -> not-full flip enqueues.
                self.deferred_partials[(*span).class.class_idx as usize].push(span);
            }
        }
    }

    /// Return a whole span (span-class or large block) to the caches. Safe
    /// from any thread: only producer ends are touched.
    ///
    /// # Safety
    ///
    /// `span` must hold no live blocks and belong to this arena.
    pub unsafe fn free_span(&self, span: *mut Span) {
        unsafe {
            let count = (*span).span_count as usize;
            if count == 1 {
                self.cache_span_or_free(span);
            } else if count <= LARGE_CLASS_COUNT {
                self.cache_large_span_or_free(span, RECYCLE_LARGE_SPANS);
            } else {
                self.free_span_to_backing(span);
            }
        }
    }

    /// Cache a single span, overflowing to the global cache, then to the
    /// backing allocator. Safe from any thread.
    unsafe fn cache_span_or_free(&self, span: *mut Span) {
        unsafe {
            if self.span_cache.try_write(SpanPtr(span)) {
                return;
            }
            if self.use_global_caches
                && (*span).span_count == 1
                && global_cache::cache_span(span)
            {
                // Orphaned: the adopter re-counts it.
                self.drop_mapped(1);
                return;
            }
            self.free_span_to_backing(span);
        }
    }

    /// Cache a large span; on overflow optionally recycle through the
    /// 1-span cache, then the global cache, then the backing allocator.
    /// Safe from any thread.
    unsafe fn cache_large_span_or_free(&self, span: *mut Span, recycle: bool) {
        unsafe {
            let count = (*span).span_count as usize;
            if self.large_caches[count - 2].try_write(SpanPtr(span)) {
                return;
            }
            if recycle && self.span_cache.try_write(SpanPtr(span)) {
                return;
            }
            if self.use_global_caches && global_cache::cache_large_span(span) {
                self.drop_mapped(count);
                return;
            }
            self.free_span_to_backing(span);
        }
    }

    unsafe fn free_span_to_backing(&self, span: *mut Span) {
        stat_inc!(backing_frees);
        unsafe {
            self.drop_mapped((*span).span_count as usize);
            let ptr = (*span).initial_ptr;
            let size = (*span).alloc_size;
            self.backing.raw_free(ptr, size);
        }
    }

    // ---- Teardown -------------------------------------------------------

    /// Drain every cache tier and free every reclaimable span. Returns the
    /// number of spans still mapped afterwards — those hold live user
    /// blocks (leaks, if the owner is going away).
    ///
    /// # Safety
    ///
    /// Writer lock held (or the arena otherwise quiescent); no concurrent
    /// cache producers.
    pub unsafe fn release_spans(&self) -> usize {
        unsafe {
            while let Some(p) = self.span_cache.try_read() {
                self.free_span_to_backing(p.0);
            }
            for ring in &self.large_caches {
                while let Some(p) = ring.try_read() {
                    self.free_span_to_backing(p.0);
                }
            }
            let owned = self.owned();
            for list in &mut owned.map_caches {
                loop {
                    let span = list.pop();
                    if span.is_null() {
                        break;
                    }
                    self.free_span_to_backing(span);
                }
            }
            for idx in 0..SIZE_CLASS_COUNT {
                let chain = self.deferred_partials[idx].take_all();
                let mut span = chain;
                while !span.is_null() {
                    let next = (*span).next;
                    Span::reclaim_deferred(span);
                    owned.partial_spans[idx].push(span);
                    span = next;
                }
                let list = &mut owned.partial_spans[idx];
                let mut span = list.head;
                while !span.is_null() {
                    let next = (*span).next;
                    Span::reclaim_deferred(span);
                    if (*span).is_empty() {
                        list.remove(span);
                        self.free_span_to_backing(span);
                    }
                    span = next;
                }
            }
            self.mapped_spans()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{OS_PAGE_ALLOCATOR, PageAllocator};
    use crate::config::{MEDIUM_MAX, SMALL_MAX, SPAN_EFFECTIVE_SIZE, SPAN_MAX};
    use crate::size_class::class_of;
    use crate::sync::SharedLock;
    use alloc::vec::Vec;

    fn make_arena() -> *mut Arena<SharedLock> {
        let arena = Arena::<SharedLock>::create(&OS_PAGE_ALLOCATOR, false);
        assert!(!arena.is_null());
        arena
    }

    /// Free every reclaimable span and assert nothing leaked.
    unsafe fn teardown(arena: *mut Arena<SharedLock>) {
        unsafe {
            assert_eq!((*arena).release_spans(), 0, "leaked spans at teardown");
            Arena::destroy(arena);
        }
    }

    #[test]
    fn small_allocations_round_trip() {
        let arena = make_arena();
        unsafe {
            let class = class_of(64);
            let a = (*arena).allocate_to_span(class);
            let b = (*arena).allocate_to_span(class);
            assert!(!a.is_null() && !b.is_null());
            assert_ne!(a, b);

            let span = crate::span::span_of(a);
            (*arena).free_block_owned(span, a);
            (*arena).free_block_owned(crate::span::span_of(b), b);
            teardown(arena);
        }
    }

    #[test]
    fn blocks_do_not_overlap_across_classes() {
        let arena = make_arena();
        unsafe {
            let mut live: Vec<(usize, usize)> = Vec::new();
            for &size in &[16usize, 48, 512, SMALL_MAX, SMALL_MAX + 1, 8192, MEDIUM_MAX] {
                let class = class_of(size);
                for _ in 0..5 {
                    let p = (*arena).allocate_to_span(class) as usize;
                    assert!(p != 0);
                    for &(q, qs) in &live {
                        assert!(p + size <= q || q + qs <= p, "overlap at {p:#x}");
                    }
                    live.push((p, size));
                }
            }
            for (p, _) in live {
                let span = crate::span::span_of(p as *mut u8);
                (*arena).free_block_owned(span, p as *mut u8);
            }
            teardown(arena);
        }
    }

    #[test]
    fn filling_a_span_rolls_to_a_new_one() {
        let arena = make_arena();
        unsafe {
            let class = class_of(SPAN_EFFECTIVE_SIZE / 8);
            let mut blocks = Vec::new();
            for _ in 0..(class.block_max as usize + 3) {
                let p = (*arena).allocate_to_span(class);
                assert!(!p.is_null());
                blocks.push(p);
            }
            // More blocks than one span holds: at least two distinct spans.
            let first = crate::span::span_of(blocks[0]);
            let last = crate::span::span_of(*blocks.last().unwrap());
            assert_ne!(first, last);

            for p in blocks {
                (*arena).free_block_owned(crate::span::span_of(p), p);
            }
            teardown(arena);
        }
    }

    #[test]
    fn empty_sweep_is_idempotent() {
        let arena = make_arena();
        unsafe {
            let class = class_of(128);
            let p = (*arena).allocate_to_span(class);
            (*arena).free_block_owned(crate::span::span_of(p), p);

            // First sweep demotes the now-empty span; the second finds
            // nothing.
            let first = (*arena).harvest_empty_span();
            assert!(!first.is_null());
            let second = (*arena).harvest_empty_span();
            assert!(second.is_null());

            (*arena).cache_span_or_free(first);
            teardown(arena);
        }
    }

    #[test]
    fn one_span_blocks_fill_a_span() {
        let arena = make_arena();
        unsafe {
            let p = (*arena).allocate_one_span();
            assert!(!p.is_null());
            let span = crate::span::span_of(p);
            assert_eq!((*span).span_count, 1);
            assert_eq!((*span).class.block_size as usize, SPAN_MAX);
            // Whole-block write must stay in bounds.
            core::ptr::write_bytes(p, 0x5A, SPAN_MAX);

            (*arena).free_span(span);
            teardown(arena);
        }
    }

    #[test]
    fn large_spans_cache_and_reuse() {
        let arena = make_arena();
        unsafe {
            let p = (*arena).allocate_to_large_span(3, 3);
            assert!(!p.is_null());
            let span = crate::span::span_of(p);
            assert_eq!((*span).span_count, 3);

            (*arena).free_span(span);

            // Identical request comes straight back from the large cache.
            let q = (*arena).allocate_to_large_span(3, 3);
            assert_eq!(q, p);
            (*arena).free_span(crate::span::span_of(q));
            teardown(arena);
        }
    }

    #[test]
    fn oversize_large_requests_tolerate_cached_spans() {
        let arena = make_arena();
        unsafe {
            let p = (*arena).allocate_to_large_span(4, 4);
            let span = crate::span::span_of(p);
            (*arena).free_span(span);

            // A request for 3 with one slot of tolerated overhead picks up
            // the cached 4-slot span whole.
            let q = (*arena).allocate_to_large_span(3, 4);
            let qspan = crate::span::span_of(q);
            assert_eq!(qspan, span);
            assert_eq!((*qspan).span_count, 4);
            (*arena).free_span(qspan);
            teardown(arena);
        }
    }

    #[test]
    fn huge_allocations_bypass_caches() {
        struct CountingBacking {
            allocs: AtomicUsize,
            frees: AtomicUsize,
        }
        impl PageAllocator for CountingBacking {
            fn raw_alloc(&self, size: usize) -> *mut u8 {
                self.allocs.fetch_add(1, Ordering::Relaxed);
                OS_PAGE_ALLOCATOR.raw_alloc(size)
            }
            unsafe fn raw_free(&self, ptr: *mut u8, size: usize) {
                self.frees.fetch_add(1, Ordering::Relaxed);
                unsafe { OS_PAGE_ALLOCATOR.raw_free(ptr, size) };
            }
        }
        static BACKING: CountingBacking = CountingBacking {
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        };

        let arena = Arena::<SharedLock>::create(&BACKING, false);
        assert!(!arena.is_null());
        let before_allocs = BACKING.allocs.load(Ordering::Relaxed);
        let before_frees = BACKING.frees.load(Ordering::Relaxed);
        unsafe {
            let size = crate::config::LARGE_MAX + 1;
            for _ in 0..3 {
                let p = (*arena).allocate_huge(size);
                assert!(!p.is_null());
                assert_eq!(p as usize % SPAN_SIZE, SPAN_HEADER_SIZE);
                let span = crate::span::span_of(p);
                (*arena).free_huge_span(span);
            }
            // One backing pair per allocation: no caching on the huge path.
            assert_eq!(BACKING.allocs.load(Ordering::Relaxed) - before_allocs, 3);
            assert_eq!(BACKING.frees.load(Ordering::Relaxed) - before_frees, 3);
            teardown(arena);
        }
    }

    #[test]
    fn foreign_frees_reconcile_through_deferred_partials() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize as StdAtomicUsize;

        struct SendArena(*mut Arena<SharedLock>);
        unsafe impl Send for SendArena {}
        unsafe impl Sync for SendArena {}

        let arena = make_arena();
        let class = class_of(64);
        let blocks: Vec<usize> = (0..class.block_max as usize)
            .map(|_| unsafe { (*arena).allocate_to_span(class) } as usize)
            .collect();
        let span = crate::span::span_of(blocks[0] as *mut u8);

        // Force the span through the full transition: the next allocation
        // marks it full, unlinks it, and rolls onto a fresh span.
        unsafe {
            let extra = (*arena).allocate_to_span(class);
            assert_ne!(crate::span::span_of(extra), span, "span should be full");
            (*arena).free_block_owned(crate::span::span_of(extra), extra);
            // Demote the now-empty fresh span so the next allocation is a
            // class miss and must drain the deferred-partial stack.
            let empty = (*arena).harvest_empty_span();
            assert!(!empty.is_null());
            (*arena).cache_span_or_free(empty);
        }

        let shared = Arc::new(SendArena(arena));
        let done = Arc::new(StdAtomicUsize::new(0));
        let mut handles = Vec::new();
        for chunk in blocks.chunks(blocks.len().div_ceil(4)) {
            let chunk: Vec<usize> = chunk.to_vec();
            let shared = Arc::clone(&shared);
            let done = Arc::clone(&done);
            handles.push(std::thread::spawn(move || {
                for b in chunk {
                    let b = b as *mut u8;
                    unsafe { (*shared.0).free_block_foreign(crate::span::span_of(b), b) };
                    done.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(done.load(Ordering::Relaxed), blocks.len());

        unsafe {
            // The next miss drains the deferred-partial stack and reuses
            // the foreign-freed blocks.
            let p = (*arena).allocate_to_span(class);
            assert_eq!(crate::span::span_of(p), span);
            (*arena).free_block_owned(span, p);
            teardown(arena);
        }
    }
}
