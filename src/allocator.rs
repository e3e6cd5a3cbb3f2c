//! The allocator facade: size/alignment dispatch over an arena handler.
//!
//! [`SpanAllocator`] is generic over the [`Handler`] strategy; the
//! [`SpanAlloc`] alias picks the thread-local handler (the default mode)
//! and [`SharedSpanAlloc`] the pooled one. All entry points collapse
//! internal contention and cache misses by falling one tier down; the only
//! failures surfaced are out-of-memory and unsupported alignment, both as
//! null (or typed through [`SpanAllocator::try_allocate`]).

use crate::arena::Arena;
use crate::config::{
    LARGE_MAX, LARGE_SPAN_OVERHEAD_MUL, MEDIUM_MAX, PAGE_SIZE, SMALL_GRANULARITY, SPAN_MAX,
    SPAN_SIZE,
};
use crate::handler::{Handler, SharedHandler};
use crate::size_class::{self, HUGE_CLASS_IDX};
use crate::span::{Span, span_of};
use crate::sync::WriterLock;
use crate::{stat_add, stat_inc};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

#[cfg(feature = "std")]
use crate::handler::ThreadLocalHandler;

/// Allocation failure taxonomy. Hot paths report these as null; the typed
/// surface is [`SpanAllocator::try_allocate`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// The backing allocator failed, or size arithmetic overflowed.
    OutOfMemory,
    /// Alignment at or above the span size is not supported.
    InvalidAlignment,
}

/// Span-based allocator over an arena handler.
pub struct SpanAllocator<H: Handler> {
    handler: H,
}

/// The default allocator: one arena per thread.
#[cfg(feature = "std")]
pub type SpanAlloc = SpanAllocator<ThreadLocalHandler>;

/// The default allocator in no_std builds: pooled arenas.
#[cfg(not(feature = "std"))]
pub type SpanAlloc = SpanAllocator<SharedHandler>;

/// Allocator over a shared arena pool.
pub type SharedSpanAlloc = SpanAllocator<SharedHandler>;

#[cfg(feature = "std")]
impl SpanAllocator<ThreadLocalHandler> {
    pub const fn new() -> Self {
        Self {
            handler: ThreadLocalHandler::new(),
        }
    }

    pub const fn with_backing(backing: &'static dyn crate::backing::PageAllocator) -> Self {
        Self {
            handler: ThreadLocalHandler::with_backing(backing),
        }
    }
}

#[cfg(feature = "std")]
impl Default for SpanAllocator<ThreadLocalHandler> {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanAllocator<SharedHandler> {
    pub const fn new_shared() -> Self {
        Self {
            handler: SharedHandler::new(),
        }
    }

    pub const fn shared_with_backing(backing: &'static dyn crate::backing::PageAllocator) -> Self {
        Self {
            handler: SharedHandler::with_backing(backing),
        }
    }
}

impl<H: Handler> SpanAllocator<H> {
    pub const fn with_handler(handler: H) -> Self {
        Self { handler }
    }

    /// Allocate `size` bytes at `align` (a power of two). Null on failure.
    /// Zero-size requests are served as one byte.
    pub fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());
        let size = size.max(1);
        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);

        if align <= SMALL_GRANULARITY {
            return self.allocate_sized(size);
        }
        if align >= SPAN_SIZE {
            return ptr::null_mut();
        }

        // Over-aligned: over-allocate by the alignment, then slide the
        // block pointer up to the boundary. The span remembers that block
        // starts are no longer on the class stride.
        let Some(combined) = size.checked_add(align) else {
            return ptr::null_mut();
        };
        let p = self.allocate_sized(combined);
        if p.is_null() {
            return p;
        }
        let aligned = ((p as usize + align - 1) & !(align - 1)) as *mut u8;
        if aligned != p {
            unsafe {
                (*span_of(p))
                    .aligned_blocks
                    .store(true, core::sync::atomic::Ordering::Relaxed);
            }
        }
        aligned
    }

    /// Typed allocation front end.
    pub fn try_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, Error> {
        if align >= SPAN_SIZE {
            return Err(Error::InvalidAlignment);
        }
        NonNull::new(self.allocate(size, align)).ok_or(Error::OutOfMemory)
    }

    /// Route a request by size regime through an acquired arena.
    fn allocate_sized(&self, size: usize) -> *mut u8 {
        let arena = self.handler.acquire_arena();
        if arena.is_null() {
            return ptr::null_mut();
        }
        let p = unsafe {
            if size <= MEDIUM_MAX {
                (*arena).allocate_to_span(size_class::class_of(size))
            } else if size <= SPAN_MAX {
                (*arena).allocate_one_span()
            } else if size <= LARGE_MAX {
                let count = size_class::large_span_count(size);
                let max_count = count + (count as f64 * LARGE_SPAN_OVERHEAD_MUL) as usize;
                (*arena).allocate_to_large_span(count, max_count)
            } else {
                (*arena).allocate_huge(size)
            }
        };
        self.handler.release_arena(arena);
        p
    }

    /// Free a block. `size` and `align` are hints; dispatch is canonical
    /// through the block's span header, except that a huge-sized hint
    /// routes straight to the one-reservation free.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block returned by this allocator, with `size`
    /// no larger than the size class it was allocated under.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize, align: usize) {
        stat_inc!(free_count);
        let _ = align;
        if ptr.is_null() {
            return;
        }
        unsafe {
            let span = span_of(ptr);
            let arena = (*span).arena as *mut Arena<H::Lock>;

            if size > LARGE_MAX || (*span).class.class_idx == HUGE_CLASS_IDX {
                (*arena).free_huge_span(span);
                return;
            }

            if (*span).class.is_multi_block() {
                if (*arena).lock.try_acquire() {
                    (*arena).free_block_owned(span, ptr);
                    (*arena).lock.release();
                } else {
                    (*arena).free_block_foreign(span, ptr);
                }
            } else {
                // Whole-span block: producer-safe from any thread.
                (*arena).free_span(span);
            }
        }
    }

    /// Grow or shrink in place. True iff `ptr` still holds `new_size`
    /// bytes afterwards; the first `min(old_size, new_size)` bytes are
    /// untouched either way.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this allocator sized `old_size`.
    pub unsafe fn resize(&self, ptr: *mut u8, old_size: usize, new_size: usize, align: usize) -> bool {
        stat_inc!(resize_count);
        if ptr.is_null() || new_size == 0 {
            return false;
        }
        if align > 1 && (ptr as usize) & (align - 1) != 0 {
            return false;
        }
        unsafe {
            let span = span_of(ptr);
            let class = (*span).class;

            if old_size > LARGE_MAX || class.class_idx == HUGE_CLASS_IDX {
                if class.class_idx != HUGE_CLASS_IDX {
                    return false;
                }
                // In place up to the page-aligned ceiling of the current
                // buffer, never past the reservation itself.
                let ceiling = ((old_size - 1) / PAGE_SIZE) * PAGE_SIZE + PAGE_SIZE;
                let available = (*span).alloc_size - (ptr as usize - (*span).initial_ptr as usize);
                return new_size <= ceiling && new_size <= available;
            }
            if new_size > LARGE_MAX {
                return false;
            }

            if class.is_multi_block() {
                let block = Span::block_start(span, ptr);
                let offset = ptr as usize - block as usize;
                offset + new_size <= class.block_size as usize
            } else {
                // Span-class and large blocks: room to the end of the
                // span's owned reservation share.
                let used = ptr as usize - (*span).initial_ptr as usize;
                new_size <= (*span).alloc_size - used
            }
        }
    }

    /// In-place remap: `ptr` when `resize` succeeds, null otherwise (the
    /// caller then allocates, copies, and frees).
    ///
    /// # Safety
    ///
    /// Same contract as [`SpanAllocator::resize`].
    pub unsafe fn remap(&self, ptr: *mut u8, old_size: usize, new_size: usize, align: usize) -> *mut u8 {
        if unsafe { self.resize(ptr, old_size, new_size, align) } {
            ptr
        } else {
            ptr::null_mut()
        }
    }

    /// Drain every cache back to the backing allocator and return the
    /// number of spans still holding live blocks. Zero means nothing would
    /// be reported as leaked if the allocator were dropped now.
    pub fn leaked_spans(&mut self) -> usize {
        self.handler.leaked_spans()
    }

    /// Bytes actually usable behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this allocator.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        unsafe {
            let span = span_of(ptr);
            let class = (*span).class;
            if class.is_multi_block() {
                let block = Span::block_start(span, ptr);
                class.block_size as usize - (ptr as usize - block as usize)
            } else {
                (*span).alloc_size - (ptr as usize - (*span).initial_ptr as usize)
            }
        }
    }
}

unsafe impl<H: Handler> GlobalAlloc for SpanAllocator<H> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }
        self.allocate(size, layout.align())
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        unsafe { self.free(ptr, layout.size(), layout.align()) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }

        if unsafe { self.resize(ptr, layout.size(), new_size, layout.align()) } {
            return ptr;
        }

        // Must move: allocate, copy, free. The real usable size bounds the
        // copy — the caller's layout may be stale after in-place shrinks.
        let old_usable = unsafe { self.usable_size(ptr) };
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
                self.free(ptr, layout.size(), layout.align());
            }
        }
        new_ptr
    }
}
