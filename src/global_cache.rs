//! Process-wide span caches.
//!
//! Two MPMC tiers mirroring the per-arena caches: one ring of single spans
//! and one ring per large class. Arenas in thread-local handler mode
//! overflow into these before resorting to a backing free, and consult them
//! before mapping fresh memory. (Shared-mode arenas are themselves pooled,
//! so they skip this tier.)
//!
//! Spans parked here are orphans: they belong to no arena until an arena
//! pops and adopts them. The leak bookkeeping hand-off happens at the
//! arena's push/pop sites.

use crate::config::{CACHE_LIMIT, GLOBAL_CACHE_MULTIPLIER, LARGE_CACHE_LIMIT, LARGE_CLASS_COUNT};
use crate::queue::BoundedMpmcQueue;
use crate::span::{Span, SpanPtr};

const GLOBAL_SPAN_CACHE_SIZE: usize = CACHE_LIMIT * GLOBAL_CACHE_MULTIPLIER;
const GLOBAL_LARGE_CACHE_SIZE: usize = LARGE_CACHE_LIMIT * GLOBAL_CACHE_MULTIPLIER;

struct GlobalCaches {
    span_cache: BoundedMpmcQueue<SpanPtr, GLOBAL_SPAN_CACHE_SIZE>,
    large_caches: [BoundedMpmcQueue<SpanPtr, GLOBAL_LARGE_CACHE_SIZE>; LARGE_CLASS_COUNT - 1],
}

static GLOBAL_CACHES: GlobalCaches = GlobalCaches {
    span_cache: BoundedMpmcQueue::new(),
    large_caches: [const { BoundedMpmcQueue::new() }; LARGE_CLASS_COUNT - 1],
};

/// Park a single span. Returns false when the ring is full.
pub fn cache_span(span: *mut Span) -> bool {
    GLOBAL_CACHES.span_cache.try_write(SpanPtr(span))
}

/// Take a single span, if any.
pub fn get_span() -> Option<*mut Span> {
    GLOBAL_CACHES.span_cache.try_read().map(|p| p.0)
}

/// Park a large span (2..=LARGE_CLASS_COUNT slots). Returns false when its
/// class ring is full.
pub fn cache_large_span(span: *mut Span) -> bool {
    let count = unsafe { (*span).span_count } as usize;
    debug_assert!((2..=LARGE_CLASS_COUNT).contains(&count));
    GLOBAL_CACHES.large_caches[count - 2].try_write(SpanPtr(span))
}

/// Take a large span of between `count` and `max_count` slots, if any.
pub fn get_large_span(count: usize, max_count: usize) -> Option<*mut Span> {
    for k in count..=max_count.min(LARGE_CLASS_COUNT) {
        if let Some(p) = GLOBAL_CACHES.large_caches[k - 2].try_read() {
            return Some(p.0);
        }
    }
    None
}

/// Drain every parked span through `f` (called once per span). Used by
/// handler teardown to return orphans to the backing allocator; callers
/// must be quiescent with respect to other cache users.
pub(crate) fn drain(mut f: impl FnMut(*mut Span)) {
    while let Some(p) = GLOBAL_CACHES.span_cache.try_read() {
        f(p.0);
    }
    for ring in &GLOBAL_CACHES.large_caches {
        while let Some(p) = ring.try_read() {
            f(p.0);
        }
    }
}
