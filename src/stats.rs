//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The allocator's own locks and cache
//! sequences provide the ordering guarantees for correctness; these counters
//! are purely for monitoring.
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Facade ----
    /// Total calls to allocate with size > 0.
    pub alloc_count: AtomicU64,
    /// Total calls to free.
    pub free_count: AtomicU64,
    /// Total calls to resize/remap.
    pub resize_count: AtomicU64,
    /// Sum of all requested byte sizes passed to allocate.
    pub alloc_bytes: AtomicU64,

    // ---- Span sourcing tiers ----
    /// Spans served from an arena's 1-span cache.
    pub span_cache_hits: AtomicU64,
    /// Spans harvested empty out of an arena's partial lists.
    pub empty_harvests: AtomicU64,
    /// Spans served (possibly after splitting) from an arena's map cache.
    pub map_cache_hits: AtomicU64,
    /// Large spans served from an arena's large caches.
    pub large_cache_hits: AtomicU64,
    /// Spans served from the process-wide global caches.
    pub global_cache_hits: AtomicU64,

    // ---- Cross-thread frees ----
    /// Blocks pushed onto a deferred free list by a foreign thread.
    pub deferred_frees: AtomicU64,
    /// Whole deferred-partial chains drained back into partial lists.
    pub deferred_drains: AtomicU64,

    // ---- Backing allocator ----
    /// Calls into the backing page allocator.
    pub span_maps: AtomicU64,
    /// Bytes requested from the backing page allocator.
    pub span_map_bytes: AtomicU64,
    /// Times a multi-slot span was split.
    pub span_splits: AtomicU64,
    /// Spans (fragments) returned to the backing allocator.
    pub backing_frees: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            resize_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            span_cache_hits: AtomicU64::new(0),
            empty_harvests: AtomicU64::new(0),
            map_cache_hits: AtomicU64::new(0),
            large_cache_hits: AtomicU64::new(0),
            global_cache_hits: AtomicU64::new(0),
            deferred_frees: AtomicU64::new(0),
            deferred_drains: AtomicU64::new(0),
            span_maps: AtomicU64::new(0),
            span_map_bytes: AtomicU64::new(0),
            span_splits: AtomicU64::new(0),
            backing_frees: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Each field is atomically read, but the snapshot as a whole is not
/// globally consistent — concurrent allocations may race between loads.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Total calls to allocate with size > 0.
    pub alloc_count: u64,
    /// Total calls to free.
    pub free_count: u64,
    /// Total calls to resize/remap.
    pub resize_count: u64,
    /// Sum of all requested byte sizes passed to allocate.
    pub alloc_bytes: u64,
    /// Spans served from an arena's 1-span cache.
    pub span_cache_hits: u64,
    /// Spans harvested empty out of an arena's partial lists.
    pub empty_harvests: u64,
    /// Spans served (possibly after splitting) from an arena's map cache.
    pub map_cache_hits: u64,
    /// Large spans served from an arena's large caches.
    pub large_cache_hits: u64,
    /// Spans served from the process-wide global caches.
    pub global_cache_hits: u64,
    /// Blocks pushed onto a deferred free list by a foreign thread.
    pub deferred_frees: u64,
    /// Whole deferred-partial chains drained back into partial lists.
    pub deferred_drains: u64,
    /// Calls into the backing page allocator.
    pub span_maps: u64,
    /// Bytes requested from the backing page allocator.
    pub span_map_bytes: u64,
    /// Times a multi-slot span was split.
    pub span_splits: u64,
    /// Spans (fragments) returned to the backing allocator.
    pub backing_frees: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        free_count: s.free_count.load(Ordering::Relaxed),
        resize_count: s.resize_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        span_cache_hits: s.span_cache_hits.load(Ordering::Relaxed),
        empty_harvests: s.empty_harvests.load(Ordering::Relaxed),
        map_cache_hits: s.map_cache_hits.load(Ordering::Relaxed),
        large_cache_hits: s.large_cache_hits.load(Ordering::Relaxed),
        global_cache_hits: s.global_cache_hits.load(Ordering::Relaxed),
        deferred_frees: s.deferred_frees.load(Ordering::Relaxed),
        deferred_drains: s.deferred_drains.load(Ordering::Relaxed),
        span_maps: s.span_maps.load(Ordering::Relaxed),
        span_map_bytes: s.span_map_bytes.load(Ordering::Relaxed),
        span_splits: s.span_splits.load(Ordering::Relaxed),
        backing_frees: s.backing_frees.load(Ordering::Relaxed),
    }
}
