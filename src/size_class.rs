//! Size-class mapping.
//!
//! Requests are bucketed into five regimes by size:
//! - small: granular multiples of `SMALL_GRANULARITY` up to `SMALL_MAX`
//! - medium: multiples of `MEDIUM_GRANULARITY` up to `MEDIUM_MAX`
//! - span: one block filling a single span, up to `SPAN_MAX`
//! - large: one block spanning 2..=`LARGE_CLASS_COUNT` consecutive spans
//! - huge: direct backing-allocator call, one allocation one span
//!
//! Small and medium classes share one index space (`0..SIZE_CLASS_COUNT`)
//! used for the arena's partial lists.

use crate::config::{
    MEDIUM_GRANULARITY_SHIFT, MEDIUM_MAX, SIZE_CLASS_COUNT, SMALL_CLASS_COUNT,
    SMALL_GRANULARITY_SHIFT, SMALL_MAX, SPAN_EFFECTIVE_SIZE, SPAN_HEADER_SIZE, SPAN_SIZE,
};

/// Class index used for spans that hold exactly one block (span regime,
/// large regime). Never indexes a partial list.
pub const SPAN_CLASS_IDX: u16 = SIZE_CLASS_COUNT as u16;

/// Class index marking a huge span. `block_size` is unused (0) for these;
/// sizing comes from the span's reservation fields.
pub const HUGE_CLASS_IDX: u16 = SIZE_CLASS_COUNT as u16 + 1;

/// A size class: the block layout of a span.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct SizeClass {
    /// Block stride in bytes. All allocations in this class are rounded up
    /// to this size.
    pub block_size: u32,
    /// Number of blocks that fit in one span of this class.
    pub block_max: u16,
    /// Index into the arena's partial lists (or a sentinel for one-block
    /// regimes).
    pub class_idx: u16,
}

impl SizeClass {
    /// Whether spans of this class carve multiple blocks (and therefore
    /// live on a partial list).
    #[inline]
    pub fn is_multi_block(&self) -> bool {
        self.block_max > 1
    }
}

/// Class for a small request, `1..=SMALL_MAX`.
#[inline]
pub fn small_class(size: usize) -> SizeClass {
    debug_assert!(size >= 1 && size <= SMALL_MAX);
    let idx = (size - 1) >> SMALL_GRANULARITY_SHIFT;
    let block_size = (idx + 1) << SMALL_GRANULARITY_SHIFT;
    SizeClass {
        block_size: block_size as u32,
        block_max: (SPAN_EFFECTIVE_SIZE / block_size) as u16,
        class_idx: idx as u16,
    }
}

/// Class for a medium request, `SMALL_MAX+1..=MEDIUM_MAX`.
#[inline]
pub fn medium_class(size: usize) -> SizeClass {
    debug_assert!(size > SMALL_MAX && size <= MEDIUM_MAX);
    let midx = (size - SMALL_MAX - 1) >> MEDIUM_GRANULARITY_SHIFT;
    let block_size = SMALL_MAX + ((midx + 1) << MEDIUM_GRANULARITY_SHIFT);
    SizeClass {
        block_size: block_size as u32,
        block_max: (SPAN_EFFECTIVE_SIZE / block_size) as u16,
        class_idx: (SMALL_CLASS_COUNT + midx) as u16,
    }
}

/// Class for any multi-block request, `1..=MEDIUM_MAX`.
#[inline]
pub fn class_of(size: usize) -> SizeClass {
    if size <= SMALL_MAX {
        small_class(size)
    } else {
        medium_class(size)
    }
}

/// Class for a request that takes a whole single span.
#[inline]
pub const fn span_class() -> SizeClass {
    SizeClass {
        block_size: SPAN_EFFECTIVE_SIZE as u32,
        block_max: 1,
        class_idx: SPAN_CLASS_IDX,
    }
}

/// Class for a large span of `count` slots, carrying its usable byte size.
#[inline]
pub fn large_class(count: u32) -> SizeClass {
    SizeClass {
        block_size: (count as usize * SPAN_SIZE - SPAN_HEADER_SIZE) as u32,
        block_max: 1,
        class_idx: SPAN_CLASS_IDX,
    }
}

/// Class marker for a huge span. Sizing lives in the span's reservation
/// fields, not here.
#[inline]
pub const fn huge_class() -> SizeClass {
    SizeClass {
        block_size: 0,
        block_max: 1,
        class_idx: HUGE_CLASS_IDX,
    }
}

/// Number of consecutive span slots needed to hold a large request of
/// `size` bytes plus the span header.
#[inline]
pub fn large_span_count(size: usize) -> usize {
    (size + SPAN_HEADER_SIZE).div_ceil(SPAN_SIZE)
}
