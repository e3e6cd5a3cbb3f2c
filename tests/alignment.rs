//! Alignment edge case tests.
//!
//! Verifies that allocations respect alignment requirements for various
//! alignment values, including over-aligned allocations, with the
//! allocator installed as the global allocator.

use spanalloc::SpanAlloc;
use std::alloc::{GlobalAlloc, Layout};

#[global_allocator]
static GLOBAL: SpanAlloc = SpanAlloc::new();

#[test]
fn test_standard_alignments() {
    for align in [1, 2, 4, 8, 16] {
        for &size in &[1, 7, 8, 15, 16, 31, 64, 255, 256, 1024, 4096] {
            if size < align {
                continue;
            }
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed: size={size}, align={align}");
            assert_eq!(
                ptr as usize % align,
                0,
                "misaligned: ptr={ptr:?}, size={size}, align={align}"
            );
            // Write to verify it's usable
            unsafe { ptr.write_bytes(0xAB, size) };
            unsafe { GLOBAL.dealloc(ptr, layout) };
        }
    }
}

#[test]
fn test_over_aligned_small_and_medium() {
    for align in [32usize, 64, 128, 256, 1024] {
        for &size in &[32usize, 192, 256, 1024, 4096, 20_000] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed: size={size}, align={align}");
            assert_eq!(
                ptr as usize % align,
                0,
                "misaligned: ptr={ptr:?}, size={size}, align={align}"
            );
            unsafe { ptr.write_bytes(0xCD, size) };
            unsafe { GLOBAL.dealloc(ptr, layout) };
        }
    }
}

#[test]
fn test_over_aligned_consecutive_are_disjoint() {
    // Three sequential 192-byte allocations at align 64 must all succeed
    // and not overlap.
    let layout = Layout::from_size_align(192, 64).unwrap();
    let ptrs: Vec<*mut u8> = (0..3)
        .map(|_| {
            let p = unsafe { GLOBAL.alloc(layout) };
            assert!(!p.is_null());
            assert_eq!(p as usize % 64, 0);
            unsafe { p.write_bytes(0xEE, 192) };
            p
        })
        .collect();

    for (i, &p) in ptrs.iter().enumerate() {
        for &q in &ptrs[i + 1..] {
            let (p, q) = (p as usize, q as usize);
            assert!(p + 192 <= q || q + 192 <= p, "overlap: {p:#x} and {q:#x}");
        }
    }

    for p in ptrs {
        unsafe { GLOBAL.dealloc(p, layout) };
    }
}

#[test]
fn test_large_alignments_on_big_blocks() {
    // Alignments up to half a span on span-filling and multi-span sizes.
    for align in [4096usize, 16384, 32768] {
        for &size in &[40_000usize, 65_000, 200_000] {
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = unsafe { GLOBAL.alloc(layout) };
            assert!(!ptr.is_null(), "alloc failed: size={size}, align={align}");
            assert_eq!(ptr as usize % align, 0);
            unsafe {
                *ptr = 0x11;
                *ptr.add(size - 1) = 0x22;
                assert_eq!(*ptr, 0x11);
                assert_eq!(*ptr.add(size - 1), 0x22);
                GLOBAL.dealloc(ptr, layout);
            }
        }
    }
}

#[test]
fn test_alloc_zeroed_is_zeroed() {
    // Recycled blocks are dirty; alloc_zeroed must scrub them.
    let layout = Layout::from_size_align(512, 8).unwrap();
    let p = unsafe { GLOBAL.alloc(layout) };
    unsafe {
        p.write_bytes(0xFF, 512);
        GLOBAL.dealloc(p, layout);
        let q = GLOBAL.alloc_zeroed(layout);
        for i in 0..512 {
            assert_eq!(*q.add(i), 0, "dirty byte at {i}");
        }
        GLOBAL.dealloc(q, layout);
    }
}
