//! Miri-compatible platform shim using std::alloc as backing store.
//!
//! Miri can't execute real OS syscalls (mmap/VirtualAlloc), so we use the
//! system allocator to provide page-aligned memory. This lets Miri check
//! all the unsafe pointer logic in the allocator internals.

extern crate alloc;

use core::alloc::Layout;

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let layout = Layout::from_size_align(size, crate::config::PAGE_SIZE).unwrap();
    unsafe { alloc::alloc::alloc_zeroed(layout) }
}

pub unsafe fn page_dealloc(_ptr: *mut u8, _size: usize) {
    // Frees may be fragments of a reservation, which std::alloc cannot
    // express (dealloc needs the original base and layout). Leak under
    // Miri; the checker's interest is the pointer logic, not the RSS.
}
