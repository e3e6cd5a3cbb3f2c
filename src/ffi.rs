//! C-ABI exports for external linking.
//!
//! Gated behind `features = ["ffi", "std"]`. A process-global thread-local
//! mode allocator backs the exports; the size argument to `sa_free` is a
//! hint, the span header is authoritative.

use crate::allocator::SpanAlloc;
use core::ffi::c_void;

static ALLOC: SpanAlloc = SpanAlloc::new();

/// C `malloc` alignment guarantee.
const MALLOC_ALIGN: usize = 16;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_malloc(size: usize) -> *mut c_void {
    ALLOC.allocate(size.max(1), MALLOC_ALIGN) as *mut c_void
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_aligned_alloc(align: usize, size: usize) -> *mut c_void {
    if !align.is_power_of_two() {
        return core::ptr::null_mut();
    }
    ALLOC.allocate(size.max(1), align.max(MALLOC_ALIGN)) as *mut c_void
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    unsafe { ALLOC.free(ptr as *mut u8, 0, 0) };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    unsafe { ALLOC.usable_size(ptr as *mut u8) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn sa_realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    if ptr.is_null() {
        return unsafe { sa_malloc(new_size) };
    }
    if new_size == 0 {
        unsafe { sa_free(ptr) };
        return core::ptr::null_mut();
    }
    let ptr = ptr as *mut u8;
    unsafe {
        let old_usable = ALLOC.usable_size(ptr);
        if ALLOC.resize(ptr, old_usable, new_size, MALLOC_ALIGN) {
            return ptr as *mut c_void;
        }
        let new_ptr = ALLOC.allocate(new_size, MALLOC_ALIGN);
        if !new_ptr.is_null() {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
            ALLOC.free(ptr, 0, 0);
        }
        new_ptr as *mut c_void
    }
}
