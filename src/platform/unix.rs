//! Unix virtual memory implementation using mmap/munmap.

use core::ptr;
use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void};

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == MAP_FAILED {
        return ptr::null_mut();
    }
    raw as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    if unsafe { libc::munmap(ptr as *mut c_void, size) } != 0 {
        log::warn!(
            "munmap failed: {}, addr {:p}, size {}",
            errno::errno(),
            ptr,
            size
        );
    }
}
