//! Windows virtual memory implementation using VirtualAlloc/VirtualFree.
//!
//! Windows' allocation granularity is 64 KiB, so reservations come back
//! span-aligned and the arena never needs front padding here. MEM_RELEASE
//! only accepts an allocation's base address: releasing a split fragment
//! whose base is interior fails and the memory stays mapped until process
//! exit. That is a platform limitation, surfaced as a warning.

use core::ptr;
use winapi::shared::minwindef::LPVOID;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let raw = unsafe {
        VirtualAlloc(
            ptr::null_mut(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    raw as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    // MEM_RELEASE requires dwSize = 0 (releases the entire allocation).
    if unsafe { VirtualFree(ptr as LPVOID, 0, MEM_RELEASE) } == 0 {
        log::warn!("VirtualFree failed, addr {:p}, size {}", ptr, size);
    }
}
