#![no_std]

//! spanalloc: a span-based concurrent memory allocator for Rust.
//!
//! Memory is managed in fixed-size, address-aligned *spans* (64 KiB by
//! default) carved into size-class blocks. Three tiers:
//! - Per-thread (or shared-pool) arenas with lock-free fast paths
//! - Deferred cross-thread free lists (no global locks on the hot path)
//! - Tiered span caches (per-arena and process-wide) over the OS page
//!   allocator
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: spanalloc::SpanAlloc = spanalloc::SpanAlloc::new();
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod arena;
pub mod backing;
#[cfg(all(feature = "ffi", feature = "std"))]
pub mod ffi;
pub mod global_cache;
pub mod handler;
pub mod platform;
pub mod queue;
pub mod size_class;
pub mod span;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;

mod macros;

/// Build-time configuration constants, generated by build.rs from an
/// optional `spanalloc.toml` (override the path with `SPANALLOC_CONFIG`).
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));
}

// Re-export the allocator facade at crate root for convenience
pub use allocator::{Error, SharedSpanAlloc, SpanAlloc, SpanAllocator};

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
