//! Platform memory: page-aligned slab allocation, protection changes,
//! and capacity probes.
//!
//! [`pool`] talks to the platform (`mmap`/`mprotect`/`mbind`);
//! [`slab`] is the RAII handle for one contiguous allocation.

pub mod pool;
pub mod slab;

pub use pool::{available_bytes, largest_contiguous, protect, MemoryPool, Protection};
pub use slab::Slab;

/// Returns the operating system page size in bytes.
pub fn os_page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
