//! The platform-facing memory pool.
//!
//! Allocations are anonymous private mappings, aligned to at least the
//! OS page size and zero-filled by the kernel. A NUMA hint binds the
//! region to the calling thread's node (Linux only; elsewhere the hint
//! is ignored). Every allocation is recorded in a thread-local ownership
//! set so that frees issued by the owning thread skip the process-wide
//! free lock; cross-thread frees and protection changes serialise on two
//! dedicated mutexes and nothing else.

use std::cell::RefCell;
use std::ptr::NonNull;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::error::{Error, Result};
use crate::mem::slab::Slab;
use crate::mem::os_page_size;

/// Serialises frees of buffers not owned by the calling thread.
static FREE_LOCK: Mutex<()> = Mutex::new(());

/// Serialises protection changes.
static PROTECT_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    /// Base addresses of mappings created by this thread.
    static OWNED: RefCell<FxHashSet<usize>> = RefCell::new(FxHashSet::default());
}

/// Access mode for [`protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Reads allowed, writes fault.
    ReadOnly,
    /// Reads and writes allowed.
    ReadWrite,
}

/// Stateless facade over the platform allocator.
///
/// All methods are associated functions; the per-thread ownership table
/// and the two process-wide locks are module state.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPool;

impl MemoryPool {
    /// Allocates a page-aligned, zero-filled slab of at least `bytes`.
    ///
    /// With `numa_node` set, the region is bound to that node via
    /// `mbind` on Linux; on other platforms the hint is a no-op.
    pub fn allocate(bytes: usize, numa_node: Option<u32>) -> Result<Slab> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("cannot allocate zero bytes".into()));
        }
        let len = round_up(bytes, os_page_size());
        let ptr = map_anonymous(len).ok_or(Error::OutOfMemory(len))?;

        if let Some(node) = numa_node {
            if let Err(err) = bind_to_node(ptr.as_ptr(), len, node) {
                tracing::warn!(node, %err, "NUMA bind failed, keeping unbound mapping");
            }
        }

        OWNED.with(|set| set.borrow_mut().insert(ptr.as_ptr() as usize));
        tracing::debug!(bytes = len, numa = ?numa_node, "allocated slab");
        Ok(Slab::from_raw(ptr, len))
    }

    /// Releases a mapping previously produced by [`MemoryPool::allocate`].
    ///
    /// Fast-path: a buffer owned by the calling thread is unmapped
    /// without taking any lock. Cross-thread releases serialise on the
    /// free lock.
    pub(crate) fn free(ptr: NonNull<u8>, len: usize) {
        let addr = ptr.as_ptr() as usize;
        let local = OWNED.with(|set| set.borrow_mut().remove(&addr));
        if local {
            unmap(ptr, len);
        } else {
            let _guard = FREE_LOCK.lock();
            unmap(ptr, len);
        }
    }

    /// Returns `true` if the calling thread created this mapping.
    pub fn is_thread_local(ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        OWNED.with(|set| set.borrow().contains(&addr))
    }
}

/// Changes the protection of `len` bytes starting at `ptr`.
///
/// `ptr` must be page-aligned and refer to a live mapping.
pub fn protect(ptr: NonNull<u8>, len: usize, mode: Protection) -> Result<()> {
    let flags = match mode {
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    let _guard = PROTECT_LOCK.lock();
    // SAFETY: caller guarantees the region is a live, page-aligned mapping.
    let rc = unsafe { libc::mprotect(ptr.as_ptr().cast(), len, flags) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::error!(%err, "mprotect failed");
        return Err(Error::InvalidArgument(format!("mprotect failed: {err}")));
    }
    Ok(())
}

/// Returns the bytes of physical memory currently available.
pub fn available_bytes() -> usize {
    // SAFETY: sysconf has no preconditions.
    unsafe {
        let pages = libc::sysconf(libc::_SC_AVPHYS_PAGES);
        let page_size = libc::sysconf(libc::_SC_PAGE_SIZE);
        if pages <= 0 || page_size <= 0 {
            0
        } else {
            pages as usize * page_size as usize
        }
    }
}

/// Probes for the largest mappable contiguous block.
///
/// Doubles the probe size from 1 MiB until a mapping fails and reports
/// the last size that succeeded. Fails only if the very first probe
/// fails.
pub fn largest_contiguous() -> Result<usize> {
    const START: usize = 1024 * 1024;

    let mut size = START;
    let mut best = 0usize;
    loop {
        match map_anonymous(size) {
            Some(ptr) => {
                unmap(ptr, size);
                best = size;
                size = match size.checked_mul(2) {
                    Some(next) => next,
                    None => break,
                };
            }
            None if best == 0 => return Err(Error::OutOfMemory(size)),
            None => break,
        }
    }
    Ok(best)
}

#[inline]
fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

fn map_anonymous(len: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping with no address hint.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }

    // Hint THP for large regions (best-effort, Linux only).
    #[cfg(target_os = "linux")]
    if len >= 2 * 1024 * 1024 {
        // SAFETY: region was just mapped.
        unsafe {
            let _ = libc::madvise(ptr, len, libc::MADV_HUGEPAGE);
        }
    }

    NonNull::new(ptr.cast())
}

fn unmap(ptr: NonNull<u8>, len: usize) {
    // SAFETY: ptr/len came from a successful mmap of exactly this length.
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    debug_assert_eq!(rc, 0, "munmap failed");
}

/// Binds `[ptr, ptr+len)` to a NUMA node with `MPOL_BIND`.
#[cfg(target_os = "linux")]
fn bind_to_node(ptr: *mut u8, len: usize, node: u32) -> std::io::Result<()> {
    const MPOL_BIND: libc::c_int = 2;
    const MPOL_MF_MOVE: libc::c_uint = 1 << 1;

    let mut nodemask: libc::c_ulong = 1 << node;
    // SAFETY: the region is a live mapping owned by this call chain.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            len,
            MPOL_BIND,
            &mut nodemask as *mut libc::c_ulong,
            // maxnode must exceed the highest set bit
            (node + 2) as libc::c_ulong,
            MPOL_MF_MOVE,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_ptr: *mut u8, _len: usize, _node: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_page_aligned_and_zeroed() {
        let slab = MemoryPool::allocate(10_000, None).unwrap();
        assert_eq!(slab.as_ptr() as usize % os_page_size(), 0);
        assert!(slab.len() >= 10_000);
        // Kernel-provided zero fill.
        let bytes = unsafe { std::slice::from_raw_parts(slab.as_ptr(), slab.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_byte_allocation_is_rejected() {
        assert!(MemoryPool::allocate(0, None).is_err());
    }

    #[test]
    fn ownership_tracks_allocating_thread() {
        let slab = MemoryPool::allocate(4096, None).unwrap();
        let ptr = NonNull::new(slab.as_ptr()).unwrap();
        assert!(MemoryPool::is_thread_local(ptr));

        std::thread::spawn(move || {
            let ptr = NonNull::new(slab.as_ptr()).unwrap();
            assert!(!MemoryPool::is_thread_local(ptr));
            drop(slab); // cross-thread free takes the locked path
        })
        .join()
        .unwrap();
    }

    #[test]
    fn protect_round_trip() {
        let slab = MemoryPool::allocate(4096, None).unwrap();
        let ptr = NonNull::new(slab.as_ptr()).unwrap();
        protect(ptr, slab.len(), Protection::ReadOnly).unwrap();
        protect(ptr, slab.len(), Protection::ReadWrite).unwrap();
        unsafe { slab.as_ptr().write(7) };
    }

    #[test]
    fn available_bytes_is_nonzero() {
        assert!(available_bytes() > 0);
    }

    #[test]
    fn largest_contiguous_reports_at_least_a_megabyte() {
        assert!(largest_contiguous().unwrap() >= 1024 * 1024);
    }
}
