//! Frames and the frame table.
//!
//! A frame is one page-sized slot inside a slab. It records which page
//! currently occupies it and whether those bytes diverge from the store.
//! Frames come in two shapes chosen per ball at creation: plain frames
//! rely on the single-writer discipline (only the thread that faulted
//! the page, or the worker, writes), lockable frames carry a mutex
//! guarding both the data bytes and the dirty flag. One concrete type
//! covers both; the mutex is simply absent on plain frames, so the hot
//! path pays no dispatch.
//!
//! The table is grow-only: adaptive pool expansion appends frames and
//! never moves existing ones, so `Arc<Frame>` handles held by concurrent
//! readers stay valid across growth.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::mem::Slab;
use crate::PageId;

/// Sentinel for a frame with no resident page.
const NO_PAGE: u64 = u64::MAX;

/// One fixed-size slot inside a slab.
pub struct Frame {
    base: NonNull<u8>,
    size: usize,
    /// Page id occupying this frame, or [`NO_PAGE`].
    page: AtomicU64,
    dirty: AtomicBool,
    /// Present only on lockable frames; guards data bytes and the dirty
    /// flag together.
    lock: Option<Mutex<()>>,
}

// SAFETY: the pointed-to bytes live in a slab owned by the same ball and
// outlive every frame handle; cross-thread access to the bytes is
// serialised by the frame mutex or by the single-writer discipline.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    fn new(base: NonNull<u8>, size: usize, lockable: bool) -> Self {
        Self {
            base,
            size,
            page: AtomicU64::new(NO_PAGE),
            dirty: AtomicBool::new(false),
            lock: lockable.then(|| Mutex::new(())),
        }
    }

    /// Base pointer of the frame's bytes.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Frame size in bytes (the ball's page size).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Page currently occupying the frame.
    pub fn page(&self) -> Option<PageId> {
        match self.page.load(Ordering::Acquire) {
            NO_PAGE => None,
            page => Some(page),
        }
    }

    /// Binds the frame to `page` (or clears it with `None`).
    pub fn set_page(&self, page: Option<PageId>) {
        self.page.store(page.unwrap_or(NO_PAGE), Ordering::Release);
    }

    /// Returns `true` when the frame bytes diverge from the store.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Sets or clears the dirty flag.
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Returns `true` if this frame carries its own mutex.
    pub fn is_lockable(&self) -> bool {
        self.lock.is_some()
    }

    /// Acquires the frame mutex when present.
    ///
    /// Lock order is always cache lock before frame lock, never the
    /// reverse.
    pub fn lock_data(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.as_ref().map(|m| m.lock())
    }

    /// Copies `bytes` into the frame, zero-filling any remainder.
    ///
    /// Serialised by the frame mutex when present; on plain frames the
    /// caller is the unique writer by construction.
    pub fn fill(&self, bytes: &[u8]) {
        let _guard = self.lock_data();
        let len = bytes.len().min(self.size);
        // SAFETY: the frame owns `size` bytes at `base`; writers are
        // serialised per the contract above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr(), len);
            if len < self.size {
                std::ptr::write_bytes(self.base.as_ptr().add(len), 0, self.size - len);
            }
        }
    }

    /// Zero-fills the frame.
    pub fn zero(&self) {
        self.fill(&[]);
    }

    /// Copies the frame bytes out.
    pub fn snapshot(&self) -> Vec<u8> {
        let _guard = self.lock_data();
        let mut out = vec![0u8; self.size];
        // SAFETY: the frame owns `size` bytes at `base`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr(), out.as_mut_ptr(), self.size);
        }
        out
    }

    /// Writes `bytes` at `offset` under the frame lock and marks the
    /// frame dirty. Returns `false` when the write would cross the frame
    /// boundary.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> bool {
        if offset + bytes.len() > self.size {
            return false;
        }
        let _guard = self.lock_data();
        // SAFETY: bounds checked above; writers serialised per contract.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset),
                bytes.len(),
            );
        }
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Reads `buf.len()` bytes at `offset` under the frame lock.
    /// Returns `false` when the read would cross the frame boundary.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> bool {
        if offset + buf.len() > self.size {
            return false;
        }
        let _guard = self.lock_data();
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        true
    }

    /// Clears page binding and dirty flag (frame returns to the free
    /// pool).
    pub fn reset(&self) {
        let _guard = self.lock_data();
        self.page.store(NO_PAGE, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("size", &self.size)
            .field("page", &self.page())
            .field("dirty", &self.is_dirty())
            .field("lockable", &self.is_lockable())
            .finish()
    }
}

/// Flat, grow-only collection of frames.
#[derive(Debug)]
pub struct FrameTable {
    frames: RwLock<Vec<Arc<Frame>>>,
    page_size: usize,
    lockable: bool,
}

impl FrameTable {
    /// Creates an empty table producing frames of `page_size` bytes.
    pub fn new(page_size: usize, lockable: bool) -> Self {
        Self {
            frames: RwLock::new(Vec::new()),
            page_size,
            lockable,
        }
    }

    /// Frame size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of frames in the table.
    pub fn len(&self) -> usize {
        self.frames.read().len()
    }

    /// Returns `true` when no frames exist yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Carves `slab` into frames and appends them; returns the indexes
    /// of the new frames.
    pub fn extend_from_slab(&self, slab: &Slab) -> Vec<usize> {
        let mut frames = self.frames.write();
        let start = frames.len();
        let count = slab.chunk_count(self.page_size);
        for i in 0..count {
            let base = slab
                .chunk(i, self.page_size)
                .expect("chunk_count bounds the index");
            frames.push(Arc::new(Frame::new(base, self.page_size, self.lockable)));
        }
        (start..start + count).collect()
    }

    /// Cheap handle to the frame at `index`.
    pub fn get(&self, index: usize) -> Option<Arc<Frame>> {
        self.frames.read().get(index).cloned()
    }

    /// Snapshot of every frame handle (teardown flushing).
    pub fn all(&self) -> Vec<Arc<Frame>> {
        self.frames.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemoryPool;

    #[test]
    fn table_carves_slab_into_frames() {
        let slab = MemoryPool::allocate(4096 * 4, None).unwrap();
        let table = FrameTable::new(4096, false);
        let added = table.extend_from_slab(&slab);
        assert_eq!(added, vec![0, 1, 2, 3]);
        assert_eq!(table.len(), 4);
        assert!(table.get(3).is_some());
        assert!(table.get(4).is_none());
    }

    #[test]
    fn growth_preserves_existing_handles() {
        let slab_a = MemoryPool::allocate(4096 * 2, None).unwrap();
        let slab_b = MemoryPool::allocate(4096 * 2, None).unwrap();
        let table = FrameTable::new(4096, false);
        table.extend_from_slab(&slab_a);
        let before = table.get(0).unwrap();
        table.extend_from_slab(&slab_b);
        assert_eq!(table.len(), 4);
        assert_eq!(before.base(), table.get(0).unwrap().base());
    }

    #[test]
    fn fill_and_snapshot_round_trip() {
        let slab = MemoryPool::allocate(4096, None).unwrap();
        let table = FrameTable::new(4096, false);
        table.extend_from_slab(&slab);
        let frame = table.get(0).unwrap();

        frame.fill(&[0xCD; 100]);
        let bytes = frame.snapshot();
        assert!(bytes[..100].iter().all(|&b| b == 0xCD));
        assert!(bytes[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn write_at_marks_dirty_and_respects_bounds() {
        let slab = MemoryPool::allocate(4096, None).unwrap();
        let table = FrameTable::new(4096, true);
        table.extend_from_slab(&slab);
        let frame = table.get(0).unwrap();
        assert!(frame.is_lockable());
        assert!(!frame.is_dirty());

        assert!(frame.write_at(4000, &[1; 96]));
        assert!(frame.is_dirty());
        assert!(!frame.write_at(4000, &[1; 97]));

        let mut buf = [0u8; 96];
        assert!(frame.read_at(4000, &mut buf));
        assert_eq!(buf, [1; 96]);
    }

    #[test]
    fn reset_clears_binding_and_dirty() {
        let slab = MemoryPool::allocate(4096, None).unwrap();
        let table = FrameTable::new(4096, false);
        table.extend_from_slab(&slab);
        let frame = table.get(0).unwrap();

        frame.set_page(Some(9));
        frame.set_dirty(true);
        frame.reset();
        assert_eq!(frame.page(), None);
        assert!(!frame.is_dirty());
    }
}
