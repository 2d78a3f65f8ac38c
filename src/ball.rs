//! The ball: a handle bound to one store directory plus its in-memory
//! page cache.
//!
//! ```text
//! caller ──► Ball::get(vaddr)
//!              │  snap to page boundary: page = vaddr >> log2(page_size)
//!              ▼
//!        ┌───────────────┐ resident ┌─────────────────────────┐
//!        │ ArcCache<Slot>│ ────────►│ frame.base + offset      │
//!        └──────┬────────┘          └─────────────────────────┘
//!               │ miss
//!               ▼
//!        in-flight guard ── reload via worker queue ── bind frame
//!               │                                        │
//!               ▼                                        ▼
//!        evicted victims: snapshot bytes, flush job, client hook
//! ```
//!
//! The ARC lock is never held across I/O: victims are captured as
//! `(page, slot)` pairs while the lock is held, their bytes are
//! snapshotted, and the flush runs later on the worker. Reloads for hard
//! misses execute as worker jobs too, so a flush of page `k` enqueued by
//! an eviction always reaches the store before a reload of `k` issued
//! afterwards.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::BallConfig;
use crate::error::{Error, Result};
use crate::mem::{self, MemoryPool, Slab};
use crate::paging::{Frame, FrameTable};
use crate::policy::ArcCache;
use crate::runtime::{self, Runtime};
use crate::stats::Statistics;
use crate::store::{
    LsmStore, OpenOptions, PageStore, StoreError, LARGE_DATA_PREFIX, LARGE_LEN_PREFIX,
};
use crate::PageId;

/// Page-id space reserved for large objects; far beyond any address a
/// caller can reach through the contingency window.
const LARGE_PAGE_BASE: PageId = 1 << 47;

thread_local! {
    /// Scratch slabs attached by `register_thread`, alive for the
    /// thread's lifetime.
    static SCRATCH: RefCell<Vec<Slab>> = const { RefCell::new(Vec::new()) };
}

/// Resident payload tracked by the eviction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Slot {
    /// Placeholder while a fault is materialising the page.
    #[default]
    Empty,
    /// Page bytes live in the frame at this index.
    Frame(usize),
    /// Out-of-band buffer owned by the caller.
    Large { addr: usize, len: usize },
}

/// Victims captured under the cache lock, acted on after release.
struct EvictionNotice {
    page: PageId,
    dirty: bool,
    bytes: Option<Vec<u8>>,
    had_frame: bool,
}

struct Admitted {
    frame: Option<(usize, Arc<Frame>)>,
    evicted: bool,
}

/// Opens a ball bound to `path`, creating the store if needed.
///
/// Equivalent to [`Ball::create`].
pub fn create_ball(path: impl AsRef<Path>, config: BallConfig, overwrite: bool) -> Result<Ball> {
    Ball::create(path, config, overwrite)
}

/// Handle to one persistent page cache.
///
/// The ball owns its slabs, frame table, eviction engine, store handle,
/// and statistics. Dropping (or [`close`](Ball::close)-ing) the last
/// ball also joins the process-wide worker.
pub struct Ball {
    inner: Arc<BallInner>,
}

struct BallInner {
    id: u64,
    config: BallConfig,
    page_size: usize,
    page_shift: u32,
    store: Arc<dyn PageStore>,
    runtime: Arc<Runtime>,
    stats: Arc<Statistics>,

    cache: Mutex<ArcCache<Slot>>,
    frames: FrameTable,
    slabs: Mutex<Vec<Slab>>,
    free_frames: Mutex<Vec<usize>>,
    /// Victims pushed by the engine hook while the cache lock is held.
    pending: Arc<Mutex<Vec<(PageId, Slot)>>>,

    inflight: Mutex<FxHashSet<PageId>>,
    inflight_done: Condvar,

    max_known_page: AtomicU64,
    next_large_seq: AtomicU64,
    amp_counter: AtomicU32,
    amp_multiplier: AtomicU32,
    page_hashes: Arc<Mutex<FxHashMap<PageId, u64>>>,
    closed: AtomicBool,
}

impl Ball {
    /// Constructs the store and preallocates the cache.
    ///
    /// The first slab holds `initial_page_count` pages (shrunk toward
    /// one when memory is short); those pages are materialised resident
    /// immediately, so addresses inside the initial window hit without
    /// faulting.
    pub fn create(path: impl AsRef<Path>, config: BallConfig, overwrite: bool) -> Result<Ball> {
        config.validate()?;
        let page_size = config.resolved_page_size();
        let page_shift = page_size.trailing_zeros();

        let store = LsmStore::open(
            path.as_ref(),
            OpenOptions {
                create_if_missing: true,
                error_if_exists: false,
                overwrite,
            },
        )
        .map_err(|err| {
            tracing::error!(%err, path = %path.as_ref().display(), "store open failed");
            err
        })?;

        let numa = config.enable_numa.then(current_numa_node);
        let mut pages = config
            .initial_page_count
            .min(config.capacity_limit / page_size)
            .max(1);
        while pages > 1 && mem::available_bytes() < page_size * pages {
            pages -= 1;
        }
        let slab = loop {
            match MemoryPool::allocate(page_size * pages, numa.flatten()) {
                Ok(slab) => break slab,
                Err(_) if pages > 1 => pages -= 1,
                Err(err) => {
                    tracing::error!(%err, "cannot allocate even a single page");
                    return Err(err);
                }
            }
        };

        let frames = FrameTable::new(page_size, config.lockable_pages);
        let indexes = frames.extend_from_slab(&slab);

        let stats = Arc::new(Statistics::default());
        stats.add_preallocated(slab.len());
        stats.add_used_memory(indexes.len() * page_size);

        let pending: Arc<Mutex<Vec<(PageId, Slot)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut cache = ArcCache::new(indexes.len());
        let hook_pending = pending.clone();
        cache.set_eviction_callback(Box::new(move |page, slot: &mut Slot| {
            hook_pending.lock().push((page, *slot));
        }));

        for (page, &idx) in indexes.iter().enumerate() {
            let page = page as PageId;
            let frame = frames.get(idx).expect("freshly added frame");
            frame.set_page(Some(page));
            if !config.is_volatile {
                // Reopened stores hand back the previous contents of the
                // initial window.
                if let Some(bytes) = store.get(page)? {
                    frame.fill(&bytes);
                }
            }
            cache.add(page, Slot::Frame(idx));
        }

        let (id, rt) = runtime::register_ball();

        let inner = Arc::new(BallInner {
            id,
            page_size,
            page_shift,
            store: Arc::new(store),
            runtime: rt,
            stats,
            cache: Mutex::new(cache),
            frames,
            slabs: Mutex::new(vec![slab]),
            free_frames: Mutex::new(Vec::new()),
            pending,
            inflight: Mutex::new(FxHashSet::default()),
            inflight_done: Condvar::new(),
            max_known_page: AtomicU64::new(indexes.len() as u64 - 1),
            next_large_seq: AtomicU64::new(0),
            amp_counter: AtomicU32::new(0),
            amp_multiplier: AtomicU32::new(1),
            page_hashes: Arc::new(Mutex::new(FxHashMap::default())),
            closed: AtomicBool::new(false),
            config,
        });

        inner.client_log(&format!(
            "ball opened: {} pages of {} bytes",
            indexes.len(),
            page_size
        ));
        tracing::info!(ball = id, pages = indexes.len(), page_size, "ball created");
        Ok(Ball { inner })
    }

    /// Translates a virtual address into a pointer inside a resident
    /// frame, faulting the page in when needed.
    ///
    /// Returns `None` for addresses beyond the contingency window, for
    /// pages lost by a volatile eviction, and after a store failure.
    pub fn get(&self, vaddr: u64) -> Option<NonNull<u8>> {
        let (slot, offset) = self.inner.acquire(vaddr, true)?;
        self.inner.slot_ptr(slot, offset)
    }

    /// Copies `buf.len()` bytes starting at `vaddr` out of the cache,
    /// faulting pages as needed. Fails on unmapped addresses.
    pub fn read(&self, vaddr: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read(vaddr, buf)
    }

    /// Copies `bytes` into the cache starting at `vaddr`, faulting pages
    /// as needed and marking the touched frames dirty.
    pub fn write(&self, vaddr: u64, bytes: &[u8]) -> Result<()> {
        self.inner.write(vaddr, bytes)
    }

    /// Promotes the page holding `vaddr` in the eviction engine without
    /// touching statistics or I/O. Non-resident pages are left alone.
    pub fn touch(&self, vaddr: u64) {
        let page = vaddr >> self.inner.page_shift;
        let mut cache = self.inner.cache.lock();
        if cache.contains(page) {
            cache.touch(page);
        }
    }

    /// Registers an out-of-band buffer and returns the virtual address
    /// it answers to.
    ///
    /// The cache entry stores only the pointer; the bytes are written to
    /// the store under a synthetic key (plus a length record) unless the
    /// ball is volatile. The buffer stays owned by the caller and is
    /// never freed or copied by the cache.
    ///
    /// # Safety
    ///
    /// `buf` must point to `len` readable bytes that outlive every
    /// subsequent `get` on the returned address.
    pub unsafe fn store_large(&self, buf: *const u8, len: usize) -> Result<u64> {
        self.inner.store_large(buf, len)
    }

    /// Warms the cache with the pages holding `vaddrs`.
    ///
    /// Pages are loaded through the worker; with burst mode enabled a
    /// short-lived thread pool fans the batch out instead.
    pub fn prefetch(&self, vaddrs: &[u64]) -> Result<()> {
        BallInner::prefetch(&self.inner, vaddrs)
    }

    /// Attaches a page-sized thread-local scratch slab to the calling
    /// thread, NUMA-pinned when requested and enabled, and records the
    /// thread in the allocator's ownership table.
    pub fn register_thread(&self, numa: Option<u32>) -> Result<()> {
        let node = if self.inner.config.enable_numa {
            numa
        } else {
            None
        };
        let slab = MemoryPool::allocate(self.inner.page_size, node)?;
        SCRATCH.with(|scratch| scratch.borrow_mut().push(slab));
        tracing::debug!(thread = ?std::thread::current().id(), "registered thread");
        Ok(())
    }

    /// Read-only statistics surface.
    pub fn statistics(&self) -> &Statistics {
        &self.inner.stats
    }

    /// Page size of this ball.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Returns `true` if the page holding `vaddr` is resident.
    pub fn is_resident(&self, vaddr: u64) -> bool {
        let page = vaddr >> self.inner.page_shift;
        self.inner.cache.lock().contains(page)
    }

    /// Returns `true` if the page holding `vaddr` is a ghost entry.
    pub fn is_ghost(&self, vaddr: u64) -> bool {
        let page = vaddr >> self.inner.page_shift;
        self.inner.cache.lock().in_ghost(page)
    }

    /// Asks the worker to merge the store's on-disk state.
    pub fn compact_hint(&self) -> Result<()> {
        let store = self.inner.store.clone();
        self.inner.runtime.submit(Box::new(move || {
            if let Err(err) = store.compact() {
                tracing::warn!(%err, "compaction hint failed");
            }
        }))
    }

    /// Flushes dirty frames, closes the store, and releases the slabs.
    ///
    /// Dropping the ball performs the same teardown.
    pub fn close(self) {
        self.inner.close();
    }
}

impl Drop for Ball {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Ball {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ball")
            .field("id", &self.inner.id)
            .field("page_size", &self.inner.page_size)
            .field("frames", &self.inner.frames.len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl BallInner {
    #[inline]
    fn translate(&self, vaddr: u64) -> (PageId, usize) {
        (
            vaddr >> self.page_shift,
            (vaddr & (self.page_size as u64 - 1)) as usize,
        )
    }

    fn is_large_page(page: PageId) -> bool {
        page >= LARGE_PAGE_BASE
    }

    fn client_log(&self, line: &str) {
        if self.config.enable_logging {
            if let Some(sink) = &self.config.log_function {
                sink(line);
            }
        }
    }

    /// Resolves `vaddr` to its resident slot, faulting in on miss.
    ///
    /// Reads promote recency (`promote = true`); writes leave the
    /// recency state untouched — the dirty bit already marks them for
    /// writeback, and a stream of fresh writes must not displace the
    /// frequent list.
    fn acquire(&self, vaddr: u64, promote: bool) -> Option<(Slot, usize)> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let redirect_start = Instant::now();
        let (page, offset) = self.translate(vaddr);

        loop {
            let fetch_start = Instant::now();
            {
                let mut cache = self.cache.lock();
                let slot = if promote {
                    cache.get(page).copied()
                } else {
                    cache.peek(page).copied()
                };
                if let Some(slot) = slot {
                    if slot != Slot::Empty {
                        drop(cache);
                        self.stats.record_hit();
                        self.stats.record_fetch(fetch_start.elapsed());
                        self.stats.record_pointer_redirect(redirect_start.elapsed());
                        return Some((slot, offset));
                    }
                }
            }

            if !self.begin_fault(page) {
                // Another thread finished (or is finishing) this page.
                continue;
            }
            let slot = self.fault_in(page);
            self.end_fault(page);
            let slot = slot?;
            self.stats.record_pointer_redirect(redirect_start.elapsed());
            return Some((slot, offset));
        }
    }

    fn slot_ptr(&self, slot: Slot, offset: usize) -> Option<NonNull<u8>> {
        match slot {
            Slot::Frame(idx) => {
                let frame = self.frames.get(idx)?;
                if offset >= frame.size() {
                    return None;
                }
                // SAFETY: offset is inside the frame's slab chunk.
                NonNull::new(unsafe { frame.base().as_ptr().add(offset) })
            }
            Slot::Large { addr, len } => {
                if offset >= len {
                    return None;
                }
                NonNull::new((addr + offset) as *mut u8)
            }
            Slot::Empty => None,
        }
    }

    fn begin_fault(&self, page: PageId) -> bool {
        let mut inflight = self.inflight.lock();
        if inflight.contains(&page) {
            self.inflight_done.wait(&mut inflight);
            return false;
        }
        inflight.insert(page);
        true
    }

    fn try_begin_fault(&self, page: PageId) -> bool {
        let mut inflight = self.inflight.lock();
        if inflight.contains(&page) {
            return false;
        }
        inflight.insert(page);
        true
    }

    fn end_fault(&self, page: PageId) {
        let mut inflight = self.inflight.lock();
        inflight.remove(&page);
        self.inflight_done.notify_all();
    }

    /// Miss path. Runs with the in-flight guard held for `page`.
    fn fault_in(&self, page: PageId) -> Option<Slot> {
        {
            let mut cache = self.cache.lock();
            if let Some(&slot) = cache.get(page) {
                if slot != Slot::Empty {
                    self.stats.record_hit();
                    return Some(slot);
                }
            }
        }

        if Self::is_large_page(page) {
            // The borrowed buffer cannot be recreated after eviction;
            // the bytes remain retrievable from the store by key.
            tracing::debug!(page, "large-object entry no longer resident");
            return None;
        }

        let ghost = self.cache.lock().in_ghost(page);
        let max_known = self.max_known_page.load(Ordering::Acquire);
        let known = page <= max_known;

        if !ghost && !known {
            if page > max_known + 1 {
                // Far from every known page: invalid address.
                return None;
            }
            // Never-seen page inside the window. A previous session may
            // still hold its bytes.
            let bytes = if self.config.is_volatile || self.stats.store_failed() {
                None
            } else {
                match self.load_from_store(page) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::error!(page, %err, "page load failed");
                        self.client_log(&format!("page {page} load failed: {err}"));
                        self.stats.mark_store_failed();
                        return None;
                    }
                }
            };
            if let Some(data) = &bytes {
                if !self.validate_reload(page, data) {
                    return None;
                }
            }
            self.stats.record_miss();
            return self.materialize(page, bytes.as_deref());
        }

        if self.config.is_volatile {
            // The page was resident once and its eviction discarded the
            // bytes.
            self.stats.record_miss();
            return None;
        }
        if self.stats.store_failed() {
            tracing::warn!(page, "load refused after store failure");
            return None;
        }

        let reload_start = Instant::now();
        let bytes = match self.load_from_store(page) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(page, %err, "page load failed");
                self.client_log(&format!("page {page} load failed: {err}"));
                self.stats.mark_store_failed();
                return None;
            }
        };

        match bytes {
            Some(data) => {
                if !self.validate_reload(page, &data) {
                    return None;
                }
                if ghost {
                    self.stats.record_hit();
                } else {
                    self.stats.record_miss();
                }
                let slot = self.materialize(page, Some(&data));
                self.stats.record_reload(reload_start.elapsed());
                slot
            }
            None => {
                // Known page that was never flushed: clean history,
                // re-materialise zero-filled.
                self.stats.record_miss();
                self.materialize(page, None)
            }
        }
    }

    fn validate_reload(&self, page: PageId, data: &[u8]) -> bool {
        let Some(hash_fn) = &self.config.hash_function else {
            return true;
        };
        let Some(&expected) = self.page_hashes.lock().get(&page) else {
            return true;
        };
        if hash_fn(data) != expected {
            self.stats.record_validation_failure();
            tracing::error!(page, "reload content hash mismatch");
            self.client_log(&format!("page {page} failed reload validation"));
            return false;
        }
        true
    }

    /// Point lookup through the worker queue, so pending flushes of the
    /// same page land first.
    fn load_from_store(&self, page: PageId) -> Result<Option<Vec<u8>>> {
        let store = self.store.clone();
        let io_start = Instant::now();
        let result = self.runtime.run_sync(move || store.get(page))?;
        self.stats.record_io(io_start.elapsed());
        match result {
            Ok(bytes) => Ok(bytes),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Binds a frame for `page` and fills it with `bytes` (zeroes when
    /// absent). Runs with the in-flight guard held.
    fn materialize(&self, page: PageId, bytes: Option<&[u8]>) -> Option<Slot> {
        loop {
            let ghost = self.cache.lock().in_ghost(page);
            let admitted = match self.admit(page, ghost, Slot::Empty) {
                Ok(admitted) => admitted,
                Err(err) => {
                    tracing::error!(page, %err, "cannot bind a frame");
                    self.client_log(&format!("page {page} fault failed: {err}"));
                    return None;
                }
            };
            let (idx, frame) = admitted.frame.expect("empty slot admission yields a frame");

            match bytes {
                Some(data) => frame.fill(data),
                None => frame.zero(),
            }
            frame.set_dirty(false);
            frame.set_page(Some(page));

            if self.finalize_frame(page, idx) {
                self.stats.add_used_memory(self.page_size);
                self.max_known_page.fetch_max(page, Ordering::AcqRel);
                if admitted.evicted {
                    self.amp_tick();
                }
                return Some(Slot::Frame(idx));
            }
            // The entry was evicted while we were filling it; retry.
        }
    }

    /// Inserts `page` into the eviction engine, processes any victims,
    /// and (for [`Slot::Empty`]) hands out a free frame. Flush jobs are
    /// enqueued before the cache lock is released, which pins their
    /// queue position ahead of any later reload of the same pages.
    fn admit(&self, page: PageId, ghost: bool, slot: Slot) -> Result<Admitted> {
        let mut cache = self.cache.lock();
        if ghost {
            cache.touch(page);
            if let Some(bound) = cache.get_mut(page) {
                *bound = slot;
            } else {
                cache.add(page, slot);
            }
        } else {
            cache.add(page, slot);
        }

        let victims: Vec<(PageId, Slot)> = self.pending.lock().drain(..).collect();
        let mut notices = Vec::with_capacity(victims.len());
        for (vpage, vslot) in victims {
            match vslot {
                Slot::Frame(idx) => {
                    let Some(frame) = self.frames.get(idx) else {
                        continue;
                    };
                    let dirty = frame.is_dirty();
                    let wants_bytes = (dirty && !self.config.is_volatile)
                        || self.config.eviction_callback.is_some();
                    let bytes = wants_bytes.then(|| frame.snapshot());
                    frame.reset();
                    self.free_frames.lock().push(idx);
                    self.stats.sub_used_memory(self.page_size);
                    self.stats.record_eviction();
                    notices.push(EvictionNotice {
                        page: vpage,
                        dirty,
                        bytes,
                        had_frame: true,
                    });
                }
                Slot::Large { .. } => {
                    self.stats.record_eviction();
                    notices.push(EvictionNotice {
                        page: vpage,
                        dirty: false,
                        bytes: None,
                        had_frame: false,
                    });
                }
                Slot::Empty => {}
            }
        }
        let evicted = !notices.is_empty();

        let frame = if slot == Slot::Empty {
            match self.free_frames.lock().pop() {
                Some(idx) => Some((idx, self.frames.get(idx).expect("freed frame exists"))),
                None => {
                    cache.remove(page);
                    for notice in notices {
                        self.enqueue_eviction(notice);
                    }
                    return Err(Error::Exhausted);
                }
            }
        } else {
            None
        };

        for notice in notices {
            self.enqueue_eviction(notice);
        }
        drop(cache);

        Ok(Admitted { frame, evicted })
    }

    /// Publishes the filled frame. Returns `false` when the entry was
    /// evicted mid-fault, in which case the frame goes back to the pool.
    fn finalize_frame(&self, page: PageId, idx: usize) -> bool {
        let mut cache = self.cache.lock();
        match cache.get_mut(page) {
            Some(slot) => {
                *slot = Slot::Frame(idx);
                true
            }
            None => {
                if let Some(frame) = self.frames.get(idx) {
                    frame.reset();
                }
                self.free_frames.lock().push(idx);
                false
            }
        }
    }

    /// Hands one eviction to the worker: persist when dirty (and not
    /// volatile), then inform the client hook. Callback panics are
    /// contained and counted.
    fn enqueue_eviction(&self, notice: EvictionNotice) {
        let flush = notice.dirty && !self.config.is_volatile && notice.had_frame;
        let callback = self.config.eviction_callback.clone();
        if !flush && callback.is_none() {
            return;
        }

        let store = self.store.clone();
        let stats = self.stats.clone();
        let hash_fn = self.config.hash_function.clone();
        let hashes = self.page_hashes.clone();
        let vaddr = notice.page << self.page_shift;
        let EvictionNotice { page, bytes, .. } = notice;

        let job = Box::new(move || {
            if flush {
                if let Some(data) = bytes.as_deref() {
                    let write_start = Instant::now();
                    if let Some(hash_fn) = &hash_fn {
                        hashes.lock().insert(page, hash_fn(data));
                    }
                    match store.put(page, data) {
                        Ok(()) => {
                            stats.record_flush(vaddr, data.len());
                            stats.record_write(write_start.elapsed());
                            stats.record_io(write_start.elapsed());
                        }
                        Err(err) => {
                            tracing::error!(page, %err, "eviction flush failed");
                            stats.mark_store_failed();
                        }
                    }
                }
            }
            if let Some(callback) = callback {
                let payload = bytes.as_deref().unwrap_or(&[]);
                if catch_unwind(AssertUnwindSafe(|| callback(page, payload))).is_err() {
                    tracing::error!(page, "eviction callback panicked");
                    stats.record_callback_panic();
                }
            }
        });

        if self.runtime.submit(job).is_err() {
            tracing::warn!(page, "worker rejected eviction job during shutdown");
        }
    }

    /// Counts a miss-with-eviction toward adaptive growth.
    fn amp_tick(&self) {
        let count = self.amp_counter.fetch_add(1, Ordering::AcqRel) + 1;
        if count < self.config.resize_threshold {
            return;
        }
        self.amp_counter.store(0, Ordering::Release);
        self.grow();
    }

    /// Adds a slab of `multiplier` pages, raising the engine capacity,
    /// while the total footprint stays at or below the capacity limit.
    fn grow(&self) {
        let expand_start = Instant::now();
        let mut slabs = self.slabs.lock();

        let slab_bytes = self.stats.preallocated_slab_size();
        if slab_bytes >= self.config.capacity_limit {
            return;
        }
        let multiplier = self.amp_multiplier.load(Ordering::Acquire) as usize;
        let room_pages = (self.config.capacity_limit - slab_bytes) / self.page_size;
        let pages = multiplier.min(room_pages);
        if pages == 0 {
            return;
        }

        let numa = self.config.enable_numa.then(current_numa_node).flatten();
        let slab = match MemoryPool::allocate(pages * self.page_size, numa) {
            Ok(slab) => slab,
            Err(err) => {
                tracing::warn!(%err, "adaptive growth allocation failed");
                return;
            }
        };

        let indexes = self.frames.extend_from_slab(&slab);
        let added = indexes.len();
        self.free_frames.lock().extend(indexes);
        {
            let mut cache = self.cache.lock();
            let capacity = cache.capacity();
            cache.resize(capacity + added);
        }
        self.stats.add_preallocated(slab.len());
        slabs.push(slab);

        let next = (multiplier as u32 * 2).min(self.config.max_expansion_multiplier);
        self.amp_multiplier.store(next, Ordering::Release);
        self.stats.record_page_expand(expand_start.elapsed());
        tracing::info!(added, next_multiplier = next, "adaptive pool grew");
        self.client_log(&format!("adaptive pool grew by {added} pages"));
    }

    fn read(&self, vaddr: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let cursor = vaddr + done as u64;
            let (slot, offset) = self
                .acquire(cursor, true)
                .ok_or_else(|| Error::InvalidArgument(format!("unmapped address {cursor:#x}")))?;
            match slot {
                Slot::Frame(idx) => {
                    let frame = self
                        .frames
                        .get(idx)
                        .ok_or_else(|| Error::InvalidArgument("stale frame".into()))?;
                    let chunk = (self.page_size - offset).min(buf.len() - done);
                    if !frame.read_at(offset, &mut buf[done..done + chunk]) {
                        return Err(Error::InvalidArgument("read crosses frame bounds".into()));
                    }
                    done += chunk;
                }
                Slot::Large { addr, len } => {
                    if offset >= len {
                        return Err(Error::InvalidArgument(
                            "read past the end of a large object".into(),
                        ));
                    }
                    let chunk = (len - offset).min(buf.len() - done);
                    // SAFETY: the caller guaranteed the registered
                    // buffer outlives cache accesses.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            (addr + offset) as *const u8,
                            buf[done..].as_mut_ptr(),
                            chunk,
                        );
                    }
                    done += chunk;
                }
                Slot::Empty => {
                    return Err(Error::InvalidArgument("page vanished mid-read".into()));
                }
            }
        }
        Ok(())
    }

    fn write(&self, vaddr: u64, bytes: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < bytes.len() {
            let cursor = vaddr + done as u64;
            let (slot, offset) = self
                .acquire(cursor, false)
                .ok_or_else(|| Error::InvalidArgument(format!("unmapped address {cursor:#x}")))?;
            match slot {
                Slot::Frame(idx) => {
                    let frame = self
                        .frames
                        .get(idx)
                        .ok_or_else(|| Error::InvalidArgument("stale frame".into()))?;
                    let chunk = (self.page_size - offset).min(bytes.len() - done);
                    if !frame.write_at(offset, &bytes[done..done + chunk]) {
                        return Err(Error::InvalidArgument("write crosses frame bounds".into()));
                    }
                    done += chunk;
                }
                Slot::Large { .. } => {
                    return Err(Error::InvalidArgument(
                        "large objects are written through their own buffer".into(),
                    ));
                }
                Slot::Empty => {
                    return Err(Error::InvalidArgument("page vanished mid-write".into()));
                }
            }
        }
        Ok(())
    }

    fn store_large(&self, buf: *const u8, len: usize) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        if buf.is_null() || len == 0 {
            return Err(Error::InvalidArgument(
                "large buffer must be non-null and non-empty".into(),
            ));
        }

        let seq = self.next_large_seq.fetch_add(1, Ordering::AcqRel);
        let page = LARGE_PAGE_BASE + seq;

        if !self.config.is_volatile {
            // SAFETY: caller contract of `Ball::store_large`.
            let bytes = unsafe { std::slice::from_raw_parts(buf, len) };
            let io_start = Instant::now();
            self.store.put(LARGE_DATA_PREFIX | seq, bytes)?;
            self.store
                .put(LARGE_LEN_PREFIX | seq, &(len as u64).to_le_bytes())?;
            self.stats.record_io(io_start.elapsed());
        }

        self.admit(
            page,
            false,
            Slot::Large {
                addr: buf as usize,
                len,
            },
        )?;
        tracing::debug!(page, len, "registered large object");
        Ok(page << self.page_shift)
    }

    fn prefetch(this: &Arc<Self>, vaddrs: &[u64]) -> Result<()> {
        if this.closed.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        let mut pages: Vec<PageId> = vaddrs.iter().map(|&v| v >> this.page_shift).collect();
        pages.sort_unstable();
        pages.dedup();

        if this.config.enable_burst_mode && pages.len() > 1 {
            // Pending flushes must land before the pool reads around the
            // queue.
            this.runtime.drain()?;
            let workers = pages.len().min(4);
            let queue = Mutex::new(pages.into_iter());
            std::thread::scope(|scope| {
                for _ in 0..workers {
                    scope.spawn(|| {
                        loop {
                            let Some(page) = queue.lock().next() else {
                                break;
                            };
                            this.prefetch_one(page);
                        }
                    });
                }
            });
            return Ok(());
        }

        for page in pages {
            let inner = this.clone();
            this.runtime
                .submit(Box::new(move || inner.prefetch_one(page)))?;
        }
        Ok(())
    }

    /// Loads one page if it is store-backed and not yet resident.
    /// Runs on the worker (or a burst thread); never blocks on the
    /// worker queue.
    fn prefetch_one(&self, page: PageId) {
        if self.closed.load(Ordering::Acquire)
            || self.stats.store_failed()
            || Self::is_large_page(page)
            || self.config.is_volatile
        {
            return;
        }
        if self.cache.lock().contains(page) {
            return;
        }
        if !self.try_begin_fault(page) {
            return;
        }

        let bytes = match self.store.get(page) {
            Ok(Some(bytes)) => Some(bytes),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(page, %err, "prefetch load failed");
                None
            }
        };
        if let Some(data) = bytes {
            if self.validate_reload(page, &data) {
                self.materialize(page, Some(&data));
            }
        }
        self.end_fault(page);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.client_log("ball closing");

        // Let queued flushes land before the synchronous sweep.
        if self.runtime.drain().is_err() {
            tracing::warn!("worker already stopped during close");
        }

        if !self.config.is_volatile {
            for frame in self.frames.all() {
                if let (Some(page), true) = (frame.page(), frame.is_dirty()) {
                    let bytes = frame.snapshot();
                    match self.store.put(page, &bytes) {
                        Ok(()) => {
                            self.stats
                                .record_flush(page << self.page_shift, bytes.len());
                        }
                        Err(err) => {
                            tracing::error!(page, %err, "final flush failed");
                            self.stats.mark_store_failed();
                        }
                    }
                    frame.set_dirty(false);
                }
            }
        }

        if let Err(err) = self.store.close() {
            tracing::warn!(%err, "store close failed");
        }
        self.slabs.lock().clear();
        runtime::deregister_ball(self.id);
        tracing::info!(ball = self.id, "ball closed");
    }
}

/// Best-effort current NUMA node of the calling thread.
#[cfg(target_os = "linux")]
fn current_numa_node() -> Option<u32> {
    let mut cpu: libc::c_uint = 0;
    let mut node: libc::c_uint = 0;
    // SAFETY: getcpu writes two out-params and has no other effects.
    let rc = unsafe { libc::syscall(libc::SYS_getcpu, &mut cpu, &mut node, std::ptr::null_mut::<libc::c_void>()) };
    (rc == 0).then_some(node)
}

#[cfg(not(target_os = "linux"))]
fn current_numa_node() -> Option<u32> {
    None
}
