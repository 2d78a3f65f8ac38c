//! Per-ball statistics.
//!
//! Counters are plain atomics, latency accumulators are exponential
//! moving averages stored as `f64` bits in an atomic word; every getter
//! is a lock-free read. [`StatsSnapshot`] captures the whole surface in
//! one shot for logging or assertions.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Fixed decay for the latency accumulators: each sample contributes
/// 1/8 of the new average.
const EMA_DECAY: f64 = 0.125;

/// How many recently flushed virtual addresses are retained.
const FLUSHED_RING_LEN: usize = 64;

/// Exponential moving average of durations, in microseconds.
#[derive(Debug, Default)]
pub struct LatencyEma(AtomicU64);

impl LatencyEma {
    /// Folds one sample into the average.
    pub fn record(&self, sample: Duration) {
        let micros = sample.as_secs_f64() * 1e6;
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let avg = f64::from_bits(current);
            let next = if current == 0 {
                micros
            } else {
                avg * (1.0 - EMA_DECAY) + micros * EMA_DECAY
            };
            match self.0.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current average in microseconds (0.0 before any sample).
    pub fn micros(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Read-mostly observer surface for one ball.
#[derive(Debug, Default)]
pub struct Statistics {
    used_memory: AtomicUsize,
    preallocated_slab_size: AtomicUsize,
    eviction_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    flushed_buffer_size: AtomicU64,
    callback_panics: AtomicU64,
    reload_validation_failures: AtomicU64,
    store_failed: AtomicBool,

    avg_io: LatencyEma,
    avg_fetch: LatencyEma,
    avg_write: LatencyEma,
    avg_reload: LatencyEma,
    avg_pointer_redirect: LatencyEma,
    avg_page_expand: LatencyEma,

    flushed_addresses: Mutex<std::collections::VecDeque<u64>>,
}

impl Statistics {
    /// Bytes of slab memory currently holding resident pages.
    pub fn used_memory(&self) -> usize {
        self.used_memory.load(Ordering::Relaxed)
    }

    /// Total bytes of slab memory preallocated for this ball.
    pub fn preallocated_slab_size(&self) -> usize {
        self.preallocated_slab_size.load(Ordering::Relaxed)
    }

    /// Resident evictions observed so far.
    pub fn eviction_count(&self) -> u64 {
        self.eviction_count.load(Ordering::Relaxed)
    }

    /// Lookups served from resident frames or ghost reloads.
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Lookups that found neither a resident frame nor a ghost.
    pub fn miss_count(&self) -> u64 {
        self.miss_count.load(Ordering::Relaxed)
    }

    /// Cumulative bytes handed to the store by eviction flushes.
    pub fn flushed_buffer_size(&self) -> u64 {
        self.flushed_buffer_size.load(Ordering::Relaxed)
    }

    /// Client eviction callbacks that panicked (contained by the worker).
    pub fn callback_panics(&self) -> u64 {
        self.callback_panics.load(Ordering::Relaxed)
    }

    /// Reloads whose content hash did not match the recorded one.
    pub fn reload_validation_failures(&self) -> u64 {
        self.reload_validation_failures.load(Ordering::Relaxed)
    }

    /// Set once a store failure (other than not-found) has been seen;
    /// the ball keeps serving hits but refuses further loads.
    pub fn store_failed(&self) -> bool {
        self.store_failed.load(Ordering::Acquire)
    }

    /// Average store I/O latency (µs).
    pub fn avg_io_micros(&self) -> f64 {
        self.avg_io.micros()
    }

    /// Average resident-fetch latency (µs).
    pub fn avg_fetch_micros(&self) -> f64 {
        self.avg_fetch.micros()
    }

    /// Average eviction-flush write latency (µs).
    pub fn avg_write_micros(&self) -> f64 {
        self.avg_write.micros()
    }

    /// Average ghost-reload latency (µs).
    pub fn avg_reload_micros(&self) -> f64 {
        self.avg_reload.micros()
    }

    /// Average address-to-pointer translation latency (µs).
    pub fn avg_pointer_redirect_micros(&self) -> f64 {
        self.avg_pointer_redirect.micros()
    }

    /// Average adaptive-growth latency (µs).
    pub fn avg_page_expand_micros(&self) -> f64 {
        self.avg_page_expand.micros()
    }

    /// Virtual addresses of recently flushed pages, most recent last.
    ///
    /// Bounded ring; unlike the counters this getter takes a short lock.
    pub fn flushed_page_addresses(&self) -> Vec<u64> {
        self.flushed_addresses.lock().iter().copied().collect()
    }

    /// One-shot copy of the counter surface.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            used_memory: self.used_memory(),
            preallocated_slab_size: self.preallocated_slab_size(),
            eviction_count: self.eviction_count(),
            hit_count: self.hit_count(),
            miss_count: self.miss_count(),
            flushed_buffer_size: self.flushed_buffer_size(),
            callback_panics: self.callback_panics(),
            reload_validation_failures: self.reload_validation_failures(),
            store_failed: self.store_failed(),
            avg_io_micros: self.avg_io_micros(),
            avg_fetch_micros: self.avg_fetch_micros(),
            avg_write_micros: self.avg_write_micros(),
            avg_reload_micros: self.avg_reload_micros(),
            avg_pointer_redirect_micros: self.avg_pointer_redirect_micros(),
            avg_page_expand_micros: self.avg_page_expand_micros(),
        }
    }

    // -- recorders (crate-internal) ---------------------------------------

    pub(crate) fn add_used_memory(&self, bytes: usize) {
        self.used_memory.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_used_memory(&self, bytes: usize) {
        self.used_memory.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_preallocated(&self, bytes: usize) {
        self.preallocated_slab_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.eviction_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.miss_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, vaddr: u64, bytes: usize) {
        self.flushed_buffer_size
            .fetch_add(bytes as u64, Ordering::Relaxed);
        let mut ring = self.flushed_addresses.lock();
        if ring.len() == FLUSHED_RING_LEN {
            ring.pop_front();
        }
        ring.push_back(vaddr);
    }

    pub(crate) fn record_callback_panic(&self) {
        self.callback_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_failure(&self) {
        self.reload_validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_store_failed(&self) {
        self.store_failed.store(true, Ordering::Release);
    }

    pub(crate) fn record_io(&self, d: Duration) {
        self.avg_io.record(d);
    }

    pub(crate) fn record_fetch(&self, d: Duration) {
        self.avg_fetch.record(d);
    }

    pub(crate) fn record_write(&self, d: Duration) {
        self.avg_write.record(d);
    }

    pub(crate) fn record_reload(&self, d: Duration) {
        self.avg_reload.record(d);
    }

    pub(crate) fn record_pointer_redirect(&self, d: Duration) {
        self.avg_pointer_redirect.record(d);
    }

    pub(crate) fn record_page_expand(&self, d: Duration) {
        self.avg_page_expand.record(d);
    }
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub used_memory: usize,
    pub preallocated_slab_size: usize,
    pub eviction_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub flushed_buffer_size: u64,
    pub callback_panics: u64,
    pub reload_validation_failures: u64,
    pub store_failed: bool,
    pub avg_io_micros: f64,
    pub avg_fetch_micros: f64,
    pub avg_write_micros: f64,
    pub avg_reload_micros: f64,
    pub avg_pointer_redirect_micros: f64,
    pub avg_page_expand_micros: f64,
}
