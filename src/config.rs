//! Ball configuration.
//!
//! [`BallConfig`] collects every creation-time option. The struct is
//! plain data with public fields plus builder-style setters for the
//! common knobs; once a ball has been created from it, nothing here can
//! be changed for that ball's lifetime.
//!
//! ## Example
//!
//! ```
//! use pagekit::config::BallConfig;
//!
//! let config = BallConfig::default()
//!     .with_page_size(4096)
//!     .with_initial_page_count(4)
//!     .with_capacity_limit(64 * 1024);
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::PageId;

/// Client hook invoked for every resident eviction, from the worker.
///
/// Receives the evicted page id and a snapshot of the page bytes (empty
/// for large-object entries, whose buffer belongs to the caller).
pub type EvictionCallback = Arc<dyn Fn(PageId, &[u8]) + Send + Sync>;

/// Optional content hash used to validate pages on reload.
pub type HashFunction = Arc<dyn Fn(&[u8]) -> u64 + Send + Sync>;

/// Optional log sink; receives fully formatted lines.
pub type LogFunction = Arc<dyn Fn(&str) + Send + Sync>;

/// Default in-memory ceiling: 1 MiB.
pub const DEFAULT_CAPACITY_LIMIT: usize = 1024 * 1024;

/// Default page size: 4 KiB.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Configuration for a [`Ball`](crate::ball::Ball).
///
/// All options have the defaults listed on each field; `validate()` is
/// called by the factory and rejects inconsistent combinations with
/// [`Error::InvalidArgument`].
#[derive(Clone)]
pub struct BallConfig {
    /// Absolute upper bound on in-memory slab bytes. Default 1 MiB.
    pub capacity_limit: usize,
    /// Number of pages in the first slab. Default 2.
    pub initial_page_count: usize,
    /// Bytes per page; must be a power of two, or 0 to use the OS page
    /// size. Default 4096.
    pub page_size: usize,
    /// Misses-with-eviction between adaptive pool growths. Default 4.
    pub resize_threshold: u32,
    /// Cap on the doubling growth multiplier. Default 8 pages per step.
    pub max_expansion_multiplier: u32,
    /// Hook invoked for resident evictions (from the worker).
    pub eviction_callback: Option<EvictionCallback>,
    /// Content hash recorded at flush and checked on reload.
    pub hash_function: Option<HashFunction>,
    /// Log sink for formatted lines (only used when `enable_logging`).
    pub log_function: Option<LogFunction>,
    /// Reserved; must be false.
    pub use_hybrid_pages: bool,
    /// When true, evictions do not persist and evicted data is lost.
    pub is_volatile: bool,
    /// Frames carry per-frame mutexes.
    pub lockable_pages: bool,
    /// Forward log lines to `log_function`.
    pub enable_logging: bool,
    /// Permit a short-lived thread pool for batch reloads.
    pub enable_burst_mode: bool,
    /// Allocate slabs through the NUMA-aware path.
    pub enable_numa: bool,
}

impl Default for BallConfig {
    fn default() -> Self {
        Self {
            capacity_limit: DEFAULT_CAPACITY_LIMIT,
            initial_page_count: 2,
            page_size: DEFAULT_PAGE_SIZE,
            resize_threshold: 4,
            max_expansion_multiplier: 8,
            eviction_callback: None,
            hash_function: None,
            log_function: None,
            use_hybrid_pages: false,
            is_volatile: false,
            lockable_pages: false,
            enable_logging: false,
            enable_burst_mode: false,
            enable_numa: false,
        }
    }
}

impl BallConfig {
    /// Sets the in-memory capacity ceiling in bytes.
    pub fn with_capacity_limit(mut self, bytes: usize) -> Self {
        self.capacity_limit = bytes;
        self
    }

    /// Sets the initial page count for the first slab.
    pub fn with_initial_page_count(mut self, pages: usize) -> Self {
        self.initial_page_count = pages;
        self
    }

    /// Sets the page size (0 selects the OS page size).
    pub fn with_page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the adaptive-growth miss threshold.
    pub fn with_resize_threshold(mut self, misses: u32) -> Self {
        self.resize_threshold = misses;
        self
    }

    /// Installs the client eviction hook.
    pub fn with_eviction_callback(mut self, cb: EvictionCallback) -> Self {
        self.eviction_callback = Some(cb);
        self
    }

    /// Installs a content hash for reload validation.
    pub fn with_hash_function(mut self, f: HashFunction) -> Self {
        self.hash_function = Some(f);
        self
    }

    /// Installs a log sink and enables logging.
    pub fn with_log_function(mut self, f: LogFunction) -> Self {
        self.log_function = Some(f);
        self.enable_logging = true;
        self
    }

    /// Marks the ball volatile: evicted data is not persisted.
    pub fn volatile(mut self, yes: bool) -> Self {
        self.is_volatile = yes;
        self
    }

    /// Enables per-frame mutexes.
    pub fn lockable(mut self, yes: bool) -> Self {
        self.lockable_pages = yes;
        self
    }

    /// Resolves `page_size`, substituting the OS page size for 0.
    pub fn resolved_page_size(&self) -> usize {
        if self.page_size == 0 {
            crate::mem::os_page_size()
        } else {
            self.page_size
        }
    }

    /// Checks the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let page_size = self.resolved_page_size();
        if !page_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "page_size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.capacity_limit == 0 {
            return Err(Error::InvalidArgument(
                "capacity_limit must be non-zero".into(),
            ));
        }
        if self.capacity_limit < page_size {
            return Err(Error::InvalidArgument(format!(
                "capacity_limit ({}) is smaller than one page ({page_size})",
                self.capacity_limit
            )));
        }
        if self.initial_page_count == 0 {
            return Err(Error::InvalidArgument(
                "initial_page_count must be at least 1".into(),
            ));
        }
        if self.use_hybrid_pages {
            return Err(Error::InvalidArgument(
                "use_hybrid_pages is reserved and must be false".into(),
            ));
        }
        if self.max_expansion_multiplier == 0 {
            return Err(Error::InvalidArgument(
                "max_expansion_multiplier must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BallConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BallConfig")
            .field("capacity_limit", &self.capacity_limit)
            .field("initial_page_count", &self.initial_page_count)
            .field("page_size", &self.page_size)
            .field("resize_threshold", &self.resize_threshold)
            .field("max_expansion_multiplier", &self.max_expansion_multiplier)
            .field("eviction_callback", &self.eviction_callback.is_some())
            .field("hash_function", &self.hash_function.is_some())
            .field("log_function", &self.log_function.is_some())
            .field("use_hybrid_pages", &self.use_hybrid_pages)
            .field("is_volatile", &self.is_volatile)
            .field("lockable_pages", &self.lockable_pages)
            .field("enable_logging", &self.enable_logging)
            .field("enable_burst_mode", &self.enable_burst_mode)
            .field("enable_numa", &self.enable_numa)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(BallConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_page_size_resolves_to_os_page() {
        let config = BallConfig::default().with_page_size(0);
        assert!(config.resolved_page_size().is_power_of_two());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let config = BallConfig::default().with_page_size(3000);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = BallConfig::default().with_capacity_limit(0);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_capacity_below_one_page() {
        let config = BallConfig::default()
            .with_page_size(4096)
            .with_capacity_limit(1024);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_hybrid_pages() {
        let mut config = BallConfig::default();
        config.use_hybrid_pages = true;
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn debug_omits_callback_bodies() {
        let config = BallConfig::default()
            .with_eviction_callback(Arc::new(|_page: PageId, _bytes: &[u8]| {}));
        let dbg = format!("{config:?}");
        assert!(dbg.contains("eviction_callback: true"));
    }
}
